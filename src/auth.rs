//! Login handshake with the manager.
//!
//! Immediately after the socket is established the client must prove it knows
//! the manager password and identify itself:
//!
//! 1. an empty request to the manager returns a random challenge;
//! 2. the client answers with `md5(challenge || password)` and receives a
//!    welcome message;
//! 3. the client sends `(protocol version, name)` and receives the id the
//!    manager assigned to this connection.
//!
//! No other request may be issued until the handshake succeeds.
use std::env;

use log::{debug, info};
use md5::{Digest, Md5};

use crate::{
    data::Data,
    error::LoginFailure,
    protocol::{MANAGER_ID, PROTOCOL_VERSION, Requester, WireRecord},
};

/// Environment variable consulted by [`EnvPassword`].
pub const PASSWORD_VAR: &str = "LABRADPASSWORD";

/// Supplies the manager password when the caller does not pass one.
pub trait PasswordSource: Send + Sync {
    fn password(&self) -> Result<String, LoginFailure>;
}

/// Reads the password from [`PASSWORD_VAR`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvPassword;

impl PasswordSource for EnvPassword {
    fn password(&self) -> Result<String, LoginFailure> {
        env::var(PASSWORD_VAR).map_err(|_| LoginFailure::MissingPassword)
    }
}

/// A fixed password.
#[derive(Clone)]
pub struct StaticPassword(pub String);

impl PasswordSource for StaticPassword {
    fn password(&self) -> Result<String, LoginFailure> {
        Ok(self.0.clone())
    }
}

/// Outcome of a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: u32,
    pub welcome: String,
}

/// Digest the manager expects in answer to `challenge`.
pub fn password_digest(challenge: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Md5::new();
    hasher.update(challenge);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

/// Drives the three-step login over `requester`.
pub(crate) fn login<R>(
    requester: &R,
    password: Option<&str>,
    source: &dyn PasswordSource,
    name: &str,
) -> Result<Session, LoginFailure>
where
    R: Requester + ?Sized,
{
    let reply = requester
        .request(MANAGER_ID, vec![])
        .map_err(|e| LoginFailure::Handshake(e.to_string()))?;
    let challenge = first_payload(&reply)
        .and_then(Data::as_bytes)
        .ok_or_else(|| LoginFailure::Handshake("manager sent no challenge".to_string()))?;
    debug!("received {} byte login challenge", challenge.len());

    let password = match password {
        Some(password) => password.to_string(),
        None => source.password()?,
    };
    let digest = password_digest(challenge, &password);
    let reply = requester
        .request(MANAGER_ID, vec![WireRecord::new(0, digest, None)])
        .map_err(|_| LoginFailure::IncorrectPassword)?;
    let welcome = first_payload(&reply)
        .and_then(Data::as_str)
        .unwrap_or_default()
        .to_string();

    let ident = Data::Cluster(vec![Data::Word(PROTOCOL_VERSION), Data::from(name)]);
    let reply = requester
        .request(MANAGER_ID, vec![WireRecord::new(0, ident, None)])
        .map_err(|_| LoginFailure::BadIdentification)?;
    let id = first_payload(&reply)
        .and_then(Data::as_word)
        .ok_or(LoginFailure::BadIdentification)?;

    info!("logged in as '{name}' with connection id {id}");
    Ok(Session { id, welcome })
}

fn first_payload(records: &[WireRecord]) -> Option<&Data> {
    records.first().map(|r| &r.data)
}
