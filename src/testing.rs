//! Test support: an in-process manager speaking the wire protocol over TCP.
//!
//! The mock accepts any number of connections, performs the login handshake
//! against [`PASSWORD`], answers name lookups for one registered server and
//! implements a handful of settings with scripted behaviour.
use std::{
    io::{Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crate::{
    ConnectionConfig,
    auth::password_digest,
    data::{Data, RemoteError},
    protocol::{LOOKUP_SETTING, MANAGER_ID, Packet, PacketStream, WireCodec, WireRecord},
};

pub(crate) const PASSWORD: &str = "secret";
pub(crate) const CHALLENGE: &[u8] = b"mock challenge";
pub(crate) const WELCOME: &str = "Welcome to the mock manager";
pub(crate) const CONNECTION_ID: u32 = 42;
/// Client name the mock refuses to identify.
pub(crate) const REJECTED_NAME: &str = "reject me";

pub(crate) const SERVER_NAME: &str = "Lakeshore 218";
pub(crate) const SERVER_ID: u32 = 10;

/// Replies with the request's records.
pub(crate) const ECHO: u32 = 1;
/// Replies with a success record followed by two error records.
pub(crate) const FAIL: u32 = 2;
/// Never replies.
pub(crate) const HOLD: u32 = 3;
/// Closes the socket.
pub(crate) const HANGUP: u32 = 4;
/// Replies with a list of readings.
pub(crate) const TEMPERATURES: u32 = 5;

const SETTINGS: [(&str, u32); 5] = [
    ("echo", ECHO),
    ("fail", FAIL),
    ("hold", HOLD),
    ("hangup", HANGUP),
    ("temperatures", TEMPERATURES),
];

/// Installs a test logger once; repeated calls are harmless.
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `condition` for up to five seconds.
pub(crate) fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(2));
    }
}

#[derive(Default)]
struct Shared {
    packets: Mutex<Vec<Packet>>,
    lookups: AtomicUsize,
    connections: AtomicUsize,
    closed: AtomicBool,
}

pub(crate) struct MockManager {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockManager {
    pub fn start() -> Self {
        init_logging();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared::default());

        let acceptor = Arc::clone(&shared);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                acceptor.connections.fetch_add(1, Ordering::SeqCst);
                acceptor.closed.store(false, Ordering::SeqCst);
                let shared = Arc::clone(&acceptor);
                thread::spawn(move || serve(stream, shared));
            }
        });

        Self { addr, shared }
    }

    /// Configuration reaching this mock with the right password.
    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig::default()
            .with_host("127.0.0.1")
            .with_port(self.addr.port())
            .with_password(PASSWORD)
    }

    pub fn lookups(&self) -> usize {
        self.shared.lookups.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Every packet received so far, in arrival order.
    pub fn packets(&self) -> Vec<Packet> {
        self.shared.packets.lock().unwrap().clone()
    }

    /// Waits until the most recent client socket has been closed.
    pub fn wait_closed(&self) {
        wait_until(|| self.shared.closed.load(Ordering::SeqCst));
    }
}

enum Step {
    Challenge,
    Password,
    Identify,
    Ready,
}

enum Action {
    Reply(Vec<WireRecord>),
    Ignore,
    Hangup,
}

fn serve(mut stream: TcpStream, shared: Arc<Shared>) {
    let codec = WireCodec::new();
    let mut decoder = PacketStream::new();
    let mut step = Step::Challenge;
    let mut chunk = [0u8; 4096];

    'conn: loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut packets = Vec::new();
        if decoder.feed(&chunk[..n], |p| packets.push(p)).is_err() {
            break;
        }

        for packet in packets {
            shared.packets.lock().unwrap().push(packet.clone());
            match respond(&mut step, &shared, &packet) {
                Action::Reply(records) => {
                    let reply = Packet {
                        target: packet.target,
                        context: packet.context,
                        request: -packet.request,
                        records,
                    };
                    let mut bytes = Vec::new();
                    codec.encode(&reply, &mut bytes).unwrap();
                    if stream.write_all(&bytes).is_err() {
                        break 'conn;
                    }
                }
                Action::Ignore => {}
                Action::Hangup => {
                    let _ = stream.shutdown(Shutdown::Both);
                    break 'conn;
                }
            }
        }
    }
    shared.closed.store(true, Ordering::SeqCst);
}

fn error(code: i32, message: &str) -> Vec<WireRecord> {
    vec![WireRecord::new(0, RemoteError::new(code, message), None)]
}

fn respond(step: &mut Step, shared: &Shared, packet: &Packet) -> Action {
    if packet.request <= 0 {
        return Action::Ignore;
    }
    let first = packet.records.first();

    match step {
        Step::Challenge => {
            *step = Step::Password;
            Action::Reply(vec![WireRecord::new(0, CHALLENGE.to_vec(), None)])
        }
        Step::Password => {
            let expected = password_digest(CHALLENGE, PASSWORD);
            if first.and_then(|r| r.data.as_bytes()) == Some(&expected[..]) {
                *step = Step::Identify;
                Action::Reply(vec![WireRecord::new(0, WELCOME, None)])
            } else {
                Action::Reply(error(1, "Incorrect password"))
            }
        }
        Step::Identify => {
            let name = first
                .and_then(|r| r.data.as_cluster())
                .and_then(|fields| fields.get(1))
                .and_then(Data::as_str);
            match name {
                Some(name) if name != REJECTED_NAME => {
                    *step = Step::Ready;
                    Action::Reply(vec![WireRecord::new(0, CONNECTION_ID, None)])
                }
                _ => Action::Reply(error(2, "invalid identification")),
            }
        }
        Step::Ready if packet.target == MANAGER_ID => match first {
            Some(record) if record.setting == LOOKUP_SETTING => {
                shared.lookups.fetch_add(1, Ordering::SeqCst);
                lookup(&record.data)
            }
            _ => Action::Reply(error(3, "unsupported manager request")),
        },
        Step::Ready if packet.target == SERVER_ID => match first.map(|r| r.setting) {
            Some(ECHO) | None => Action::Reply(packet.records.clone()),
            Some(FAIL) => Action::Reply(vec![
                WireRecord::new(FAIL, Data::Word(0), None),
                WireRecord::new(FAIL, RemoteError::new(13, "first failure"), None),
                WireRecord::new(FAIL, RemoteError::new(14, "second failure"), None),
            ]),
            Some(HOLD) => Action::Ignore,
            Some(HANGUP) => Action::Hangup,
            Some(TEMPERATURES) => Action::Reply(vec![WireRecord::new(
                TEMPERATURES,
                Data::List(vec![Data::Value(4.2), Data::Value(77.3)]),
                None,
            )]),
            Some(other) => Action::Reply(error(4, &format!("unknown setting {other}"))),
        },
        Step::Ready => Action::Reply(error(5, "unknown server")),
    }
}

fn lookup(query: &Data) -> Action {
    let Some([server, names]) = query.as_cluster() else {
        return Action::Reply(error(6, "malformed lookup"));
    };

    let known = match server {
        Data::Str(name) => name == SERVER_NAME,
        Data::Word(id) => *id == SERVER_ID,
        _ => false,
    };
    if !known {
        return Action::Reply(error(7, "unknown server"));
    }

    let mut ids = Vec::new();
    for name in names.as_list().unwrap_or_default() {
        let id = SETTINGS
            .iter()
            .find(|(setting, _)| Some(*setting) == name.as_str())
            .map(|(_, id)| *id);
        match id {
            Some(id) => ids.push(Data::Word(id)),
            None => return Action::Reply(error(8, "unknown setting")),
        }
    }

    Action::Reply(vec![WireRecord::new(
        LOOKUP_SETTING,
        Data::Cluster(vec![Data::Word(SERVER_ID), Data::List(ids)]),
        None,
    )])
}
