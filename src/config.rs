//! Connection parameters.
//!
//! [`ConnectionConfig`] starts from the built-in defaults and can be overlaid
//! with the usual LabRAD environment variables via
//! [`ConnectionConfig::from_env`]. Explicit setters take precedence over both.
use std::{env, fmt, str::FromStr, time::Duration};

use crate::ConnectionError;

pub const MANAGER_HOST: &str = "localhost";
pub const MANAGER_PORT: u16 = 7682;
pub const MANAGER_PORT_TLS: u16 = 7643;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How the manager connection should be secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TlsMode {
    #[default]
    Off,
    StartTls,
    StartTlsOptional,
    StartTlsForce,
    On,
}

impl FromStr for TlsMode {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" => Ok(TlsMode::Off),
            "starttls" => Ok(TlsMode::StartTls),
            "starttls-optional" => Ok(TlsMode::StartTlsOptional),
            "starttls-force" => Ok(TlsMode::StartTlsForce),
            "on" => Ok(TlsMode::On),
            other => Err(ConnectionError::Config(format!("invalid tls mode '{other}'"))),
        }
    }
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TlsMode::Off => "off",
            TlsMode::StartTls => "starttls",
            TlsMode::StartTlsOptional => "starttls-optional",
            TlsMode::StartTlsForce => "starttls-force",
            TlsMode::On => "on",
        };
        f.write_str(s)
    }
}

#[derive(Clone)]
pub struct ConnectionConfig {
    pub host: String,
    /// Explicit port; when unset the port follows the TLS mode.
    pub port: Option<u16>,
    /// Connect-time timeout for opening the socket.
    pub timeout: Duration,
    /// Manager password; when unset the backend's password source is asked.
    pub password: Option<String>,
    pub tls: TlsMode,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: MANAGER_HOST.to_string(),
            port: None,
            timeout: DEFAULT_TIMEOUT,
            password: None,
            tls: TlsMode::Off,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls)
            .finish()
    }
}

impl ConnectionConfig {
    /// Defaults overlaid with `LABRADHOST`, `LABRADPORT`, `LABRAD_TLS` and
    /// `LABRAD_TIMEOUT` (seconds).
    pub fn from_env() -> Result<Self, ConnectionError> {
        Self::from_vars(|key| env::var(key).ok())
    }

    pub(crate) fn from_vars<F>(var: F) -> Result<Self, ConnectionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = var("LABRADHOST") {
            config.host = host;
        }
        if let Some(port) = var("LABRADPORT") {
            let port = port
                .parse()
                .map_err(|_| ConnectionError::Config(format!("invalid port '{port}'")))?;
            config.port = Some(port);
        }
        if let Some(tls) = var("LABRAD_TLS") {
            config.tls = tls.parse()?;
        }
        if let Some(timeout) = var("LABRAD_TIMEOUT") {
            let secs: f64 = timeout
                .parse()
                .map_err(|_| ConnectionError::Config(format!("invalid timeout '{timeout}'")))?;
            config.timeout = Duration::try_from_secs_f64(secs)
                .map_err(|_| ConnectionError::Config(format!("invalid timeout '{timeout}'")))?;
        }
        Ok(config)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    /// Port to dial, falling back to the well-known manager ports.
    pub fn port(&self) -> u16 {
        match (self.port, self.tls) {
            (Some(port), _) => port,
            (None, TlsMode::On) => MANAGER_PORT_TLS,
            (None, _) => MANAGER_PORT,
        }
    }
}

/// Name of the local node: `LABRADNODE`, else the system host name,
/// lower-cased.
pub fn node_name() -> String {
    node_name_from(|key| env::var(key).ok(), system_hostname)
}

pub(crate) fn node_name_from<F, H>(var: F, hostname: H) -> String
where
    F: Fn(&str) -> Option<String>,
    H: FnOnce() -> Option<String>,
{
    var("LABRADNODE")
        .filter(|v| !v.is_empty())
        .or_else(hostname)
        .unwrap_or_else(|| "localhost".to_string())
        .to_lowercase()
}

fn system_hostname() -> Option<String> {
    gethostname::gethostname()
        .into_string()
        .ok()
        .filter(|name| !name.is_empty())
}

/// Name used when the caller does not choose one.
pub fn default_client_name() -> String {
    format!("Rust Client ({})", node_name())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.host, MANAGER_HOST);
        assert_eq!(config.port(), MANAGER_PORT);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.tls, TlsMode::Off);
    }

    #[test]
    fn tls_mode_selects_default_port() {
        let config = ConnectionConfig::default().with_tls(TlsMode::On);
        assert_eq!(config.port(), MANAGER_PORT_TLS);
        assert_eq!(config.with_port(9000).port(), 9000);
    }

    #[test]
    fn environment_overlay() {
        let config = ConnectionConfig::from_vars(vars(&[
            ("LABRADHOST", "manager.lab"),
            ("LABRADPORT", "7777"),
            ("LABRAD_TLS", "starttls-force"),
            ("LABRAD_TIMEOUT", "1.5"),
        ]))
        .unwrap();

        assert_eq!(config.host, "manager.lab");
        assert_eq!(config.port(), 7777);
        assert_eq!(config.tls, TlsMode::StartTlsForce);
        assert_eq!(config.timeout, Duration::from_millis(1500));
    }

    #[test]
    fn invalid_environment_is_rejected() {
        let bad = [
            ("LABRADPORT", "seventy"),
            ("LABRAD_TLS", "maybe"),
            ("LABRAD_TIMEOUT", "-1"),
        ];
        for pair in bad {
            assert!(matches!(
                ConnectionConfig::from_vars(vars(&[pair])),
                Err(ConnectionError::Config(_))
            ));
        }
    }

    #[test]
    fn tls_modes_round_trip_through_text() {
        for mode in ["off", "starttls", "starttls-optional", "starttls-force", "on"] {
            assert_eq!(mode.parse::<TlsMode>().unwrap().to_string(), mode);
        }
    }

    #[test]
    fn node_name_prefers_environment() {
        let name = node_name_from(vars(&[("LABRADNODE", "Fridge")]), || {
            Some("host".to_string())
        });
        assert_eq!(name, "fridge");
    }

    #[test]
    fn node_name_falls_back_to_system_hostname() {
        let name = node_name_from(vars(&[]), || Some("Lab-PC".to_string()));
        assert_eq!(name, "lab-pc");
        assert_eq!(node_name_from(vars(&[]), || None), "localhost");

        if let Some(host) = system_hostname() {
            assert_eq!(node_name_from(vars(&[]), system_hostname), host.to_lowercase());
        }
    }

    #[test]
    fn debug_hides_password() {
        let config = ConnectionConfig::default().with_password("hunter2");
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
