//! Proxy configuration.
//!
//! The dial target comes from `IDLER_*` environment variables at startup
//! and can be replaced at runtime through [`Control::SetServerConfig`].
//!
//! [`Control::SetServerConfig`]: crate::proxy::Control::SetServerConfig

/// Where the proxy dials out to, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// IRC server hostname.
    pub host: String,
    /// IRC server port.
    pub port: u16,
    /// Dial with TLS.
    pub tls: bool,
}

impl ServerConfig {
    /// Read the dial target from `IDLER_SERVER`, `IDLER_PORT` and
    /// `IDLER_TLS`. Missing variables fall back to a local ircd.
    pub fn from_env() -> Self {
        let host = std::env::var("IDLER_SERVER").unwrap_or_else(|_| "127.0.0.1".into());
        let port = std::env::var("IDLER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(6667);
        let tls = std::env::var("IDLER_TLS").is_ok_and(|v| v == "1" || v == "true");
        Self { host, port, tls }
    }

    /// `host:port`, as handed to the dialer.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
