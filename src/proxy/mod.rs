//! The idler proxy core: session state, endpoint adapters, and the
//! controller that mediates between one IRC client and one IRC server.

pub mod controller;
pub mod endpoint;
pub mod session;

pub use controller::Proxy;
pub use endpoint::Endpoint;
pub use session::{Phase, SessionState};

use std::future::Future;
use std::io;
use std::sync::{Arc, LazyLock};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::config::ServerConfig;

/// The proxy's own identity — the prefix on every message it authors
/// (synthesized welcomes, error NOTICEs).
pub const PROXY_NAME: &str = "irc-idler";

/// Control messages from the host (web UI, signal handler).
#[derive(Debug)]
pub enum Control {
    /// Read the current dial target.
    GetServerConfig(oneshot::Sender<ServerConfig>),
    /// Replace the dial target. Tears down the running session.
    SetServerConfig(ServerConfig),
    /// Network availability changed. While false, nothing is dialed and
    /// client connections are refused.
    HaveNetwork(bool),
    /// Stop the proxy.
    Shutdown,
}

/// Produces the server-side byte stream for a dial target.
///
/// The controller only sees this seam; production uses [`TcpDialer`],
/// tests substitute scripted in-memory streams.
pub trait Dialer: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    fn dial(
        &mut self,
        config: &ServerConfig,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Object-safe alias for "any bidirectional byte stream".
pub trait AnyStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AnyStream for T {}

/// What [`TcpDialer`] hands back: plain TCP or TLS, behind one type.
pub type BoxedStream = Box<dyn AnyStream>;

static TLS_CONFIG: LazyLock<Arc<ClientConfig>> = LazyLock::new(|| {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
});

/// Dials the configured server over TCP, wrapping in TLS when asked.
#[derive(Debug, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    type Stream = BoxedStream;

    fn dial(
        &mut self,
        config: &ServerConfig,
    ) -> impl Future<Output = io::Result<BoxedStream>> + Send {
        let addr = config.addr();
        let host = config.host.clone();
        let tls = config.tls;
        async move {
            let tcp = TcpStream::connect(&addr).await?;
            if !tls {
                return Ok(Box::new(tcp) as BoxedStream);
            }
            let name = ServerName::try_from(host)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let connector = TlsConnector::from(Arc::clone(&TLS_CONFIG));
            let stream = connector.connect(name, tcp).await?;
            Ok(Box::new(stream) as BoxedStream)
        }
    }
}
