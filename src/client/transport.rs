use std::{net::SocketAddr, sync::Arc, time::Duration};

use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::TlsConnector;
use url::{Host, Url};

use crate::error::{Error, Result};

/// Plain TCP or TLS, boxed so the engine doesn't care which.
pub(crate) trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub(crate) type BoxStream = Box<dyn Stream>;

/// Where a `ws://` or `wss://` url points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) tls: bool,
    /// Path plus query, sent in the request line.
    pub(crate) resource: String,
    /// Value of the `Host` header.
    pub(crate) authority: String,
}

impl Target {
    pub(crate) fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| Error::InvalidUrl(format!("{raw}: {e}")))?;
        let (tls, default_port) = match url.scheme() {
            "ws" => (false, 80),
            "wss" => (true, 443),
            other => return Err(Error::InvalidUrl(format!("unsupported scheme {other:?}"))),
        };
        let host = match url.host() {
            Some(Host::Domain(d)) => d.to_string(),
            Some(Host::Ipv4(a)) => a.to_string(),
            Some(Host::Ipv6(a)) => a.to_string(),
            None => return Err(Error::InvalidUrl(format!("{raw}: missing host"))),
        };
        let port = url.port().unwrap_or(default_port);
        let host_str = url.host_str().unwrap_or(&host);
        let authority = if port == default_port {
            host_str.to_string()
        } else {
            format!("{host_str}:{port}")
        };
        let resource = match url.query() {
            Some(q) => format!("{}?{q}", url.path()),
            None => url.path().to_string(),
        };

        Ok(Self {
            host,
            port,
            tls,
            resource,
            authority,
        })
    }
}

pub(crate) struct Connected {
    pub(crate) stream: BoxStream,
    pub(crate) local_addr: SocketAddr,
    pub(crate) peer_addr: SocketAddr,
}

/// Opens TCP, then TLS for `wss`.
pub(crate) async fn open(
    target: &Target,
    connect_timeout: Duration,
    tls: Option<Arc<rustls::ClientConfig>>,
) -> Result<Connected> {
    let tcp = timeout(connect_timeout, TcpStream::connect((target.host.as_str(), target.port)))
        .await??;
    tcp.set_nodelay(true)?;
    let local_addr = tcp.local_addr()?;
    let peer_addr = tcp.peer_addr()?;

    let stream: BoxStream = if target.tls {
        let config = tls.unwrap_or_else(default_tls_config);
        let name = ServerName::try_from(target.host.clone())
            .map_err(|e| Error::InvalidUrl(format!("{}: {e}", target.host)))?;
        let tls = timeout(connect_timeout, TlsConnector::from(config).connect(name, tcp)).await??;
        tracing::debug!(host = target.host, "tls established");
        Box::new(tls)
    } else {
        Box::new(tcp)
    };

    Ok(Connected {
        stream,
        local_addr,
        peer_addr,
    })
}

fn default_tls_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports() {
        let t = Target::parse("ws://example.com/chat?room=1").unwrap();
        assert_eq!((t.port, t.tls), (80, false));
        assert_eq!(t.resource, "/chat?room=1");
        assert_eq!(t.authority, "example.com");

        let t = Target::parse("wss://example.com").unwrap();
        assert_eq!((t.port, t.tls), (443, true));
        assert_eq!(t.resource, "/");
    }

    #[test]
    fn explicit_port_in_authority() {
        let t = Target::parse("ws://127.0.0.1:9001/").unwrap();
        assert_eq!(t.host, "127.0.0.1");
        assert_eq!(t.authority, "127.0.0.1:9001");

        let t = Target::parse("ws://[::1]:9001").unwrap();
        assert_eq!(t.host, "::1");
        assert_eq!(t.authority, "[::1]:9001");
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(matches!(Target::parse("http://example.com"), Err(Error::InvalidUrl(_))));
        assert!(matches!(Target::parse("not a url"), Err(Error::InvalidUrl(_))));
    }
}
