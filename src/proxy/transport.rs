//! Proxy transport: opens a TCP (optionally TLS-upgraded) session against a
//! candidate proxy's own `host:port` and exchanges framed bytes over it.
//!
//! This is distinct from `egress`-style tunneling through an *upstream*
//! proxy: here the candidate endpoint under test is the thing being dialed
//! directly, per the negotiator contract in `proxy::negotiator`.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{Result, RotaError};

enum Conn {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// One active session against a single proxy endpoint. A `Transport` is
/// created fresh for every `connect`; `close` must run before reconnecting.
pub struct Transport {
    host: Ipv4Addr,
    port: u16,
    timeout: Duration,
    conn: Option<Conn>,
}

/// Lazily-built TLS config that skips certificate verification, used for the
/// default (non-`verify_ssl`) HTTPS negotiator path against proxies whose
/// certificates are rarely trustworthy anyway.
mod insecure_tls {
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub struct NoVerify;

    impl ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ED25519,
                SignatureScheme::RSA_PSS_SHA256,
            ]
        }
    }
}

impl Transport {
    pub fn new(host: Ipv4Addr, port: u16, timeout: Duration) -> Self {
        Transport {
            host,
            port,
            timeout,
            conn: None,
        }
    }

    /// Opens TCP to `host:port`; with `tls=true`, upgrades in place (SNI =
    /// the proxy's own host). Fails with `ProxyTimeoutError` on deadline,
    /// `ProxyConnError` on refusal/TLS failure.
    pub async fn connect(&mut self, tls: bool, verify_ssl: bool) -> Result<()> {
        let addr = (self.host, self.port);
        let tcp = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RotaError::ProxyTimeoutError)?
            .map_err(|e| RotaError::ProxyConnError(e.to_string()))?;

        self.conn = Some(if tls {
            let connector = self.tls_connector(verify_ssl)?;
            let server_name = ServerName::IpAddress(self.host.into());
            let stream = timeout(self.timeout, connector.connect(server_name, tcp))
                .await
                .map_err(|_| RotaError::ProxyTimeoutError)?
                .map_err(|e| RotaError::ProxyConnError(format!("TLS handshake failed: {e}")))?;
            Conn::Tls(Box::new(stream))
        } else {
            Conn::Plain(tcp)
        });
        Ok(())
    }

    fn tls_connector(&self, verify_ssl: bool) -> Result<TlsConnector> {
        let config = if verify_ssl {
            let mut roots = RootCertStore::empty();
            roots.extend(
                rustls_native_certs::load_native_certs()
                    .certs
                    .into_iter(),
            );
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(insecure_tls::NoVerify))
                .with_no_client_auth()
        };
        Ok(TlsConnector::from(Arc::new(config)))
    }

    /// Wraps the already-connected plain TCP session in TLS; used by the
    /// HTTPS negotiator after a successful `CONNECT`.
    pub async fn upgrade_tls(&mut self, verify_ssl: bool) -> Result<()> {
        let Some(Conn::Plain(tcp)) = self.conn.take() else {
            return Err(RotaError::Internal(
                "upgrade_tls called without a plain connection".into(),
            ));
        };
        let connector = self.tls_connector(verify_ssl)?;
        let server_name = ServerName::IpAddress(self.host.into());
        let stream = timeout(self.timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| RotaError::ProxyTimeoutError)?
            .map_err(|e| RotaError::ProxyConnError(format!("TLS handshake failed: {e}")))?;
        self.conn = Some(Conn::Tls(Box::new(stream)));
        Ok(())
    }

    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| RotaError::Internal("send on unconnected transport".into()))?;
        let res = match conn {
            Conn::Plain(s) => timeout(self.timeout, s.write_all(bytes)).await,
            Conn::Tls(s) => timeout(self.timeout, s.write_all(bytes)).await,
        };
        match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RotaError::ProxySendError(e.to_string())),
            Err(_) => Err(RotaError::ProxyTimeoutError),
        }
    }

    /// Reads exactly `length` bytes, looping across short reads (a single
    /// TCP segment rarely carries the whole reply). A short read at EOF
    /// truncates the buffer rather than erroring.
    pub async fn recv_exact(&mut self, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length];
        let mut read = 0;
        while read < length {
            let n = self.read_some(&mut buf[read..]).await?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        if read == 0 {
            return Err(RotaError::ProxyEmptyRecvError);
        }
        Ok(buf)
    }

    /// Reads until a blank-line (`\r\n\r\n`) terminator, returning everything
    /// read including the terminator.
    pub async fn recv_head(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read_some(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
                buf.truncate(pos + 4);
                break;
            }
        }
        if buf.is_empty() {
            return Err(RotaError::ProxyEmptyRecvError);
        }
        Ok(buf)
    }

    /// Default recv mode: reads headers, then dispatches on `Content-Length`
    /// / `Transfer-Encoding: chunked` / EOF to read the body.
    pub async fn recv_response(&mut self) -> Result<Vec<u8>> {
        let mut buf = self.recv_head().await?;
        let header_text = String::from_utf8_lossy(&buf).to_lowercase();

        if let Some(len) = content_length(&header_text) {
            let mut body = vec![0u8; len];
            let mut read = 0;
            while read < len {
                let n = self.read_some(&mut body[read..]).await?;
                if n == 0 {
                    break;
                }
                read += n;
            }
            body.truncate(read);
            buf.extend_from_slice(&body);
        } else if header_text.contains("transfer-encoding: chunked") {
            loop {
                let mut chunk = [0u8; 4096];
                let n = self.read_some(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if buf.ends_with(b"0\r\n\r\n") || find_subslice(&buf, b"\r\n0\r\n").is_some() {
                    break;
                }
            }
        } else {
            loop {
                let mut chunk = [0u8; 4096];
                let n = match self.read_some(&mut chunk).await {
                    Ok(n) => n,
                    Err(RotaError::ProxyEmptyRecvError) => break,
                    Err(e) => return Err(e),
                };
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        }
        Ok(buf)
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| RotaError::Internal("recv on unconnected transport".into()))?;
        let res = match conn {
            Conn::Plain(s) => timeout(self.timeout, s.read(buf)).await,
            Conn::Tls(s) => timeout(self.timeout, s.read(buf)).await,
        };
        match res {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(RotaError::ProxyRecvError(e.to_string())),
            Err(_) => Err(RotaError::ProxyTimeoutError),
        }
    }

    /// Consumes the transport into independent read/write halves for
    /// concurrent bidirectional forwarding (the dispatch server's use case;
    /// the checker never needs this since it only ever does sequential
    /// request/response exchanges).
    pub fn into_split(
        mut self,
    ) -> Result<(
        Box<dyn tokio::io::AsyncRead + Unpin + Send>,
        Box<dyn tokio::io::AsyncWrite + Unpin + Send>,
    )> {
        match self.conn.take() {
            Some(Conn::Plain(tcp)) => {
                let (r, w) = tcp.into_split();
                Ok((Box::new(r), Box::new(w)))
            }
            Some(Conn::Tls(tls)) => {
                let (r, w) = tokio::io::split(*tls);
                Ok((Box::new(r), Box::new(w)))
            }
            None => Err(RotaError::Internal(
                "split on unconnected transport".into(),
            )),
        }
    }

    /// Idempotent; releases TLS before TCP.
    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            match conn {
                Conn::Plain(mut s) => {
                    let _ = s.shutdown().await;
                }
                Conn::Tls(mut s) => {
                    let _ = s.shutdown().await;
                }
            }
        }
        debug!(host = %self.host, port = self.port, "transport closed");
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn content_length(lowercased_headers: &str) -> Option<usize> {
    for line in lowercased_headers.lines() {
        if let Some(rest) = line.strip_prefix("content-length:") {
            if let Ok(n) = rest.trim().parse() {
                return Some(n);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_and_send_recv_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await.unwrap();
        });

        let mut t = Transport::new(Ipv4Addr::LOCALHOST, addr.port(), Duration::from_secs(2));
        t.connect(false, false).await.unwrap();
        t.send(b"hello").await.unwrap();
        let resp = t.recv_response().await.unwrap();
        assert!(resp.ends_with(b"hi"));
        server.await.unwrap();
    }

    #[test]
    fn content_length_parses_case_insensitively() {
        assert_eq!(
            content_length("http/1.1 200 ok\r\ncontent-length: 42\r\n\r\n"),
            Some(42)
        );
        assert_eq!(content_length("http/1.1 200 ok\r\n\r\n"), None);
    }
}
