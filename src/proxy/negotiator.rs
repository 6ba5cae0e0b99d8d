//! Per-protocol handshakes. Represented as a sealed enum rather than a trait
//! hierarchy (per the design note on dynamic negotiator dispatch) since the
//! six variants are closed and known at compile time.

use std::net::Ipv4Addr;

use crate::error::{Result, RotaError};
use crate::proxy::record::ProtocolTag;
use crate::proxy::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatorKind(pub ProtocolTag);

impl NegotiatorKind {
    pub fn tag(&self) -> ProtocolTag {
        self.0
    }

    /// Whether a successful negotiation should be followed by the checker's
    /// judge GET/POST and anonymity classification.
    pub fn check_anon_lvl(&self) -> bool {
        matches!(self.0, ProtocolTag::Http)
    }

    /// Whether the follow-up judge request must use the full absolute URI
    /// (`GET http://host/path ...`) rather than an origin-form path.
    pub fn use_full_path(&self) -> bool {
        matches!(self.0, ProtocolTag::Http)
    }

    /// Runs the handshake. `host`/`ip` identify the judge (or, from the
    /// dispatch server, the client's requested target); `port` is only
    /// consulted by the SOCKS variants, since the CONNECT variants target a
    /// fixed well-known port per tag.
    pub async fn negotiate(
        &self,
        transport: &mut Transport,
        host: &str,
        ip: Ipv4Addr,
        port: u16,
        verify_ssl: bool,
    ) -> Result<()> {
        match self.0 {
            ProtocolTag::Http => Ok(()),
            ProtocolTag::Https => connect_then(transport, host, 443, verify_ssl).await,
            ProtocolTag::Connect80 => connect_only(transport, host, 80).await,
            ProtocolTag::Connect25 => connect_smtp(transport, host).await,
            ProtocolTag::Socks4 => socks4(transport, ip, port).await,
            ProtocolTag::Socks5 => socks5(transport, ip, port).await,
        }
    }
}

fn connect_request(host: &str, port: u16) -> Vec<u8> {
    format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n"
    )
    .into_bytes()
}

async fn require_200(transport: &mut Transport) -> Result<()> {
    let head = transport.recv_head().await?;
    let line = head
        .split(|&b| b == b'\r' || b == b'\n')
        .next()
        .unwrap_or(&[]);
    let text = String::from_utf8_lossy(line);
    if !text.contains("200") {
        return Err(RotaError::BadStatusError(text.trim().to_string()));
    }
    Ok(())
}

async fn connect_only(transport: &mut Transport, host: &str, port: u16) -> Result<()> {
    transport.send(&connect_request(host, port)).await?;
    require_200(transport).await
}

async fn connect_then(
    transport: &mut Transport,
    host: &str,
    port: u16,
    verify_ssl: bool,
) -> Result<()> {
    connect_only(transport, host, port).await?;
    transport.upgrade_tls(verify_ssl).await
}

async fn connect_smtp(transport: &mut Transport, host: &str) -> Result<()> {
    connect_only(transport, host, 25).await?;
    let greeting = transport.recv_exact(3).await?;
    if greeting != b"220" {
        return Err(RotaError::BadResponseError);
    }
    Ok(())
}

async fn socks4(transport: &mut Transport, ip: Ipv4Addr, port: u16) -> Result<()> {
    let mut req = Vec::with_capacity(9);
    req.push(0x04);
    req.push(0x01);
    req.extend_from_slice(&port.to_be_bytes());
    req.extend_from_slice(&ip.octets());
    req.push(0x00);
    transport.send(&req).await?;

    let resp = transport.recv_exact(8).await?;
    if resp.len() < 2 || resp[0] != 0x00 || resp[1] != 0x5A {
        return Err(RotaError::BadResponseError);
    }
    Ok(())
}

async fn socks5(transport: &mut Transport, ip: Ipv4Addr, port: u16) -> Result<()> {
    transport.send(&[0x05, 0x01, 0x00]).await?;
    let greeting = transport.recv_exact(2).await?;
    if greeting.len() < 2 || greeting[0] != 0x05 || greeting[1] != 0x00 {
        return Err(RotaError::BadResponseError);
    }

    let mut req = Vec::with_capacity(10);
    req.extend_from_slice(&[0x05, 0x01, 0x00, 0x01]);
    req.extend_from_slice(&ip.octets());
    req.extend_from_slice(&port.to_be_bytes());
    transport.send(&req).await?;

    let resp = transport.recv_exact(10).await?;
    if resp.len() < 2 || resp[0] != 0x05 || resp[1] != 0x00 {
        return Err(RotaError::BadResponseError);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn socks5_handshake_matches_byte_layout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut req = [0u8; 10];
            stream.read_exact(&mut req).await.unwrap();
            assert_eq!(&req[..4], &[0x05, 0x01, 0x00, 0x01]);
            assert_eq!(&req[4..8], &[192, 168, 0, 24]);
            assert_eq!(u16::from_be_bytes([req[8], req[9]]), 80);

            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 192, 168, 0, 24, 0xce, 0xdf])
                .await
                .unwrap();
        });

        let mut t = Transport::new(
            "127.0.0.1".parse().unwrap(),
            addr.port(),
            Duration::from_secs(2),
        );
        t.connect(false, false).await.unwrap();
        socks5(&mut t, Ipv4Addr::new(192, 168, 0, 24), 80)
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn socks4_rejects_non_granted_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 9];
            stream.read_exact(&mut req).await.unwrap();
            stream
                .write_all(&[0x00, 0x5B, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let mut t = Transport::new(
            "127.0.0.1".parse().unwrap(),
            addr.port(),
            Duration::from_secs(2),
        );
        t.connect(false, false).await.unwrap();
        let err = socks4(&mut t, Ipv4Addr::new(10, 0, 0, 1), 80)
            .await
            .unwrap_err();
        assert!(matches!(err, RotaError::BadResponseError));
        server.await.unwrap();
    }
}
