//! TCP transport used for push/pull anti-entropy exchanges. Each inbound
//! connection is handled by a short-lived task; framing is a plain u32
//! big-endian length prefix around an already-sealed (label/encrypt)
//! payload, matching the wrapper scheme used on the UDP path.

use crate::error::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const MAX_TCP_MESSAGE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    pub bind_addr: SocketAddr,
    pub connect_timeout: std::time::Duration,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7946".parse().unwrap(),
            connect_timeout: std::time::Duration::from_secs(10),
        }
    }
}

/// An accepted inbound connection, handed to the caller for push/pull
/// reconciliation.
pub struct Inbound {
    pub peer_addr: SocketAddr,
    pub stream: TcpStream,
}

pub struct TcpTransport {
    listener: Arc<TcpListener>,
    local_addr: SocketAddr,
}

impl TcpTransport {
    pub async fn bind(config: TcpTransportConfig) -> Result<(Self, mpsc::Receiver<Inbound>)> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let listener = Arc::new(listener);
        let (tx, rx) = mpsc::channel(64);

        let accept_listener = listener.clone();
        tokio::spawn(async move {
            loop {
                match accept_listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        if tx.send(Inbound { peer_addr, stream }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "tcp accept failed");
                    }
                }
            }
        });

        Ok((Self { listener, local_addr }, rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn connect(&self, addr: SocketAddr) -> Result<TcpStream> {
        Ok(TcpStream::connect(addr).await?)
    }
}

/// Write a single length-prefixed frame.
pub async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| crate::error::NserfError::Transport("frame too large to encode".into()))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a single length-prefixed frame.
pub async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_TCP_MESSAGE {
        return Err(crate::error::NserfError::Transport(format!(
            "frame of {} bytes exceeds max {}",
            len, MAX_TCP_MESSAGE
        )));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_over_a_real_socket() {
        let (transport, mut inbound) = TcpTransport::bind(TcpTransportConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        })
        .await
        .unwrap();
        let addr = transport.local_addr();

        let server = tokio::spawn(async move {
            let conn = inbound.recv().await.unwrap();
            let mut stream = conn.stream;
            let frame = read_frame(&mut stream).await.unwrap();
            write_frame(&mut stream, &frame).await.unwrap();
        });

        let mut client = transport.connect(addr).await.unwrap();
        write_frame(&mut client, b"push-pull-payload").await.unwrap();
        let echoed = read_frame(&mut client).await.unwrap();
        assert_eq!(echoed, b"push-pull-payload");

        server.await.unwrap();
    }
}
