//! UDP transport for probes and gossip. Inbound packets are handed to a
//! bounded channel so the receive loop never blocks on a slow consumer;
//! the minimal decode-and-enqueue step is the only work done on this task.

use crate::codec::UDP_SIZE_BUDGET;
use crate::error::{NserfError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct UdpTransportConfig {
    pub bind_addr: SocketAddr,
    pub recv_queue_size: usize,
}

impl Default for UdpTransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7946".parse().unwrap(),
            recv_queue_size: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UdpPacket {
    pub from: SocketAddr,
    pub payload: Vec<u8>,
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub async fn bind(config: UdpTransportConfig) -> Result<(Self, mpsc::Receiver<UdpPacket>)> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let (tx, rx) = mpsc::channel(config.recv_queue_size);

        let recv_socket = socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                let (len, from) = match recv_socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "udp recv_from failed");
                        continue;
                    }
                };
                let packet = UdpPacket {
                    from,
                    payload: buf[..len].to_vec(),
                };
                if tx.send(packet).await.is_err() {
                    break; // receiver dropped, shut the loop down
                }
            }
        });

        Ok((Self { socket }, rx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn send_to(&self, addr: SocketAddr, payload: &[u8]) -> Result<()> {
        if payload.len() > UDP_SIZE_BUDGET {
            return Err(NserfError::Transport(format!(
                "udp payload of {} bytes exceeds budget of {}, should have used tcp",
                payload.len(),
                UDP_SIZE_BUDGET
            )));
        }
        self.socket.send_to(payload, addr).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_and_receives_a_packet() {
        let (a, _a_rx) = UdpTransport::bind(UdpTransportConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            recv_queue_size: 8,
        })
        .await
        .unwrap();
        let (b, mut b_rx) = UdpTransport::bind(UdpTransportConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            recv_queue_size: 8,
        })
        .await
        .unwrap();

        a.send_to(b.local_addr().unwrap(), b"hello").await.unwrap();
        let packet = b_rx.recv().await.unwrap();
        assert_eq!(packet.payload, b"hello");
    }

    #[tokio::test]
    async fn rejects_oversized_payload() {
        let (a, _rx) = UdpTransport::bind(UdpTransportConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            recv_queue_size: 8,
        })
        .await
        .unwrap();
        let big = vec![0u8; UDP_SIZE_BUDGET + 1];
        assert!(a.send_to("127.0.0.1:1".parse().unwrap(), &big).await.is_err());
    }
}
