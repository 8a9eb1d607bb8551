/**
 * rudp.rs
 *
 * Minimal reliability wrapper over a datagram socket: sequence-numbered
 * packets, ack on receive, per-source duplicate suppression, and a
 * retransmit-until-acked send. The server side uses it transiently to
 * observe a peer's externally mapped address; it accepts delivery from
 * any source.
 */

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

use crate::wire::MAX_FRAME;

const KIND_DATA: u8 = 1;
const KIND_ACK: u8 = 2;
const HEADER_LEN: usize = 5;

const SEND_RETRIES: usize = 8;
const RETRY_INTERVAL: Duration = Duration::from_millis(250);

pub struct ReliableUdp {
    socket: UdpSocket,
    next_seq: u32,
    seen: HashMap<SocketAddr, u32>,
}

impl ReliableUdp {
    /// Bind a fresh ephemeral socket
    pub async fn bind() -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("Failed to bind UDP socket")?;
        Ok(Self::from_socket(socket))
    }

    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket,
            next_seq: rand::random::<u32>(),
            seen: HashMap::new(),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("Failed to read local address")
    }

    /// Receive one delivered payload from any source, acking it so the
    /// sender stops retransmitting. `wait` of `None` blocks indefinitely.
    pub async fn recv(&mut self, wait: Option<Duration>) -> Result<(Vec<u8>, SocketAddr)> {
        match wait {
            Some(d) => tokio::time::timeout(d, self.recv_inner())
                .await
                .map_err(|_| anyhow!("reliable UDP receive timed out"))?,
            None => self.recv_inner().await,
        }
    }

    async fn recv_inner(&mut self) -> Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_FRAME + HEADER_LEN];

        loop {
            let (len, addr) = self
                .socket
                .recv_from(&mut buf)
                .await
                .context("UDP receive failed")?;
            if len < HEADER_LEN || buf[0] != KIND_DATA {
                continue;
            }

            let seq = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);

            // Ack unconditionally; the sender retransmits until it hears one
            let mut ack = [0u8; HEADER_LEN];
            ack[0] = KIND_ACK;
            ack[1..].copy_from_slice(&seq.to_be_bytes());
            let _ = self.socket.send_to(&ack, addr).await;

            // Retransmitted duplicate
            if self.seen.get(&addr) == Some(&seq) {
                continue;
            }
            self.seen.insert(addr, seq);

            return Ok((buf[HEADER_LEN..len].to_vec(), addr));
        }
    }

    /// Send one payload, retransmitting until the receiver acks it
    pub async fn send(&mut self, payload: &[u8], addr: SocketAddr) -> Result<()> {
        if payload.len() > MAX_FRAME {
            return Err(anyhow!("payload of {} bytes exceeds datagram limit", payload.len()));
        }

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.push(KIND_DATA);
        packet.extend_from_slice(&seq.to_be_bytes());
        packet.extend_from_slice(payload);

        let mut ack_buf = [0u8; 64];
        for _ in 0..SEND_RETRIES {
            self.socket
                .send_to(&packet, addr)
                .await
                .context("UDP send failed")?;

            match tokio::time::timeout(RETRY_INTERVAL, self.socket.recv_from(&mut ack_buf)).await {
                Ok(Ok((len, from)))
                    if from == addr
                        && len >= HEADER_LEN
                        && ack_buf[0] == KIND_ACK
                        && ack_buf[1..HEADER_LEN] == seq.to_be_bytes() =>
                {
                    return Ok(());
                }
                _ => continue,
            }
        }

        Err(anyhow!("no ack from {} after {} attempts", addr, SEND_RETRIES))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_and_receive_round_trip() {
        let mut a = ReliableUdp::bind().await.unwrap();
        let mut b = ReliableUdp::bind().await.unwrap();
        let b_addr: SocketAddr = format!("127.0.0.1:{}", b.local_addr().unwrap().port())
            .parse()
            .unwrap();

        let recv_task = tokio::spawn(async move {
            let (payload, _) = b.recv(Some(Duration::from_secs(2))).await.unwrap();
            payload
        });

        a.send(b"probe", b_addr).await.unwrap();
        assert_eq!(recv_task.await.unwrap(), b"probe");
    }

    #[tokio::test]
    async fn retransmitted_duplicate_is_suppressed() {
        let mut receiver = ReliableUdp::bind().await.unwrap();
        let addr: SocketAddr = format!("127.0.0.1:{}", receiver.local_addr().unwrap().port())
            .parse()
            .unwrap();

        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut packet = vec![KIND_DATA];
        packet.extend_from_slice(&42u32.to_be_bytes());
        packet.extend_from_slice(b"dup");
        raw.send_to(&packet, addr).await.unwrap();
        raw.send_to(&packet, addr).await.unwrap();

        let (payload, _) = receiver.recv(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(payload, b"dup");

        // The retransmission must not surface as a second delivery
        assert!(receiver.recv(Some(Duration::from_millis(200))).await.is_err());

        // And the sender heard at least one ack
        let mut ack = [0u8; 16];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), raw.recv_from(&mut ack))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack[0], KIND_ACK);
        assert_eq!(len, HEADER_LEN);
    }
}
