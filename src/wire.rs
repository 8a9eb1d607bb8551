/**
 * wire.rs
 *
 * Typed message envelope plus the framed transport primitives:
 * length-prefixed JSON over a stream, one JSON message per datagram over UDP.
 */

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// Upper bound on one framed message or datagram
pub const MAX_FRAME: usize = 64 * 1024;

/// Wire message types. The snake_case tags are the published contract
/// that both peer client implementations agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TestNatType,
    PortNegotiation,
    PortNegotiationResponse,
    ServerPortChangeTest,
    ServerPortChangeTestResponse,
    ProtocolChangeTest,
    Connection,
    PunchingNegotiation,
    StartPunching,
    Ack,
    EndResult,
    ErrorResponse,
}

/// Discriminated message envelope. `msg_type` determines the expected
/// shape of `data`; a payload that fails to decode is a local error on
/// the receiving side, not a protocol violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity_token: String,

    /// Opaque, type-dependent payload
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,

    /// Observed source address. Filled by the receive path, never sent.
    #[serde(skip)]
    pub src_public_addr: Option<SocketAddr>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_info: String,
}

impl Message {
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            identity_token: String::new(),
            data: Vec::new(),
            src_public_addr: None,
            error_info: String::new(),
        }
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.identity_token = token.to_string();
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Build an `ErrorResponse` carrying diagnostic text
    pub fn error(info: &str) -> Self {
        let mut msg = Self::new(MessageType::ErrorResponse);
        msg.error_info = info.to_string();
        msg
    }

    /// Observed source address, or an error when the transport never set one
    pub fn source(&self) -> Result<SocketAddr> {
        self.src_public_addr
            .ok_or_else(|| anyhow!("message has no observed source address"))
    }
}

/// Write one length-framed message
pub async fn send_framed<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    let body = serde_json::to_vec(msg).context("Message serialization failed")?;
    if body.len() > MAX_FRAME {
        return Err(anyhow!("message of {} bytes exceeds frame limit", body.len()));
    }

    writer
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .context("Failed to write frame length")?;
    writer
        .write_all(&body)
        .await
        .context("Failed to write frame body")?;
    writer.flush().await.context("Failed to flush frame")?;

    Ok(())
}

/// Read one length-framed message
pub async fn read_framed<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .context("Failed to read frame length")?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(anyhow!("frame of {} bytes exceeds frame limit", len));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .context("Failed to read frame body")?;

    serde_json::from_slice(&body).context("Failed to decode framed message")
}

pub async fn tcp_send_message(stream: &mut TcpStream, msg: &Message) -> Result<()> {
    send_framed(stream, msg).await
}

/// Receive one framed message and stamp it with the connection's peer address
pub async fn tcp_receive_message(stream: &mut TcpStream) -> Result<Message> {
    let peer = stream.peer_addr().context("Failed to read peer address")?;
    let mut msg = read_framed(stream).await?;
    msg.src_public_addr = Some(peer);
    Ok(msg)
}

pub async fn udp_send_message(socket: &UdpSocket, addr: SocketAddr, msg: &Message) -> Result<()> {
    let body = serde_json::to_vec(msg).context("Message serialization failed")?;
    if body.len() > MAX_FRAME {
        return Err(anyhow!("message of {} bytes exceeds datagram limit", body.len()));
    }

    socket
        .send_to(&body, addr)
        .await
        .context("UDP send failed")?;

    Ok(())
}

/// Receive one datagram message. `wait` of `None` blocks indefinitely;
/// the message is stamped with the datagram's source address.
pub async fn udp_receive_message(
    socket: &UdpSocket,
    wait: Option<Duration>,
) -> Result<(Message, SocketAddr)> {
    let mut buf = vec![0u8; MAX_FRAME];

    let (len, addr) = match wait {
        Some(d) => tokio::time::timeout(d, socket.recv_from(&mut buf))
            .await
            .map_err(|_| anyhow!("UDP receive timed out"))?
            .context("UDP receive failed")?,
        None => socket.recv_from(&mut buf).await.context("UDP receive failed")?,
    };

    let mut msg: Message =
        serde_json::from_slice(&buf[..len]).context("Failed to decode datagram message")?;
    msg.src_public_addr = Some(addr);

    Ok((msg, addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn framed_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let msg = Message::new(MessageType::Connection)
            .with_token("abc123UDP")
            .with_data(b"payload".to_vec());
        send_framed(&mut a, &msg).await.unwrap();

        let got = read_framed(&mut b).await.unwrap();
        assert_eq!(got.msg_type, MessageType::Connection);
        assert_eq!(got.identity_token, "abc123UDP");
        assert_eq!(got.data, b"payload");
        assert!(got.src_public_addr.is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);

        tokio::spawn(async move {
            let huge = (MAX_FRAME as u32 + 1).to_be_bytes();
            let _ = a.write_all(&huge).await;
        });

        assert!(read_framed(&mut b).await.is_err());
    }

    #[test]
    fn empty_fields_are_omitted_on_the_wire() {
        let text = serde_json::to_string(&Message::new(MessageType::Ack)).unwrap();
        assert_eq!(text, r#"{"type":"ack"}"#);
    }

    #[test]
    fn source_address_is_never_serialized() {
        let mut msg = Message::new(MessageType::Ack);
        msg.src_public_addr = Some("1.2.3.4:5000".parse().unwrap());
        let text = serde_json::to_string(&msg).unwrap();
        assert!(!text.contains("1.2.3.4"));
    }
}
