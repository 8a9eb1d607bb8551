/**
 * server/punch.rs
 *
 * Pieces shared by the two hole-punching coordinators: role pairing,
 * negotiation payload assembly, and the ordered send helper that
 * carries the passive-before-active invariant.
 */

use anyhow::{Context, Result};
use std::net::{IpAddr, SocketAddr};
use tokio::io::AsyncWrite;

use crate::server::types::{NatClassification, PunchPlan, Role};
use crate::wire::{self, Message, MessageType};

/// Hole-punching negotiation errors
#[derive(Debug)]
pub enum PunchError {
    ProbeTimeout,
    AddrMismatch { expected: IpAddr, observed: IpAddr },
}

impl std::fmt::Display for PunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PunchError::ProbeTimeout => write!(f, "timed out waiting for peer probes"),
            PunchError::AddrMismatch { expected, observed } => {
                write!(
                    f,
                    "probe source {} does not match control connection {}",
                    observed, expected
                )
            }
        }
    }
}

impl std::error::Error for PunchError {}

pub(crate) fn roles(first_active: bool) -> (Role, Role) {
    if first_active {
        (Role::Active, Role::Passive)
    } else {
        (Role::Passive, Role::Active)
    }
}

pub(crate) fn negotiation_message(
    role: Role,
    my_public_addr: SocketAddr,
    remote_public_addr: SocketAddr,
    remote_nat: NatClassification,
    server_probe_port: u16,
) -> Result<Message> {
    let plan = PunchPlan {
        role,
        my_public_addr,
        remote_public_addr,
        remote_nat,
        server_probe_port,
    };
    let data = serde_json::to_vec(&plan).context("Failed to encode punch plan")?;
    Ok(Message::new(MessageType::PunchingNegotiation).with_data(data))
}

pub(crate) fn start_message(peer_observed_addr: SocketAddr) -> Message {
    Message::new(MessageType::StartPunching).with_data(peer_observed_addr.to_string().into_bytes())
}

/// Send a message to each peer, the passive peer's strictly before the
/// active peer's: the listening side must be primed before the active
/// side can possibly punch early. Every negotiation round goes through
/// here so the ordering holds by construction.
pub(crate) async fn send_passive_first<W1, W2>(
    first: (&mut W1, &Message),
    second: (&mut W2, &Message),
    first_active: bool,
) -> Result<()>
where
    W1: AsyncWrite + Unpin,
    W2: AsyncWrite + Unpin,
{
    if first_active {
        wire::send_framed(second.0, second.1).await?;
        wire::send_framed(first.0, first.1).await?;
    } else {
        wire::send_framed(first.0, first.1).await?;
        wire::send_framed(second.0, second.1).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context as TaskContext, Poll};

    /// Writer that records which peer got bytes first
    struct OrderWriter {
        id: u8,
        log: Arc<Mutex<Vec<u8>>>,
    }

    impl AsyncWrite for OrderWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.log.lock().unwrap().push(self.id);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn passive_peer_is_always_written_first() {
        for first_active in [true, false] {
            let log = Arc::new(Mutex::new(Vec::new()));
            let mut first = OrderWriter { id: 1, log: log.clone() };
            let mut second = OrderWriter { id: 2, log: log.clone() };
            let msg = Message::new(MessageType::StartPunching);

            send_passive_first((&mut first, &msg), (&mut second, &msg), first_active)
                .await
                .unwrap();

            let expected_first = if first_active { 2 } else { 1 };
            assert_eq!(log.lock().unwrap()[0], expected_first);
        }
    }

    #[test]
    fn roles_follow_the_active_flag() {
        assert_eq!(roles(true), (Role::Active, Role::Passive));
        assert_eq!(roles(false), (Role::Passive, Role::Active));
    }
}
