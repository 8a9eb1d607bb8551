/**
 * server/matcher.rs
 *
 * Control-channel listener and the token-based rendezvous matcher.
 * Accepts stream connections, decodes one framed message, and either
 * forwards it into the classification engine or pairs it with the
 * other connection sharing its token.
 */

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::registry::{RegistryError, TokenRegistry};
use crate::server::types::{NatClassification, PunchMode};
use crate::server::{punch_tcp, punch_udp, Timeouts};
use crate::wire::{self, Message, MessageType};

/// An in-flight connection waiting for its counterpart. Ownership of the
/// stream moves with the value.
pub struct PendingPeer {
    pub stream: TcpStream,
    pub nat: NatClassification,
}

pub struct ControlListener {
    listener: TcpListener,
    classify_tx: mpsc::Sender<Message>,
    rendezvous: Arc<TokenRegistry<PendingPeer>>,
    timeouts: Timeouts,
}

impl ControlListener {
    pub fn new(
        listener: TcpListener,
        classify_tx: mpsc::Sender<Message>,
        rendezvous: Arc<TokenRegistry<PendingPeer>>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            listener,
            classify_tx,
            rendezvous,
            timeouts,
        }
    }

    /// Accept loop; one task per connection. Per-connection failures are
    /// logged and never take the loop down.
    pub async fn run(self) -> Result<()> {
        let Self {
            listener,
            classify_tx,
            rendezvous,
            timeouts,
        } = self;

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            debug!(client = %addr, "control connection accepted");

            let classify_tx = classify_tx.clone();
            let rendezvous = rendezvous.clone();
            let timeouts = timeouts.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_control_conn(stream, classify_tx, rendezvous, timeouts).await
                {
                    warn!(client = %addr, error = %e, "control connection failed");
                }
            });
        }
    }
}

async fn handle_control_conn(
    mut stream: TcpStream,
    classify_tx: mpsc::Sender<Message>,
    rendezvous: Arc<TokenRegistry<PendingPeer>>,
    timeouts: Timeouts,
) -> Result<()> {
    let msg = wire::tcp_receive_message(&mut stream).await?;

    match msg.msg_type {
        MessageType::ProtocolChangeTest => {
            // Fire and forget: the classifier correlates it by token,
            // the connection itself is done
            classify_tx
                .send(msg)
                .await
                .map_err(|_| anyhow!("classifier queue closed"))?;
            Ok(())
        }
        MessageType::Connection => handle_rendezvous(stream, msg, rendezvous, timeouts).await,
        other => {
            warn!(msg_type = ?other, "unexpected control message");
            Ok(())
        }
    }
}

async fn handle_rendezvous(
    mut stream: TcpStream,
    msg: Message,
    rendezvous: Arc<TokenRegistry<PendingPeer>>,
    timeouts: Timeouts,
) -> Result<()> {
    let token = msg.identity_token.clone();

    let mode = match PunchMode::from_token(&token) {
        Some(mode) => mode,
        None => {
            let info = "identity token does not select a punching mode";
            let _ = wire::tcp_send_message(&mut stream, &Message::error(info)).await;
            return Err(anyhow!("{}: {:?}", info, token));
        }
    };

    let nat: NatClassification = match serde_json::from_slice(&msg.data) {
        Ok(nat) => nat,
        Err(e) => {
            let info = "connection request carries no usable NAT classification";
            let _ = wire::tcp_send_message(&mut stream, &Message::error(info)).await;
            return Err(anyhow!("{}: {}", info, e));
        }
    };

    let mut queue = match rendezvous.register(&token) {
        Err(RegistryError::Duplicate(_)) => {
            // Second peer: hand this connection to whoever is waiting.
            // A refused handoff gives the connection back, so the client
            // still hears why before it closes.
            return match rendezvous.deliver(&token, PendingPeer { stream, nat }) {
                Ok(()) => Ok(()),
                Err(peer) => {
                    let mut stream = peer.stream;
                    let info = "rendezvous queue unavailable for this token";
                    let _ = wire::tcp_send_message(&mut stream, &Message::error(info)).await;
                    Err(anyhow!("{}: {}", info, token))
                }
            };
        }
        Ok(queue) => queue,
    };

    // First peer under this token; wait for the counterpart. The entry
    // is released on every path before any negotiation starts, earlier
    // than after coordination completes: a new pair may form under the
    // token while the current one is still negotiating.
    let waited = tokio::time::timeout(timeouts.rendezvous_wait, queue.recv()).await;
    rendezvous.unregister(&token);

    let peer = match waited {
        Ok(Some(peer)) => peer,
        _ => {
            let info = "connection timeout, no holepunching peer arrived";
            let _ = wire::tcp_send_message(&mut stream, &Message::error(info)).await;
            return Err(anyhow!("{} for token {}", info, token));
        }
    };

    info!(
        token = %token,
        first = %stream.peer_addr().context("Failed to read peer address")?,
        second = %peer.stream.peer_addr().context("Failed to read peer address")?,
        "rendezvous pair matched"
    );

    match mode {
        PunchMode::Udp => punch_udp::coordinate(stream, nat, peer.stream, peer.nat, &timeouts).await,
        PunchMode::Tcp => punch_tcp::coordinate(stream, nat, peer.stream, peer.nat, &timeouts).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::types::{NatType, PortChangeRule};

    fn cone() -> NatClassification {
        NatClassification {
            nat_type: NatType::FullOrRestrictedCone,
            port_change_rule: PortChangeRule::UnknownRule,
            port_influenced_by_protocol: false,
        }
    }

    async fn accepted_pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        (client, server_side)
    }

    #[tokio::test]
    async fn refused_handoff_answers_before_closing() {
        let rendezvous: Arc<TokenRegistry<PendingPeer>> =
            Arc::new(TokenRegistry::new("rendezvous", 1));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        // A peer is parked under the token and its single handoff slot
        // is already taken
        let _waiting = rendezvous.register("busyUDP").unwrap();
        let (_filler_client, filler) = accepted_pair(&listener).await;
        assert!(rendezvous
            .deliver(
                "busyUDP",
                PendingPeer {
                    stream: filler,
                    nat: cone(),
                }
            )
            .is_ok());

        let (mut client, server_side) = accepted_pair(&listener).await;
        let msg = Message::new(MessageType::Connection)
            .with_token("busyUDP")
            .with_data(serde_json::to_vec(&cone()).unwrap());

        let outcome =
            handle_rendezvous(server_side, msg, rendezvous.clone(), Timeouts::default()).await;
        assert!(outcome.is_err());

        let reply = wire::tcp_receive_message(&mut client).await.unwrap();
        assert_eq!(reply.msg_type, MessageType::ErrorResponse);
        assert!(!reply.error_info.is_empty());
    }
}
