/**
 * server/classify.rs
 *
 * NAT classification engine. One shared datagram socket receives all
 * classification traffic; each newly seen token gets an independent
 * session task fed through a registry queue, which also carries
 * protocol-change probes forwarded from the control channel.
 */

use anyhow::{anyhow, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::registry::TokenRegistry;
use crate::server::types::{echo_verdict, EchoVerdict, NatClassification, NatType, PortChangeRule};
use crate::server::Timeouts;
use crate::wire::{self, Message, MessageType};

pub struct Classifier {
    socket: Arc<UdpSocket>,
    registry: Arc<TokenRegistry<Message>>,
    timeouts: Timeouts,
}

impl Classifier {
    pub fn new(
        socket: Arc<UdpSocket>,
        registry: Arc<TokenRegistry<Message>>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            socket,
            registry,
            timeouts,
        }
    }

    /// Dispatch loop over the shared socket and the control-channel
    /// forwarding queue. Never exits while the control channel is open.
    pub async fn run(self, mut forwarded: mpsc::Receiver<Message>) {
        loop {
            let msg = tokio::select! {
                received = wire::udp_receive_message(&self.socket, None) => match received {
                    Ok((msg, _)) => msg,
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable datagram");
                        continue;
                    }
                },
                forwarded_msg = forwarded.recv() => match forwarded_msg {
                    Some(msg) => msg,
                    None => {
                        warn!("control channel closed, stopping classifier");
                        return;
                    }
                },
            };

            self.dispatch(msg);
        }
    }

    fn dispatch(&self, msg: Message) {
        match msg.msg_type {
            MessageType::TestNatType => {
                let client = match msg.source() {
                    Ok(addr) => addr,
                    Err(e) => {
                        warn!(error = %e, "classification request without source");
                        return;
                    }
                };

                match self.registry.register(&msg.identity_token) {
                    Ok(queue) => {
                        info!(token = %msg.identity_token, client = %client, "starting classification session");
                        let session = ClassifySession {
                            socket: self.socket.clone(),
                            client,
                            token: msg.identity_token,
                            queue,
                            stash: None,
                            timeouts: self.timeouts.clone(),
                        };
                        let registry = self.registry.clone();
                        tokio::spawn(async move {
                            let token = session.token.clone();
                            if let Err(e) = session.run().await {
                                warn!(token = %token, error = %e, "classification session failed");
                            }
                            registry.unregister(&token);
                        });
                    }
                    // A live token keeps its running session; duplicates
                    // are rejected, not restarted
                    Err(e) => warn!(error = %e, "duplicate classification request ignored"),
                }
            }
            _ => {
                let token = msg.identity_token.clone();
                let _ = self.registry.deliver(&token, msg);
            }
        }
    }
}

/// One classification session: a sequence of bounded waits, one per
/// phase, over the session's forwarding queue and ephemeral sockets.
struct ClassifySession {
    socket: Arc<UdpSocket>,
    /// Originally observed client address; every verdict compares against it
    client: SocketAddr,
    token: String,
    queue: mpsc::Receiver<Message>,
    /// Protocol-change probe that arrived a phase early
    stash: Option<Message>,
    timeouts: Timeouts,
}

impl ClassifySession {
    async fn run(mut self) -> Result<()> {
        wire::udp_send_message(&self.socket, self.client, &Message::new(MessageType::Ack))
            .await
            .context("Failed to ack classification request")?;

        // Ephemeral echo socket. Its port travels to the client; the
        // address the response arrives from reveals the remapping.
        let echo = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("Failed to bind echo socket")?;
        let echo_port = echo.local_addr().context("Failed to read echo address")?.port();

        let negotiation = Message::new(MessageType::PortNegotiation)
            .with_data(echo_port.to_string().into_bytes());
        wire::udp_send_message(&self.socket, self.client, &negotiation)
            .await
            .context("Failed to send port negotiation")?;

        let (reply, observed) =
            wire::udp_receive_message(&echo, Some(self.timeouts.port_negotiation))
                .await
                .context("No port negotiation response")?;
        if reply.msg_type != MessageType::PortNegotiationResponse {
            return Err(anyhow!(
                "expected port negotiation response, got {:?}",
                reply.msg_type
            ));
        }

        let mut nat_type;
        let mut rule = PortChangeRule::UnknownRule;
        match echo_verdict(self.client, observed) {
            EchoVerdict::Symmetric(change_rule) => {
                nat_type = NatType::Symmetric;
                rule = change_rule;
            }
            EchoVerdict::SameMapping => {
                // Held open for the duration of the cone test; the probe
                // itself goes out from the original socket
                let _alt = UdpSocket::bind("0.0.0.0:0")
                    .await
                    .context("Failed to bind cone test socket")?;

                let probe = Message::new(MessageType::ServerPortChangeTest);
                wire::udp_send_message(&self.socket, self.client, &probe)
                    .await
                    .context("Failed to send server port change test")?;

                nat_type = self.await_cone_response().await;
            }
        }

        let influenced = self.await_protocol_probe(&mut nat_type).await;

        let classification = NatClassification {
            nat_type,
            port_change_rule: rule,
            port_influenced_by_protocol: influenced,
        };
        let data = serde_json::to_vec(&classification).context("Failed to encode classification")?;
        let result = Message::new(MessageType::EndResult)
            .with_token(&self.token)
            .with_data(data);
        wire::udp_send_message(&self.socket, self.client, &result)
            .await
            .context("Failed to send end result")?;

        info!(
            token = %self.token,
            client = %self.client,
            nat = ?classification.nat_type,
            influenced = classification.port_influenced_by_protocol,
            "classification complete"
        );

        self.linger().await;
        Ok(())
    }

    /// Cone test wait: a port-change response means traffic from an
    /// unexpected server port got through. A protocol-change probe that
    /// shows up here belongs to the next phase and is stashed for it.
    async fn await_cone_response(&mut self) -> NatType {
        let deadline = Instant::now() + self.timeouts.cone_test;
        loop {
            let received = timeout_at(deadline, self.queue.recv()).await;
            match received {
                Ok(Some(msg)) => match msg.msg_type {
                    MessageType::ServerPortChangeTestResponse => {
                        return NatType::FullOrRestrictedCone;
                    }
                    MessageType::ProtocolChangeTest => {
                        self.stash = Some(msg);
                    }
                    other => debug!(msg_type = ?other, "unexpected message during cone test"),
                },
                Ok(None) | Err(_) => return NatType::PortRestrictedCone,
            }
        }
    }

    /// Protocol test wait: compare the TCP-originated probe's observed
    /// source against the original UDP address. No probe within the
    /// deadline is read conservatively as "the mapping differs".
    async fn await_protocol_probe(&mut self, nat_type: &mut NatType) -> bool {
        if let Some(msg) = self.stash.take() {
            return msg.src_public_addr != Some(self.client);
        }

        let deadline = Instant::now() + self.timeouts.protocol_test;
        loop {
            let received = timeout_at(deadline, self.queue.recv()).await;
            match received {
                Ok(Some(msg)) => match msg.msg_type {
                    MessageType::ProtocolChangeTest => {
                        return msg.src_public_addr != Some(self.client);
                    }
                    // A straggler from the cone test still upgrades the verdict
                    MessageType::ServerPortChangeTestResponse => {
                        *nat_type = NatType::FullOrRestrictedCone;
                    }
                    other => debug!(msg_type = ?other, "unexpected message during protocol test"),
                },
                Ok(None) | Err(_) => return true,
            }
        }
    }

    /// Bounded lease on the session entry: drain client retries for a
    /// while, then let the caller release the token.
    async fn linger(&mut self) {
        let deadline = Instant::now() + self.timeouts.session_linger;
        loop {
            let received = timeout_at(deadline, self.queue.recv()).await;
            match received {
                Ok(Some(msg)) => {
                    debug!(token = %self.token, msg_type = ?msg.msg_type, "ignoring late message");
                }
                Ok(None) | Err(_) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const CLIENT: &str = "203.0.113.9:5000";

    async fn session(timeouts: Timeouts) -> (ClassifySession, mpsc::Sender<Message>) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (tx, queue) = mpsc::channel(2);
        let session = ClassifySession {
            socket,
            client: CLIENT.parse().unwrap(),
            token: "tok".to_string(),
            queue,
            stash: None,
            timeouts,
        };
        (session, tx)
    }

    fn short_timeouts() -> Timeouts {
        Timeouts {
            cone_test: Duration::from_millis(200),
            protocol_test: Duration::from_millis(200),
            ..Timeouts::default()
        }
    }

    fn protocol_probe(src: &str) -> Message {
        let mut msg = Message::new(MessageType::ProtocolChangeTest).with_token("tok");
        msg.src_public_addr = Some(src.parse().unwrap());
        msg
    }

    #[tokio::test]
    async fn early_protocol_message_is_held_for_the_next_phase() {
        let (mut session, tx) = session(short_timeouts()).await;

        // The protocol-change probe jumps the queue during the cone wait
        tx.send(protocol_probe("203.0.113.9:6000")).await.unwrap();

        // It must not end the cone wait, and must not be lost either
        assert_eq!(session.await_cone_response().await, NatType::PortRestrictedCone);

        let mut nat_type = NatType::PortRestrictedCone;
        assert!(session.await_protocol_probe(&mut nat_type).await);
        assert_eq!(nat_type, NatType::PortRestrictedCone);
    }

    #[tokio::test]
    async fn held_message_from_the_original_address_means_uninfluenced() {
        let (mut session, tx) = session(short_timeouts()).await;

        tx.send(protocol_probe(CLIENT)).await.unwrap();
        assert_eq!(session.await_cone_response().await, NatType::PortRestrictedCone);

        let mut nat_type = NatType::PortRestrictedCone;
        assert!(!session.await_protocol_probe(&mut nat_type).await);
    }

    #[tokio::test]
    async fn late_cone_response_still_upgrades_the_verdict() {
        let (mut session, tx) = session(short_timeouts()).await;

        // The cone-test answer only lands once the protocol wait started
        let straggler = Message::new(MessageType::ServerPortChangeTestResponse).with_token("tok");
        tx.send(straggler).await.unwrap();

        let mut nat_type = NatType::PortRestrictedCone;
        let influenced = session.await_protocol_probe(&mut nat_type).await;
        assert!(influenced);
        assert_eq!(nat_type, NatType::FullOrRestrictedCone);
    }
}
