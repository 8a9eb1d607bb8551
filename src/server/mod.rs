/**
 * server/mod.rs
 *
 * Rendezvous server assembly:
 * - NAT classification engine over a shared datagram socket
 * - control-channel listener and token-based rendezvous matcher
 * - UDP and TCP hole-punching coordinators
 */

mod classify;
mod matcher;
mod punch;
mod punch_tcp;
mod punch_udp;
mod types;

pub use classify::Classifier;
pub use matcher::{ControlListener, PendingPeer};
pub use punch::PunchError;
pub use types::{
    echo_verdict, first_is_active, port_change_rule, EchoVerdict, NatClassification, NatType,
    PortChangeRule, PunchMode, PunchPlan, Role, LINEAR_PORT_RANGE,
};

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tracing::info;

use crate::registry::TokenRegistry;

/// Every blocking wait in the system carries one of these bounds;
/// there is no unbounded wait. Defaults are the protocol values, tests
/// shorten them.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Wait on the echo socket for the port-negotiation response
    pub port_negotiation: Duration,
    /// Wait for the server-port-change response; expiry is itself a
    /// classification, not a failure
    pub cone_test: Duration,
    /// Wait for the TCP-originated protocol-change probe
    pub protocol_test: Duration,
    /// First peer's wait for its rendezvous counterpart
    pub rendezvous_wait: Duration,
    /// Both-peer probe discovery during hole punching
    pub probe_discovery: Duration,
    /// Lease on a finished classification entry, absorbing retries
    pub session_linger: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            port_negotiation: Duration::from_secs(2),
            cone_test: Duration::from_secs(2),
            protocol_test: Duration::from_secs(10),
            rendezvous_wait: Duration::from_secs(30),
            probe_discovery: Duration::from_secs(5),
            session_linger: Duration::from_secs(30),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address both the datagram socket and the stream listener bind to
    pub bind_addr: String,
    pub timeouts: Timeouts,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:6363".to_string(),
            timeouts: Timeouts::default(),
        }
    }
}

/// The rendezvous server: one shared UDP socket for classification, one
/// TCP listener for control connections, two token registries as the
/// only shared mutable state.
pub struct RendezvousServer {
    udp: Arc<UdpSocket>,
    tcp: TcpListener,
    timeouts: Timeouts,
}

impl RendezvousServer {
    /// Bind both listening sockets. Failure here is fatal to the process.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let udp = UdpSocket::bind(&config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind UDP socket on {}", config.bind_addr))?;
        let tcp = TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind TCP listener on {}", config.bind_addr))?;

        Ok(Self {
            udp: Arc::new(udp),
            tcp,
            timeouts: config.timeouts,
        })
    }

    pub fn udp_addr(&self) -> Result<SocketAddr> {
        self.udp.local_addr().context("Failed to read UDP address")
    }

    pub fn tcp_addr(&self) -> Result<SocketAddr> {
        self.tcp.local_addr().context("Failed to read TCP address")
    }

    pub async fn run(self) -> Result<()> {
        info!(
            udp = %self.udp_addr()?,
            tcp = %self.tcp_addr()?,
            "rendezvous server listening"
        );

        // TCP-originated probes forwarded into the classification engine
        let (classify_tx, classify_rx) = mpsc::channel(16);

        let classify_registry = Arc::new(TokenRegistry::new("classification", 2));
        let rendezvous_registry = Arc::new(TokenRegistry::new("rendezvous", 1));

        let classifier = Classifier::new(self.udp, classify_registry, self.timeouts.clone());
        tokio::spawn(classifier.run(classify_rx));

        ControlListener::new(self.tcp, classify_tx, rendezvous_registry, self.timeouts)
            .run()
            .await
    }
}
