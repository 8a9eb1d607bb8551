/**
 * server/types.rs
 *
 * Classification and negotiation types, plus the pure decision rules
 * the protocol handlers share.
 */

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// How far apart two symmetric-NAT port mappings may sit and still count
/// as linearly assigned
pub const LINEAR_PORT_RANGE: u16 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    Unknown,
    FullOrRestrictedCone,
    PortRestrictedCone,
    Symmetric,
}

/// Port-mapping behavior of a symmetric NAT; meaningless for cone types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortChangeRule {
    Linear,
    UnknownRule,
}

/// Result of one classification session. Produced once, immutable, sent
/// to the owning client and cached nowhere server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatClassification {
    pub nat_type: NatType,
    pub port_change_rule: PortChangeRule,
    pub port_influenced_by_protocol: bool,
}

impl Default for NatClassification {
    fn default() -> Self {
        Self {
            nat_type: NatType::Unknown,
            port_change_rule: PortChangeRule::UnknownRule,
            port_influenced_by_protocol: false,
        }
    }
}

/// Punching role: the passive side must be listening before the active
/// side attempts to connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Passive,
    Active,
}

/// Transport mode selected by the rendezvous token's trailing characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchMode {
    Udp,
    Tcp,
}

impl PunchMode {
    pub fn from_token(token: &str) -> Option<Self> {
        if token.ends_with("UDP") {
            Some(PunchMode::Udp)
        } else if token.ends_with("TCP") {
            Some(PunchMode::Tcp)
        } else {
            None
        }
    }
}

/// Payload of a `PunchingNegotiation` message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PunchPlan {
    pub role: Role,
    pub my_public_addr: SocketAddr,
    pub remote_public_addr: SocketAddr,
    pub remote_nat: NatClassification,
    pub server_probe_port: u16,
}

/// Verdict from comparing the port-negotiation echo's observed source
/// against the originally observed client address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoVerdict {
    Symmetric(PortChangeRule),
    SameMapping,
}

pub fn port_change_rule(original_port: u16, observed_port: u16) -> PortChangeRule {
    let delta = (i32::from(original_port) - i32::from(observed_port)).abs();
    if delta <= i32::from(LINEAR_PORT_RANGE) {
        PortChangeRule::Linear
    } else {
        PortChangeRule::UnknownRule
    }
}

pub fn echo_verdict(original: SocketAddr, observed: SocketAddr) -> EchoVerdict {
    if observed == original {
        EchoVerdict::SameMapping
    } else {
        EchoVerdict::Symmetric(port_change_rule(original.port(), observed.port()))
    }
}

/// Role rule: a symmetric NAT cannot predict its mapped port for an
/// unsolicited inbound packet, so the non-symmetric side listens while
/// the symmetric side initiates. Every other pairing, both-symmetric
/// included, falls through to first-active; peer clients depend on this
/// exact convention.
pub fn first_is_active(first: &NatClassification, second: &NatClassification) -> bool {
    !(first.nat_type != NatType::Symmetric && second.nat_type == NatType::Symmetric)
}
