/**
 * server/punch_udp.rs
 *
 * UDP hole-punching coordinator. Each peer gets a reliability-wrapped
 * ephemeral socket to probe; the address the probe arrives from is the
 * peer's true external mapping, which the other side needs to punch.
 */

use anyhow::{Context, Result};
use futures_util::future::try_join;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::rudp::ReliableUdp;
use crate::server::punch::{self, PunchError};
use crate::server::types::{first_is_active, NatClassification};
use crate::server::Timeouts;

pub async fn coordinate(
    mut first: TcpStream,
    first_nat: NatClassification,
    mut second: TcpStream,
    second_nat: NatClassification,
    timeouts: &Timeouts,
) -> Result<()> {
    let probe_first = ReliableUdp::bind().await?;
    let probe_second = ReliableUdp::bind().await?;
    let port_first = probe_first.local_addr()?.port();
    let port_second = probe_second.local_addr()?.port();

    let wait = timeouts.probe_discovery;
    let (tx_first, rx_first) = oneshot::channel();
    let (tx_second, rx_second) = oneshot::channel();
    tokio::spawn(observe_probe(probe_first, wait, tx_first));
    tokio::spawn(observe_probe(probe_second, wait, tx_second));

    let addr_first = first.peer_addr().context("Failed to read peer address")?;
    let addr_second = second.peer_addr().context("Failed to read peer address")?;

    let active = first_is_active(&first_nat, &second_nat);
    let (role_first, role_second) = punch::roles(active);

    let msg_first =
        punch::negotiation_message(role_first, addr_first, addr_second, second_nat, port_first)?;
    let msg_second =
        punch::negotiation_message(role_second, addr_second, addr_first, first_nat, port_second)?;
    punch::send_passive_first((&mut first, &msg_first), (&mut second, &msg_second), active)
        .await
        .context("Failed to send punching negotiation")?;

    let (observed_first, observed_second) =
        match tokio::time::timeout(wait, try_join(rx_first, rx_second)).await {
            Ok(Ok(pair)) => pair,
            _ => return Err(PunchError::ProbeTimeout.into()),
        };

    info!(
        first = %observed_first,
        second = %observed_second,
        "peer probe addresses observed"
    );

    let start_first = punch::start_message(observed_second);
    let start_second = punch::start_message(observed_first);
    punch::send_passive_first((&mut first, &start_first), (&mut second, &start_second), active)
        .await
        .context("Failed to send start punching")?;

    Ok(())
}

/// Wait for one peer probe and report the address it arrived from. The
/// socket accepts delivery from any source and lives no longer than the
/// discovery deadline.
async fn observe_probe(mut probe: ReliableUdp, wait: Duration, tx: oneshot::Sender<SocketAddr>) {
    match probe.recv(Some(wait)).await {
        Ok((_, addr)) => {
            let _ = tx.send(addr);
        }
        Err(e) => debug!(error = %e, "probe socket saw no peer"),
    }
}
