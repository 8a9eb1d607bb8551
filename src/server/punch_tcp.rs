/**
 * server/punch_tcp.rs
 *
 * TCP hole-punching coordinator. A probe is simply an inbound stream
 * connection to an ephemeral listener, closed as soon as its source
 * address is captured. Unlike the UDP mode, the probe's IP must match
 * the peer's control connection; a mismatch aborts the negotiation.
 */

use anyhow::{Context, Result};
use futures_util::future::try_join;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info};

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
    let listener_first = rand_listener()?;
    let listener_second = rand_listener()?;
    let port_first = listener_first
        .local_addr()
        .context("Failed to read listener address")?
        .port();
    let port_second = listener_second
        .local_addr()
        .context("Failed to read listener address")?
        .port();

    let wait = timeouts.probe_discovery;
    let (tx_first, rx_first) = oneshot::channel();
    let (tx_second, rx_second) = oneshot::channel();
    tokio::spawn(observe_probe(listener_first, wait, tx_first));
    tokio::spawn(observe_probe(listener_second, wait, tx_second));

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

    // A probe arriving from a different IP than the control connection
    // indicates a spoofed or multi-homed anomaly
    if observed_first.ip() != addr_first.ip() {
        return Err(PunchError::AddrMismatch {
            expected: addr_first.ip(),
            observed: observed_first.ip(),
        }
        .into());
    }
    if observed_second.ip() != addr_second.ip() {
        return Err(PunchError::AddrMismatch {
            expected: addr_second.ip(),
            observed: observed_second.ip(),
        }
        .into());
    }

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

/// Ephemeral listener with SO_REUSEADDR so rapid negotiation cycles can
/// rebind promptly
fn rand_listener() -> Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .context("Failed to create probe socket")?;

    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from(([0, 0, 0, 0], 0)).into())?;
    socket.listen(8)?;
    socket.set_nonblocking(true)?;

    TcpListener::from_std(socket.into()).context("Failed to register probe listener")
}

/// Accept one probe connection, capture its source address, close it.
/// The listener lives no longer than the discovery deadline.
async fn observe_probe(listener: TcpListener, wait: Duration, tx: oneshot::Sender<SocketAddr>) {
    match tokio::time::timeout(wait, listener.accept()).await {
        Ok(Ok((stream, addr))) => {
            drop(stream);
            let _ = tx.send(addr);
        }
        Ok(Err(e)) => debug!(error = %e, "probe accept failed"),
        Err(_) => debug!("probe listener saw no peer"),
    }
}
