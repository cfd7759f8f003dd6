//! Status clients for Minecraft servers that need no account: the legacy UDP
//! full-stat query and the TCP server list ping.
//!
//! [`query`] and [`ping`] cover the common case. The pinger structs in
//! [`pinging`] take a resolved address when you need more control.

pub mod pinging;
pub mod resolution;

use std::{net::SocketAddr, time::Duration};

use pinging::transport::Deadline;
use resolution::resolve_host_ips;

pub use pinging::{
    error::{DecodeError, FailureKind, PingError, ProtocolViolation},
    mc_modern::{ping_json::PingResponse, ModernPingData, ModernPinger},
    mc_query::{QueryData, QueryPinger},
    transport::timeout_from_secs,
    Pinger,
};

/// Port both protocols listen on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 25565;

/// Runs a full-stat query against `address:port`. `timeout` is in seconds and
/// bounds the whole call, name resolution included.
///
/// ```no_run
/// let stats = mcstat::query("localhost", 25565, 2.0)?;
/// println!("{:?} players: {:?}", stats.num_players, stats.player_list);
/// # Ok::<(), mcstat::PingError>(())
/// ```
pub fn query(address: &str, port: u16, timeout: f64) -> Result<QueryData, PingError> {
    let pinger = QueryPinger {
        timeout: timeout_from_secs(timeout)?,
    };
    within_budget(
        pinger.timeout,
        || first_address(address, port),
        |addr, deadline| pinger.ping_within(addr, deadline),
    )
}

/// Runs a server list ping against `address:port`. `timeout` is in seconds and
/// bounds the whole call, name resolution included.
pub fn ping(address: &str, port: u16, timeout: f64) -> Result<ModernPingData, PingError> {
    let pinger = ModernPinger {
        hostname: address.to_string(),
        timeout: timeout_from_secs(timeout)?,
    };
    // reject oversized names before any lookup
    pinger.handshake_packet(port)?;
    within_budget(
        pinger.timeout,
        || first_address(address, port),
        |addr, deadline| pinger.ping_within(addr, deadline),
    )
}

/// Starts the clock before `resolve`, so a slow lookup eats into the budget
/// and shows up in the latency. The lookup itself blocks until the resolver
/// gives up.
fn within_budget<T>(
    timeout: Duration,
    resolve: impl FnOnce() -> Result<SocketAddr, PingError>,
    call: impl FnOnce(SocketAddr, Deadline) -> Result<T, PingError>,
) -> Result<T, PingError> {
    let deadline = Deadline::start(timeout);
    let addr = resolve()?;
    call(addr, deadline)
}

fn first_address(address: &str, port: u16) -> Result<SocketAddr, PingError> {
    let connect_error = |source| PingError::Connect {
        addr: format!("{}:{}", address, port),
        source,
    };
    resolve_host_ips(address, port)
        .map_err(connect_error)?
        .into_iter()
        .min()
        .ok_or_else(|| {
            connect_error(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "address resolved to nothing",
            ))
        })
}
