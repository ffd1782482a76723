//! Local address checks
//!
//! A chunk server advertises the IP its meta connection uses. Before
//! replacing a previously advertised address, the old one is probed: it
//! must still be bindable on this host and must not be loopback or
//! wildcard, since clients elsewhere cannot reach either.

use driftfs_common::{Error, Result};
use std::net::{IpAddr, TcpListener};

/// True for `127.0.0.1`/`::1` and `0.0.0.0`/`::`.
pub fn is_loopback_or_wildcard(host: &str) -> bool {
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback() || ip.is_unspecified(),
        Err(_) => false,
    }
}

/// Verify that `host` is an address this machine currently hosts and
/// that it is reachable from other machines.
pub fn probe_local_address(host: &str) -> Result<()> {
    let listener = TcpListener::bind((host, 0))?;
    let local = listener.local_addr()?;
    if local.ip().is_loopback() || local.ip().is_unspecified() {
        return Err(Error::invalid_argument(format!(
            "{host}: loopback or wildcard address"
        )));
    }
    Ok(())
}
