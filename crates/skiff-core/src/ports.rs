//! Local TCP port allocation.

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

use crate::error::{CoreError, Result};

/// Probes attempted by [`PortAllocator::find_available`] before giving up.
pub const MAX_PROBE_ATTEMPTS: usize = 100;

/// Lowest port the probe wraps back to after 65535.
pub const WRAP_START_PORT: u16 = 1025;

/// Answers whether local TCP ports are free.
pub trait PortAllocator: Send + Sync {
    /// Returns true if the port can be bound on loopback right now.
    fn is_available(&self, port: u16) -> bool;

    /// Returns `preferred` if free, otherwise the next free port found by a
    /// linear probe that wraps from 65535 to 1025.
    fn find_available(&self, preferred: u16) -> Result<u16> {
        let mut candidate = if preferred == 0 { WRAP_START_PORT } else { preferred };
        for _ in 0..MAX_PROBE_ATTEMPTS {
            if self.is_available(candidate) {
                return Ok(candidate);
            }
            candidate = next_port(candidate);
        }
        Err(CoreError::Resource(
            "Unable to find an available TCP port.".to_string(),
        ))
    }
}

fn next_port(port: u16) -> u16 {
    if port == u16::MAX {
        WRAP_START_PORT
    } else {
        port + 1
    }
}

/// Probes by binding `127.0.0.1:<port>` and releasing it immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpPortProbe;

impl PortAllocator for TcpPortProbe {
    fn is_available(&self, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
    }
}

/// Resolves one listener port.
///
/// Returns the preferred port when free. When it is busy, either probes for
/// an alternative or fails with "Port N is already in use.".
pub fn resolve_port(
    allocator: &dyn PortAllocator,
    preferred: u16,
    auto_select_on_conflict: bool,
) -> Result<u16> {
    if allocator.is_available(preferred) {
        return Ok(preferred);
    }
    if !auto_select_on_conflict {
        return Err(CoreError::Resource(format!(
            "Port {preferred} is already in use."
        )));
    }
    let port = allocator.find_available(preferred)?;
    tracing::info!(preferred, port, "Preferred port busy, using alternative");
    Ok(port)
}
