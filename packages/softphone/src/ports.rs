//! Local UDP port suggestion for the engine's SIP transport.

use std::io;
use std::net::{Ipv4Addr, UdpSocket};
use std::ops::RangeInclusive;

use rand::Rng;
use tracing::debug;

const PORT_RANGE: RangeInclusive<u16> = 10_000..=60_000;
const MAX_ATTEMPTS: usize = 20;

/// A port that was bindable on all interfaces a moment ago. Random picks from
/// a high range first; after repeated collisions the OS chooses.
pub fn suggest_port() -> io::Result<u16> {
    let mut rng = rand::rng();
    for _ in 0..MAX_ATTEMPTS {
        let port = rng.random_range(PORT_RANGE);
        if is_bindable(port) {
            return Ok(port);
        }
        debug!(port, "port in use, retrying");
    }

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    Ok(socket.local_addr()?.port())
}

pub fn is_bindable(port: u16) -> bool {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggested_port_is_bindable() {
        let port = suggest_port().unwrap();
        assert!(port >= 1024);
        assert!(is_bindable(port));
    }

    #[test]
    fn occupied_port_is_not_bindable() {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = socket.local_addr().unwrap().port();
        assert!(!is_bindable(port));
    }
}
