//! Discovery broadcaster: a once-per-second UDP banner advertising this
//! device while idle, plus the popup-on-disconnect hook.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Socket, Type};

use crate::config::{DaemonConfig, DISCOVERY_BANNER, DISCOVERY_PACKET_SIZE, PORT_DISCOVERY};
use crate::connstate::ConnState;

const BROADCAST_ADDR: &str = "255.255.255.255";

fn banner_packet() -> [u8; DISCOVERY_PACKET_SIZE] {
    let mut packet = [0u8; DISCOVERY_PACKET_SIZE];
    let banner = DISCOVERY_BANNER.as_bytes();
    packet[..banner.len()].copy_from_slice(banner);
    packet
}

fn bind_broadcast_udp(bind_addr: &str) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None).context("UDP socket() failed")?;
    socket
        .set_broadcast(true)
        .context("setsockopt(SO_BROADCAST) failed")?;
    let addr: std::net::SocketAddr = format!("{bind_addr}:0")
        .parse()
        .context("invalid discovery bind address")?;
    socket.bind(&addr.into()).context("UDP bind() failed")?;
    Ok(socket.into())
}

/// Runs forever on the calling thread; intended to run on the main thread
/// after every listener has been launched.
pub fn run(state: Arc<ConnState>, config: &DaemonConfig) -> Result<()> {
    let socket = bind_broadcast_udp(&config.bind_addr)?;
    let packet = banner_packet();
    let pending_disconnect = AtomicBool::new(false);

    tracing::info!(port = PORT_DISCOVERY, "discovery broadcaster started");

    loop {
        if state.client_count() == 0 {
            if pending_disconnect.swap(false, Ordering::Relaxed) {
                announce_disconnect(config);
            }
            if let Err(e) = socket.send_to(&packet, (BROADCAST_ADDR, PORT_DISCOVERY)) {
                tracing::debug!(error = %e, "discovery broadcast send failed");
            }
        } else {
            pending_disconnect.store(true, Ordering::Relaxed);
        }

        std::thread::sleep(Duration::from_secs(1));
    }
}

fn announce_disconnect(config: &DaemonConfig) {
    let result = std::process::Command::new(&config.popup_script)
        .arg(config.popup_timeout_secs.to_string())
        .arg(&config.popup_message)
        .spawn();
    if let Err(e) = result {
        tracing::debug!(error = %e, "failed to spawn popup script");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_packet_is_fixed_size_and_zero_padded() {
        let packet = banner_packet();
        assert_eq!(packet.len(), 32);
        assert!(packet.starts_with(DISCOVERY_BANNER.as_bytes()));
        assert!(packet[DISCOVERY_BANNER.len()..].iter().all(|&b| b == 0));
    }
}
