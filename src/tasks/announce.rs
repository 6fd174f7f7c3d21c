//! Periodic announcement broadcast and keep-alive receive (spec.md §4.2/
//! §4.3): rebroadcasts the participant's patched announcement packet on
//! the discovery port every `announce_interval_ms`, and listens on the
//! same socket for peers' own announcements so the device registry keeps
//! tracking joins/leaves after `start()` returns.
//!
//! Grounded on the teacher's `tasks/membership.rs`, which owned its own
//! broadcast socket and ran both the periodic send and the keep-alive
//! receive loop side by side.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use tokio::net::UdpSocket;
use tokio::time::{self, Duration};

use crate::error::Result;
use crate::participant::{Shared, ANNOUNCE_PORT};
use crate::proto;
use crate::registry::{DeviceAnnouncement, RegistryEvent};
use crate::message::Message;

const RECV_BUF_LEN: usize = 2048;

pub(crate) async fn run(shared: Arc<Shared>, socket: Arc<UdpSocket>) -> Result<()> {
    let mut buf = [0u8; RECV_BUF_LEN];
    let mut next_send = time::Instant::now();

    while shared.running.load(Ordering::Acquire) {
        let broadcast_addr = {
            let net = shared.net.lock().unwrap();
            match net.as_ref() {
                Some(net) => net.broadcast_addr,
                None => break,
            }
        };

        if time::Instant::now() >= next_send {
            let template = shared.announce_template.lock().unwrap().clone();
            match socket.send_to(&template, broadcast_addr).await {
                Ok(_) => debug!(target: "prolink", "sent announcement to {}", broadcast_addr),
                Err(e) if shared.running.load(Ordering::Acquire) => return Err(e.into()),
                Err(_) => break,
            }
            let interval_ms = shared.config.lock().unwrap().announce_interval_ms();
            next_send = time::Instant::now() + Duration::from_millis(interval_ms);
        }

        tokio::select! {
            _ = time::sleep_until(next_send) => {}
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, source)) => handle_announcement(&shared, &buf[..len], source),
                    Err(e) if shared.running.load(Ordering::Acquire) => return Err(e.into()),
                    Err(_) => break,
                }
            }
        }
    }
    Ok(())
}

fn handle_announcement(shared: &Arc<Shared>, data: &[u8], source: SocketAddr) {
    if shared.is_own_address(source.ip()) {
        return;
    }
    if !matches!(
        proto::validate_header(data, ANNOUNCE_PORT),
        Some(proto::Kind::Announcement)
    ) {
        return;
    }
    let announcement = match proto::Packet::decode(data) {
        Ok(proto::Packet::Announcement(a)) => DeviceAnnouncement {
            device_number: a.device_number,
            name: a.name,
            mac_addr: a.mac_addr,
            ip_addr: source.ip(),
            proto_ver: 0,
        },
        Ok(_) => return,
        Err(e) => {
            warn!(target: "prolink", "dropping malformed announcement from {}: {}", source, e);
            return;
        }
    };
    if let Some(event) = shared.registry.lock().unwrap().observe(announcement, Instant::now()) {
        let msg = match event {
            RegistryEvent::Joined(a) => Message::DeviceJoined(a),
            RegistryEvent::Left(a) => Message::DeviceLeft(a),
        };
        let _ = shared.msg_tx.try_send(msg);
    }
}
