//! The single-writer ingest loop (spec.md §4.3/§5): receives every packet
//! on the status socket, updates the device registry and master election,
//! and fans updates out to listeners/`Message`s. All election and registry
//! mutation happens here and nowhere else, so neither needs its own lock
//! held across an await point.
//!
//! Grounded on the teacher's `tasks/membership.rs` (join/keep-alive/leave
//! loop) and `tasks/status.rs` (status-packet receive loop), merged into
//! one task the way spec.md §5 requires.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::net::UdpSocket;
use tokio::time;

use crate::election::{RequestOutcome, StatusView};
use crate::error::Result;
use crate::message::{BeatUpdate, CdjStatusUpdate, DeviceUpdate, MediaDetailsUpdate, Message};
use crate::proto::{self, Packet};
use crate::registry::{DeviceAnnouncement, RegistryEvent};
use crate::participant::Shared;

const EXPIRE_INTERVAL: Duration = Duration::from_secs(1);
const RECV_BUF_LEN: usize = 2048;

pub(crate) async fn run(shared: Arc<Shared>, socket: Arc<UdpSocket>) -> Result<()> {
    let mut buf = [0u8; RECV_BUF_LEN];
    let mut expire_tick = time::interval(EXPIRE_INTERVAL);

    while shared.running.load(Ordering::Acquire) {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (len, source) = match result {
                    Ok(v) => v,
                    Err(e) if shared.running.load(Ordering::Acquire) => return Err(e.into()),
                    Err(_) => break,
                };
                if shared.is_own_address(source.ip()) {
                    continue;
                }
                if let Err(e) = handle_packet(&shared, &socket, &buf[..len], source).await {
                    warn!(target: "prolink", "dropping malformed packet from {}: {}", source, e);
                }
            }
            _ = expire_tick.tick() => {
                let events = shared.registry.lock().unwrap().expire(Instant::now());
                for event in events {
                    publish_registry_event(&shared, event);
                }
            }
        }
    }
    Ok(())
}

fn publish_registry_event(shared: &Arc<Shared>, event: RegistryEvent) {
    let msg = match event {
        RegistryEvent::Joined(a) => Message::DeviceJoined(a),
        RegistryEvent::Left(a) => Message::DeviceLeft(a),
    };
    let _ = shared.msg_tx.try_send(msg);
}

async fn handle_packet(
    shared: &Arc<Shared>,
    socket: &Arc<UdpSocket>,
    data: &[u8],
    source: std::net::SocketAddr,
) -> Result<()> {
    let packet = Packet::decode(data)?;
    let now = Instant::now();

    match packet {
        Packet::Announcement(a) => {
            let announcement = DeviceAnnouncement {
                device_number: a.device_number,
                name: a.name,
                mac_addr: a.mac_addr,
                ip_addr: source.ip(),
                proto_ver: 0,
            };
            if let Some(event) = shared.registry.lock().unwrap().observe(announcement, now) {
                publish_registry_event(shared, event);
            }
        }

        Packet::CdjStatus(s) => {
            let view = StatusView {
                device_number: s.device_number,
                addr: source,
                is_master: s.is_master,
                yield_to: s.yield_to,
                sync_counter: s.sync_number,
                effective_tempo: s.tempo,
            };
            let events = shared.election.lock().unwrap().on_status_update(&view);
            shared.publish_election_events(events);

            // Spec.md §4.7: a synced follower retunes its metronome to the
            // master's tempo and kicks the beat sender so it re-derives its
            // next-beat timing from the new tempo.
            let (is_master_status, am_master) = {
                let election = shared.election.lock().unwrap();
                (
                    election.current_master().map(|(n, _)| n == s.device_number).unwrap_or(false),
                    election.am_master,
                )
            };
            if is_master_status && !am_master && shared.synced.load(Ordering::Acquire) {
                shared.metronome.set_tempo(s.tempo, now);
                shared.timeline_notify.notify_waiters();
            }

            shared.device_updates.notify(&DeviceUpdate::CdjStatus(CdjStatusUpdate {
                source,
                device_number: s.device_number,
                seen_at: now,
                tempo: s.tempo,
                beat_within_bar: s.beat_within_bar,
                is_master: s.is_master,
                yield_to: s.yield_to,
                sync_number: s.sync_number,
                playing: s.playing,
                beat: s.beat,
            }));
        }

        Packet::MixerStatus(_) => {
            shared.device_updates.notify(&DeviceUpdate::MixerStatus { source, seen_at: now });
        }

        Packet::Beat(b) => {
            shared.device_updates.notify(&DeviceUpdate::Beat(BeatUpdate {
                source,
                device_number: b.device_number,
                seen_at: now,
                tempo: b.tempo,
                beat_within_bar: b.beat_within_bar,
                next_beat_ms: b.next_beat_ms,
                next_bar_ms: b.next_bar_ms,
            }));

            let is_master_beat = shared
                .election
                .lock()
                .unwrap()
                .current_master()
                .map(|(n, _)| n == b.device_number)
                .unwrap_or(false);
            if is_master_beat && shared.synced.load(Ordering::Acquire) {
                shared.metronome.snap_to_beat(now);
            }
        }

        Packet::LoadTrack(t) => {
            let detail = MediaDetailsUpdate {
                source,
                device_number: t.sender_device,
                track_source_slot: t.source_slot,
                track_source_type: t.source_type,
                rekordbox_id: t.rekordbox_id,
            };
            shared.device_updates.notify(&DeviceUpdate::MediaDetails(detail.clone()));
            let _ = shared.msg_tx.try_send(Message::MediaDetails(detail));
        }

        Packet::SyncControl(c) => {
            let from = shared
                .registry
                .lock()
                .unwrap()
                .current_devices()
                .find(|d| d.ip_addr == source.ip())
                .map(|d| d.device_number)
                .unwrap_or(0);
            match c.command {
                proto::SyncCommand::On | proto::SyncCommand::Off => {
                    let on = matches!(c.command, proto::SyncCommand::On);
                    shared.synced.store(on, Ordering::Release);
                    let _ = shared.msg_tx.try_send(Message::SyncCommandReceived { from, on });
                }
                proto::SyncCommand::BecomeMaster => {
                    let sending_status = shared.sending_status.load(Ordering::Acquire);
                    if let Ok(outcome) = shared.election.lock().unwrap().request_master(sending_status) {
                        match outcome {
                            RequestOutcome::TookMasterImmediately(events) => {
                                shared.publish_election_events(events);
                            }
                            RequestOutcome::RequestSentTo(target) => {
                                if let Some(addr) = shared
                                    .registry
                                    .lock()
                                    .unwrap()
                                    .latest_from(target)
                                    .map(|a| std::net::SocketAddr::new(a.ip_addr, source.port()))
                                {
                                    let our_number = shared.device_number.load(Ordering::Acquire);
                                    let pkt = proto::MasterHandoffRequestPacket {
                                        requesting_device: our_number,
                                        target_device: target,
                                    };
                                    let mut buf = Vec::new();
                                    pkt.write(&mut buf)?;
                                    let _ = socket.send_to(&buf, addr).await;
                                }
                            }
                        }
                    }
                }
            }
        }

        Packet::FaderStart(f) => {
            let _ = shared
                .msg_tx
                .try_send(Message::FaderStartReceived { per_player: f.per_player });
        }

        Packet::ChannelsOnAir(c) => {
            let _ = shared
                .msg_tx
                .try_send(Message::OnAirChanged { per_player: c.per_player });
        }

        Packet::MediaQuery(q) => {
            debug!(target: "prolink", "media query from device {} for player {} slot {}", q.device_number, q.target_player, q.slot);
        }

        Packet::MasterHandoffRequest(r) => {
            let our_number = shared.device_number.load(Ordering::Acquire);
            if r.target_device == our_number {
                if let Some(ack_target) = shared
                    .election
                    .lock()
                    .unwrap()
                    .receive_yield_command(r.requesting_device)
                {
                    let _ = shared
                        .msg_tx
                        .try_send(Message::MasterHandoffRequested { from: r.requesting_device });
                    let pkt = proto::MasterHandoffAckPacket {
                        device_number: our_number,
                        acking_to: ack_target,
                        next_master: ack_target,
                    };
                    let mut buf = Vec::new();
                    pkt.write(&mut buf)?;
                    let _ = socket.send_to(&buf, source).await;
                }
            }
        }

        Packet::MasterHandoffAck(a) => {
            let our_number = shared.device_number.load(Ordering::Acquire);
            if a.acking_to == our_number {
                let sending_status = shared.sending_status.load(Ordering::Acquire);
                shared
                    .election
                    .lock()
                    .unwrap()
                    .receive_handoff_response(true, a.device_number, sending_status);
                let _ = shared.msg_tx.try_send(Message::MasterHandoffAcked {
                    from: a.device_number,
                    next_master: a.next_master,
                });
            }
        }
    }

    Ok(())
}
