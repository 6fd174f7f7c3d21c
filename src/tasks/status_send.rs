//! Status-sender task (spec.md §4.6): synthesises a CDJ-status packet
//! from live participant state every `status_interval_ms` and unicasts it
//! to every device currently in the registry. Active only while
//! `sending_status` is set (guaranteed true for the task's whole
//! lifetime: `Participant::set_sending_status` spawns and tears it down).
//!
//! Grounded on the teacher's `tasks/status.rs`, which owned a receive
//! loop over the same packet kind; this is that task's send-side twin.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::time::{self, Duration};

use crate::error::Result;
use crate::participant::{Shared, STATUS_PORT};
use crate::proto::CdjStatusPacket;

/// How close to a beat boundary (in ms) the beat sender is allowed to be
/// woken from its sleep to emit a beat. Mirrors the beat sender's own
/// threshold since both guard the same handoff.
const SLEEP_THRESHOLD_MS: f64 = 1.0;
/// How far past a beat boundary a status packet must not land, so beats
/// are always observed to lead the status packet reporting them.
const BEAT_THRESHOLD_MS: f64 = 1.0;

async fn avoid_beat_packet(shared: &Arc<Shared>) {
    loop {
        let distance = shared.metronome.snapshot_at(Instant::now()).distance_from_nearest_beat_ms;
        if distance >= -SLEEP_THRESHOLD_MS && distance <= BEAT_THRESHOLD_MS + 1.0 {
            time::sleep(Duration::from_millis(2)).await;
        } else {
            break;
        }
    }
}

pub(crate) async fn run(shared: Arc<Shared>, socket: Arc<UdpSocket>) -> Result<()> {
    let mut packet_counter: u32 = 0;

    while shared.running.load(Ordering::Acquire) && shared.sending_status.load(Ordering::Acquire) {
        avoid_beat_packet(&shared).await;

        let now = Instant::now();
        let snapshot = shared.metronome.snapshot_at(now);
        let (is_master, yield_to, sync_number) = {
            let election = shared.election.lock().unwrap();
            (election.am_master, election.next_master, election.sync_counter)
        };

        let pkt = CdjStatusPacket {
            device_number: shared.device_number.load(Ordering::Acquire),
            playing: shared.playing.load(Ordering::Acquire),
            is_master,
            synced: shared.synced.load(Ordering::Acquire),
            on_air: shared.on_air.load(Ordering::Acquire),
            sync_number,
            tempo: snapshot.tempo,
            yield_to,
            beat: snapshot.beat as u32,
            beat_within_bar: snapshot.beat_within_bar,
            packet_counter,
        };
        packet_counter = packet_counter.wrapping_add(1);

        let mut buf = Vec::new();
        pkt.write(&mut buf)?;

        let targets: Vec<SocketAddr> = shared
            .registry
            .lock()
            .unwrap()
            .current_devices()
            .map(|d| SocketAddr::new(d.ip_addr, STATUS_PORT))
            .collect();
        for addr in targets {
            let _ = socket.send_to(&buf, addr).await;
        }

        let interval = shared.config.lock().unwrap().status_interval_ms();
        time::sleep(Duration::from_millis(interval)).await;
    }
    Ok(())
}
