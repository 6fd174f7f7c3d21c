//! Beat-sender task (spec.md §4.5): while `sending_status ∧ playing`,
//! wakes just before each beat boundary, emits a **Beat** packet, then
//! sleeps until the next one. `Shared::timeline_notify` wakes the task
//! early whenever the timeline is changed from outside (tempo set, phase
//! adjusted, jump-to-beat, play start/stop) so it can recompute instead
//! of firing on stale timing.
//!
//! Replaces the teacher's passive `BeatTask`, which only listened for
//! other players' beat packets; this one actively drives our own clock.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::time;

use crate::error::Result;
use crate::participant::{Shared, BEATFINDER_PORT};
use crate::proto::BeatPacket;

const SLEEP_THRESHOLD_MS: f64 = 1.0;

fn active(shared: &Shared) -> bool {
    shared.running.load(Ordering::Acquire)
        && shared.sending_status.load(Ordering::Acquire)
        && shared.playing.load(Ordering::Acquire)
}

pub(crate) async fn run(shared: Arc<Shared>) -> Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.set_broadcast(true)?;

    while shared.running.load(Ordering::Acquire) {
        if !active(&shared) {
            shared.timeline_notify.notified().await;
            continue;
        }

        let now = Instant::now();
        let beat_interval = shared.metronome.beat_interval_ms();
        let time_until_next_beat = shared.metronome.time_until_next_beat_ms(now);

        if time_until_next_beat > SLEEP_THRESHOLD_MS {
            let sleep_for = Duration::from_secs_f64((time_until_next_beat - SLEEP_THRESHOLD_MS) / 1000.0);
            tokio::select! {
                _ = time::sleep(sleep_for) => {}
                _ = shared.timeline_notify.notified() => continue,
            }
        }

        if !active(&shared) {
            continue;
        }

        // Busy-wait the last sub-millisecond so the beat fires as close to
        // the boundary as the scheduler allows.
        while shared.metronome.time_until_next_beat_ms(Instant::now()) > 0.05 {
            std::hint::spin_loop();
        }

        let broadcast_addr = match shared.net.lock().unwrap().as_ref() {
            Some(net) => net.broadcast_addr,
            None => break,
        };
        let snapshot = shared.metronome.snapshot_at(Instant::now());
        let pkt = BeatPacket {
            device_number: shared.device_number.load(Ordering::Acquire),
            next_beat_ms: beat_interval.round() as u32,
            next_bar_ms: shared.metronome.bar_interval_ms().round() as u32,
            tempo: snapshot.tempo,
            beat_within_bar: snapshot.beat_within_bar,
        };
        let mut buf = Vec::new();
        pkt.write(&mut buf)?;
        let _ = socket.send_to(&buf, (broadcast_addr.ip(), BEATFINDER_PORT)).await;
    }
    Ok(())
}
