//! Typed events the participant publishes: decoded wire updates
//! (`DeviceUpdate`, spec.md §3) and lifecycle/command notifications
//! (`Message`, spec.md §4.3/§4.4/§4.8).

use std::net::SocketAddr;
use std::time::Instant;

use crate::registry::DeviceAnnouncement;

/// One decoded, immutable update from a device on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceUpdate {
    CdjStatus(CdjStatusUpdate),
    MixerStatus { source: SocketAddr, seen_at: Instant },
    Beat(BeatUpdate),
    MediaDetails(MediaDetailsUpdate),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CdjStatusUpdate {
    pub source: SocketAddr,
    pub device_number: u8,
    pub seen_at: Instant,
    pub tempo: f64,
    pub beat_within_bar: u8,
    pub is_master: bool,
    /// 0 if not yielding to anyone.
    pub yield_to: u8,
    pub sync_number: u32,
    pub playing: bool,
    pub beat: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatUpdate {
    pub source: SocketAddr,
    pub device_number: u8,
    pub seen_at: Instant,
    pub tempo: f64,
    pub beat_within_bar: u8,
    pub next_beat_ms: u32,
    pub next_bar_ms: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaDetailsUpdate {
    pub source: SocketAddr,
    pub device_number: u8,
    pub track_source_slot: u8,
    pub track_source_type: u8,
    pub rekordbox_id: u32,
}

/// Lifecycle and command-received notifications (spec.md §4.3/§4.4/§4.8).
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Started,
    Stopped,
    DeviceJoined(DeviceAnnouncement),
    DeviceLeft(DeviceAnnouncement),
    /// New master device number, or `None` if mastership is now ours/absent.
    MasterChanged(Option<u8>),
    TempoChanged(f64),
    MediaDetails(MediaDetailsUpdate),
    OnAirChanged { per_player: [u8; 4] },
    FaderStartReceived { per_player: [u8; 4] },
    SyncCommandReceived { from: u8, on: bool },
    MasterHandoffRequested { from: u8 },
    MasterHandoffAcked { from: u8, next_master: u8 },
}
