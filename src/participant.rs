//! The virtual participant: owns the sockets, the announcement/ingest/
//! status-send/beat-sender tasks, and the master-election state (spec.md
//! §4.3, "Virtual Participant Lifecycle"). Grounded on the teacher's
//! `Prolink` handle (`lib.rs`'s `join`/`next`/`terminate`), generalized
//! from a fixed join-and-run handshake into the full
//! Stopped/Starting/Running/Stopping state machine spec.md describes.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use log::{error, info, warn};
use mac_address::mac_address_by_name;
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::{Metronome, Snapshot};
use crate::config::ParticipantConfig;
use crate::election::{ElectionEvent, MasterElection, RequestOutcome};
use crate::error::{ProlinkError, Result};
use crate::listeners::ListenerSet;
use crate::message::{DeviceUpdate, Message};
use crate::proto;
use crate::registry::{DeviceAnnouncement, DeviceRegistry};
use crate::tasks;

pub const ANNOUNCE_PORT: u16 = 50000;
pub const BEATFINDER_PORT: u16 = 50001;
pub const STATUS_PORT: u16 = 50002;

const PEER_WAIT_POLLS: u32 = 20;
const PEER_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SELF_ASSIGN_WAIT: Duration = Duration::from_secs(4);

/// Bound network identity a running participant uses to speak on the wire.
#[derive(Debug, Clone)]
pub(crate) struct NetIdentity {
    pub mac_addr: [u8; 6],
    pub ip_addr: [u8; 4],
    pub broadcast_addr: SocketAddr,
    pub bound_addr: SocketAddr,
}

/// State shared by every task a running participant owns. Mutated mostly
/// from the ingest task (election, registry) per spec.md §5's
/// single-writer rule; scalars the other tasks read are plain atomics.
pub(crate) struct Shared {
    pub config: Mutex<ParticipantConfig>,
    pub device_number: AtomicU8,
    pub playing: AtomicBool,
    pub sending_status: AtomicBool,
    pub synced: AtomicBool,
    pub on_air: AtomicBool,
    pub running: AtomicBool,

    pub metronome: Metronome,
    pub where_stopped: Mutex<Option<Snapshot>>,
    pub election: Mutex<MasterElection>,
    pub registry: Mutex<DeviceRegistry>,

    pub device_updates: ListenerSet<DeviceUpdate>,
    pub msg_tx: mpsc::Sender<Message>,

    pub net: Mutex<Option<NetIdentity>>,
    pub timeline_notify: tokio::sync::Notify,
    /// The wire-encoded announcement broadcast by `tasks::announce`; kept
    /// here rather than handed to the task by value so `set_device_number`
    /// can re-patch it without restarting the task.
    pub announce_template: Mutex<Vec<u8>>,
}

impl Shared {
    fn our_device_number(&self) -> u8 {
        self.device_number.load(Ordering::Acquire)
    }

    pub(crate) fn is_own_address(&self, addr: IpAddr) -> bool {
        self.net
            .lock()
            .unwrap()
            .as_ref()
            .map(|net| net.bound_addr.ip() == addr)
            .unwrap_or(false)
    }

    /// Publishes election events as `Message`s; best-effort (the channel
    /// may be full or the receiver gone during shutdown).
    pub(crate) fn publish_election_events(&self, events: Vec<ElectionEvent>) {
        for event in events {
            let msg = match event {
                ElectionEvent::MasterChanged(n) => Message::MasterChanged(n),
                ElectionEvent::TempoChanged(t) => Message::TempoChanged(t),
            };
            let _ = self.msg_tx.try_send(msg);
        }
    }
}

pub struct Participant {
    shared: Arc<Shared>,
    child_tasks: Vec<JoinHandle<()>>,
    msg_rx: mpsc::Receiver<Message>,
}

fn ipv4_iface(iface: &NetworkInterface) -> Option<(String, network_interface::V4IfAddr)> {
    match iface.addr {
        Some(Addr::V4(a)) => Some((iface.name.clone(), a)),
        _ => None,
    }
}

impl Participant {
    pub fn new(config: ParticipantConfig) -> Participant {
        let (msg_tx, msg_rx) = mpsc::channel(256);
        let device_number = config.device_number();
        let tempo_epsilon = config.tempo_epsilon();
        let shared = Arc::new(Shared {
            config: Mutex::new(config),
            device_number: AtomicU8::new(device_number),
            playing: AtomicBool::new(false),
            sending_status: AtomicBool::new(false),
            synced: AtomicBool::new(false),
            on_air: AtomicBool::new(false),
            running: AtomicBool::new(false),
            metronome: Metronome::new(120.0),
            where_stopped: Mutex::new(None),
            election: Mutex::new(MasterElection::new(device_number, 120.0, tempo_epsilon)),
            registry: Mutex::new(DeviceRegistry::new()),
            device_updates: ListenerSet::new("device-update"),
            msg_tx,
            net: Mutex::new(None),
            timeline_notify: tokio::sync::Notify::new(),
            announce_template: Mutex::new(Vec::new()),
        });
        Participant {
            shared,
            child_tasks: Vec::new(),
            msg_rx,
        }
    }

    pub fn subscribe_device_updates(&self, listener: Arc<dyn crate::listeners::Listener<DeviceUpdate>>) {
        self.shared.device_updates.subscribe(listener);
    }

    pub async fn next(&mut self) -> Result<Message> {
        self.msg_rx
            .recv()
            .await
            .ok_or_else(|| anyhow!("participant has stopped").into())
    }

    /// Start protocol, spec.md §4.3 steps 1-8.
    pub async fn start(&mut self) -> Result<()> {
        let shared = &self.shared;

        // Step 2: wait up to 10s for at least one real device.
        let mut seen_any = false;
        let announce_probe = UdpSocket::bind(("0.0.0.0", ANNOUNCE_PORT)).await?;
        announce_probe.set_broadcast(true)?;
        let mut buf = [0u8; 2048];
        let deadline = Instant::now() + PEER_WAIT_POLL_INTERVAL * PEER_WAIT_POLLS;
        while Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = remaining.min(PEER_WAIT_POLL_INTERVAL);
            match tokio::time::timeout(wait, announce_probe.recv_from(&mut buf)).await {
                Ok(Ok((len, src))) => {
                    if let Some(proto::Kind::Announcement) =
                        proto::validate_header(&buf[..len], ANNOUNCE_PORT)
                    {
                        if let Ok(proto::Packet::Announcement(a)) = proto::Packet::decode(&buf[..len]) {
                            let mut registry = shared.registry.lock().unwrap();
                            registry.observe(
                                DeviceAnnouncement {
                                    device_number: a.device_number,
                                    name: a.name,
                                    mac_addr: a.mac_addr,
                                    ip_addr: src.ip(),
                                    proto_ver: 0,
                                },
                                Instant::now(),
                            );
                            seen_any = true;
                        }
                    }
                }
                _ => {}
            }
        }
        if !seen_any {
            return Err(ProlinkError::NoPeers);
        }

        // Step 3: pick the local interface whose broadcast network matches
        // a discovered device.
        let discovered_ips: Vec<IpAddr> = shared
            .registry
            .lock()
            .unwrap()
            .current_devices()
            .map(|d| d.ip_addr)
            .collect();

        let all_interfaces =
            NetworkInterface::show().map_err(|e| anyhow!("can't get network interfaces: {}", e))?;
        let matching: Vec<(String, network_interface::V4IfAddr)> = all_interfaces
            .iter()
            .filter_map(ipv4_iface)
            .filter(|(_, addr)| {
                discovered_ips.iter().any(|ip| match ip {
                    IpAddr::V4(v4) => same_prefix(addr.ip, *v4, addr.netmask.unwrap_or(Ipv4Addr::BROADCAST)),
                    IpAddr::V6(_) => false,
                })
            })
            .collect();
        if matching.len() > 1 {
            warn!(target: "prolink", "multiple local interfaces match a discovered device; duplicate packets may break state tracking: {:?}", matching.iter().map(|(n, _)| n).collect::<Vec<_>>());
        }
        let (iface_name, addr) = matching
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no local interface matches a discovered device"))?;

        let mac = mac_address_by_name(&iface_name)
            .map_err(|e| anyhow!("failed to look up mac address: {}", e))?
            .ok_or_else(|| anyhow!("failed to look up mac address"))?;
        let mac_addr = mac.bytes();
        let ip_addr = addr.ip.octets();
        let broadcast_addr = SocketAddr::new(
            IpAddr::V4(addr.broadcast.ok_or_else(|| anyhow!("interface has no broadcast address"))?),
            ANNOUNCE_PORT,
        );

        // Step 4: self-assign a device number if requested.
        let requested = shared.device_number.load(Ordering::Acquire);
        let assigned = if requested == 0 {
            let first_seen = shared.registry.lock().unwrap().first_device_time();
            if let Some(first_seen) = first_seen {
                let wait_until = first_seen + SELF_ASSIGN_WAIT;
                if Instant::now() < wait_until {
                    tokio::time::sleep(wait_until - Instant::now()).await;
                }
            }
            let use_standard = shared.config.lock().unwrap().use_standard_player_number();
            self.pick_device_number(use_standard)?
        } else {
            requested
        };
        shared.device_number.store(assigned, Ordering::Release);
        shared.election.lock().unwrap().set_our_device_number(assigned);

        // Step 5/6: patch the announcement template, bind the status socket.
        let device_name = shared.config.lock().unwrap().device_name().to_string();
        let mut template = Vec::new();
        proto::AnnouncementPacket {
            name: device_name,
            device_number: assigned,
            mac_addr,
            ip_addr,
        }
        .write(&mut template)?;
        *shared.announce_template.lock().unwrap() = template;

        let bound_addr = SocketAddr::new(IpAddr::V4(addr.ip), STATUS_PORT);
        let status_socket = Arc::new(UdpSocket::bind(bound_addr).await?);

        // Step 7: ignore our own address in the registry.
        shared.registry.lock().unwrap().ignore_address(bound_addr.ip());

        *shared.net.lock().unwrap() = Some(NetIdentity {
            mac_addr,
            ip_addr,
            broadcast_addr,
            bound_addr,
        });

        shared.running.store(true, Ordering::Release);

        // Step 8: spawn the ingest and announcement tasks.
        let announce_socket = Arc::new(announce_probe);
        let ingest_shared = shared.clone();
        let ingest_socket = status_socket.clone();
        self.child_tasks.push(tokio::spawn(async move {
            if let Err(e) = tasks::ingest::run(ingest_shared, ingest_socket).await {
                error!(target: "prolink", "ingest task error: {}", e);
            }
        }));

        let announce_shared = shared.clone();
        self.child_tasks.push(tokio::spawn(async move {
            if let Err(e) = tasks::announce::run(announce_shared, announce_socket).await
            {
                error!(target: "prolink", "announce task error: {}", e);
            }
        }));

        let _ = shared.msg_tx.try_send(Message::Started);
        info!(target: "prolink", "participant started as device {}", assigned);
        Ok(())
    }

    fn pick_device_number(&self, use_standard: bool) -> Result<u8> {
        let registry = self.shared.registry.lock().unwrap();
        let standard_range = 1u8..=4;
        let fallback_range = 5u8..=15;
        if use_standard {
            if let Some(n) = standard_range
                .clone()
                .find(|n| !registry.is_number_taken(*n))
            {
                return Ok(n);
            }
        }
        fallback_range
            .clone()
            .find(|n| !registry.is_number_taken(*n))
            .ok_or(ProlinkError::NoAvailableNumber)
    }

    /// Stop protocol, spec.md §4.3: idempotent, releases every resource.
    pub async fn stop(&mut self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(net) = self.shared.net.lock().unwrap().take() {
            self.shared.registry.lock().unwrap().unignore_address(net.bound_addr.ip());
        }
        for t in self.child_tasks.drain(..) {
            t.abort();
        }
        self.shared.device_number.store(0, Ordering::Release);
        let _ = self.shared.msg_tx.try_send(Message::Stopped);
    }

    fn require_running(&self) -> Result<()> {
        if self.shared.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ProlinkError::NotRunning)
        }
    }

    /// Re-numbers a running participant (spec.md §5). Rejected while we're
    /// sending status, since other devices are already addressing unicast
    /// traffic to the current number and a mid-stream renumber would orphan
    /// it; stop status sending first.
    pub fn set_device_number(&self, n: u8) -> Result<()> {
        self.require_running()?;
        if self.shared.sending_status.load(Ordering::Acquire) {
            return Err(ProlinkError::BusySendingStatus);
        }
        self.shared.config.lock().unwrap().set_device_number(n)?;
        self.shared.device_number.store(n, Ordering::Release);
        self.shared.election.lock().unwrap().set_our_device_number(n);

        let device_name = self.shared.config.lock().unwrap().device_name().to_string();
        let net = self.shared.net.lock().unwrap().clone().ok_or(ProlinkError::NotRunning)?;
        let mut template = Vec::new();
        proto::AnnouncementPacket {
            name: device_name,
            device_number: n,
            mac_addr: net.mac_addr,
            ip_addr: net.ip_addr,
        }
        .write(&mut template)?;
        *self.shared.announce_template.lock().unwrap() = template;
        Ok(())
    }

    // ---- §4.4 explicit master election ----

    pub async fn become_tempo_master(&self) -> Result<()> {
        self.require_running()?;
        let sending_status = self.shared.sending_status.load(Ordering::Acquire);
        let outcome = self.shared.election.lock().unwrap().request_master(sending_status)?;
        match outcome {
            RequestOutcome::TookMasterImmediately(events) => {
                self.shared.publish_election_events(events);
                Ok(())
            }
            RequestOutcome::RequestSentTo(target) => {
                let peer_addr = self.peer_addr(target)?;
                let our_number = self.shared.our_device_number();
                let pkt = proto::MasterHandoffRequestPacket {
                    requesting_device: our_number,
                    target_device: target,
                };
                self.send_to(peer_addr, |w| pkt.write(w)).await
            }
        }
    }

    fn peer_addr(&self, device_number: u8) -> Result<SocketAddr> {
        let registry = self.shared.registry.lock().unwrap();
        let announcement = registry
            .latest_from(device_number)
            .ok_or(ProlinkError::UnknownPeer(device_number))?;
        Ok(SocketAddr::new(announcement.ip_addr, STATUS_PORT))
    }

    async fn send_to(
        &self,
        addr: SocketAddr,
        write: impl FnOnce(&mut dyn std::io::Write) -> std::io::Result<()>,
    ) -> Result<()> {
        let net = self.shared.net.lock().unwrap().clone();
        let net = net.ok_or(ProlinkError::NotRunning)?;
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(net.ip_addr)), 0)).await?;
        let mut buf = Vec::new();
        write(&mut buf)?;
        socket.send_to(&buf, addr).await?;
        Ok(())
    }

    // ---- §4.8 command surface ----

    pub async fn send_media_query(&self, target: u8, slot: u8) -> Result<()> {
        self.require_running()?;
        let addr = self.peer_addr(target)?;
        let net = self.shared.net.lock().unwrap().clone().ok_or(ProlinkError::NotRunning)?;
        let pkt = proto::MediaQueryPacket {
            device_number: self.shared.our_device_number(),
            source_ip: net.ip_addr,
            target_player: target,
            slot,
        };
        self.send_to(addr, |w| pkt.write(w)).await
    }

    pub async fn send_sync_mode(&self, target: u8, on: bool) -> Result<()> {
        self.require_running()?;
        let addr = self.peer_addr(target)?;
        let pkt = proto::SyncControlPacket {
            command: if on {
                proto::SyncCommand::On
            } else {
                proto::SyncCommand::Off
            },
        };
        self.send_to(addr, |w| pkt.write(w)).await
    }

    pub async fn appoint_tempo_master(&self, target: u8) -> Result<()> {
        self.require_running()?;
        let addr = self.peer_addr(target)?;
        let pkt = proto::SyncControlPacket {
            command: proto::SyncCommand::BecomeMaster,
        };
        self.send_to(addr, |w| pkt.write(w)).await
    }

    pub async fn send_fader_start(&self, start_set: &[u8], stop_set: &[u8]) -> Result<()> {
        self.require_running()?;
        let mut per_player = [proto::FaderStartPacket::NO_OP; 4];
        for &n in start_set {
            if (1..=4).contains(&n) {
                per_player[(n - 1) as usize] = proto::FaderStartPacket::START;
            }
        }
        for &n in stop_set {
            if (1..=4).contains(&n) {
                per_player[(n - 1) as usize] = proto::FaderStartPacket::STOP;
            }
        }
        let pkt = proto::FaderStartPacket { per_player };
        let net = self.shared.net.lock().unwrap().clone().ok_or(ProlinkError::NotRunning)?;
        self.send_to(net.broadcast_addr, |w| pkt.write(w)).await
    }

    pub async fn send_on_air(&self, on_air: &[u8]) -> Result<()> {
        self.require_running()?;
        let mut per_player = [0u8; 4];
        for &n in on_air {
            if (1..=4).contains(&n) {
                per_player[(n - 1) as usize] = 1;
            }
        }
        let pkt = proto::ChannelsOnAirPacket { per_player };
        let net = self.shared.net.lock().unwrap().clone().ok_or(ProlinkError::NotRunning)?;
        self.send_to(net.broadcast_addr, |w| pkt.write(w)).await
    }

    pub async fn send_load_track(
        &self,
        target: u8,
        rekordbox_id: u32,
        source_player: u8,
        source_slot: u8,
        source_type: u8,
    ) -> Result<()> {
        self.require_running()?;
        let addr = self.peer_addr(target)?;
        let pkt = proto::LoadTrackPacket {
            target_device: target,
            sender_device: self.shared.our_device_number(),
            source_player,
            source_slot,
            source_type,
            rekordbox_id,
        };
        self.send_to(addr, |w| pkt.write(w)).await
    }

    // ---- §4.9 playback position management ----

    pub fn set_playing(&self, playing: bool) {
        let now = Instant::now();
        if playing {
            if let Some(snapshot) = self.shared.where_stopped.lock().unwrap().take() {
                self.shared.metronome.jump_to_beat(snapshot.beat, now);
            }
        } else {
            *self.shared.where_stopped.lock().unwrap() = Some(self.shared.metronome.snapshot_at(now));
        }
        self.shared.playing.store(playing, Ordering::Release);
        self.shared.timeline_notify.notify_waiters();
    }

    pub fn jump_to_beat(&self, n: u64) {
        let now = Instant::now();
        if self.shared.playing.load(Ordering::Acquire) {
            self.shared.metronome.jump_to_beat(n, now);
        } else {
            let mut stopped = self.shared.where_stopped.lock().unwrap();
            let tempo = self.shared.metronome.tempo();
            let wrapped = if n == 0 { 1 } else { ((n - 1) % crate::clock::MAX_BEAT) + 1 };
            *stopped = Some(Snapshot {
                beat: wrapped,
                beat_within_bar: (((wrapped - 1) % 4) + 1) as u8,
                tempo,
                beat_interval_ms: 60_000.0 / tempo,
                bar_interval_ms: 60_000.0 / tempo * 4.0,
                distance_from_nearest_beat_ms: 0.0,
            });
        }
        self.shared.timeline_notify.notify_waiters();
    }

    pub fn adjust_playback_position(&self, ms: f64) {
        self.shared.metronome.adjust_start(-ms, Instant::now());
        self.shared.timeline_notify.notify_waiters();
    }

    pub fn set_synced(&self, synced: bool) {
        self.shared.synced.store(synced, Ordering::Release);
    }

    pub fn set_on_air(&self, on_air: bool) {
        self.shared.on_air.store(on_air, Ordering::Release);
    }

    /// Enables/disables status synthesis; requires `device_number` in
    /// 1..=4 (spec.md §4.6).
    pub async fn set_sending_status(&mut self, sending: bool) -> Result<()> {
        self.require_running()?;
        if sending {
            let number = self.shared.our_device_number();
            if !(1..=4).contains(&number) {
                return Err(ProlinkError::InvalidDeviceNumberForStatus(number));
            }
            self.shared.sending_status.store(true, Ordering::Release);
            let net = self.shared.net.lock().unwrap().clone().ok_or(ProlinkError::NotRunning)?;
            let status_socket = Arc::new(UdpSocket::bind(SocketAddr::new(net.bound_addr.ip(), 0)).await?);
            let shared = self.shared.clone();
            self.child_tasks
                .push(tokio::spawn(async move {
                    if let Err(e) = tasks::status_send::run(shared, status_socket).await {
                        error!(target: "prolink", "status-send task error: {}", e);
                    }
                }));
            let shared = self.shared.clone();
            self.child_tasks
                .push(tokio::spawn(async move {
                    if let Err(e) = tasks::beat::run(shared).await {
                        error!(target: "prolink", "beat task error: {}", e);
                    }
                }));
        } else {
            self.shared.sending_status.store(false, Ordering::Release);
        }
        Ok(())
    }
}

fn same_prefix(a: Ipv4Addr, b: Ipv4Addr, netmask: Ipv4Addr) -> bool {
    let mask = u32::from(netmask);
    u32::from(a) & mask == u32::from(b) & mask
}
