//! Tracks which real devices are currently on the network, derived from
//! announcement/keep-alive packets (spec.md §4.2's Device Registry).
//!
//! Grounded on the teacher's `tasks/membership.rs` peer-tracking loop: a
//! `HashMap` keyed by player number, join/leave detected by insert/timeout,
//! generalized here into its own module so the ingest task (§4.3) can own it
//! directly instead of running a dedicated membership task.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use log::info;

const DEFAULT_MAX_AGE: Duration = Duration::from_secs(10);

/// One device's most recently seen announcement/keep-alive.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAnnouncement {
    pub device_number: u8,
    pub name: String,
    pub mac_addr: [u8; 6],
    pub ip_addr: IpAddr,
    pub proto_ver: u8,
}

struct Entry {
    announcement: DeviceAnnouncement,
    last_seen: Instant,
}

/// Join/leave tracker for other devices on the link.
///
/// `ignored_addresses` lets a participant exclude its own announcements
/// (and, during number self-assignment, candidate addresses it's probing)
/// from ever being treated as a peer.
pub struct DeviceRegistry {
    devices: HashMap<u8, Entry>,
    ignored_addresses: Vec<IpAddr>,
    max_age: Duration,
    first_seen: Option<Instant>,
}

/// A registry membership transition, for fan-out to [`crate::listeners`].
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Joined(DeviceAnnouncement),
    Left(DeviceAnnouncement),
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            devices: HashMap::new(),
            ignored_addresses: Vec::new(),
            max_age: DEFAULT_MAX_AGE,
            first_seen: None,
        }
    }

    pub fn set_max_age(&mut self, max_age: Duration) {
        self.max_age = max_age;
    }

    pub fn ignore_address(&mut self, addr: IpAddr) {
        if !self.ignored_addresses.contains(&addr) {
            self.ignored_addresses.push(addr);
        }
    }

    pub fn unignore_address(&mut self, addr: IpAddr) {
        self.ignored_addresses.retain(|a| a != &addr);
    }

    /// Records a freshly-seen announcement, returning a `Joined` event if
    /// this is a new device or a changed identity at an existing number.
    pub fn observe(&mut self, announcement: DeviceAnnouncement, now: Instant) -> Option<RegistryEvent> {
        if self.ignored_addresses.contains(&announcement.ip_addr) {
            return None;
        }
        if self.first_seen.is_none() {
            self.first_seen = Some(now);
        }

        match self.devices.get_mut(&announcement.device_number) {
            Some(existing) if existing.announcement == announcement => {
                existing.last_seen = now;
                None
            }
            Some(existing) => {
                let left = existing.announcement.clone();
                info!(target: "prolink", "device {} identity changed, was {:?}", announcement.device_number, left);
                self.devices.insert(
                    announcement.device_number,
                    Entry {
                        announcement: announcement.clone(),
                        last_seen: now,
                    },
                );
                Some(RegistryEvent::Joined(announcement))
            }
            None => {
                info!(target: "prolink", "device joined: {:?}", announcement);
                self.devices.insert(
                    announcement.device_number,
                    Entry {
                        announcement: announcement.clone(),
                        last_seen: now,
                    },
                );
                Some(RegistryEvent::Joined(announcement))
            }
        }
    }

    /// Drops devices not seen within `max_age`, returning their `Left`
    /// events. Resets `first_device_time` when the registry empties out.
    pub fn expire(&mut self, now: Instant) -> Vec<RegistryEvent> {
        let timed_out: Vec<u8> = self
            .devices
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_seen) > self.max_age)
            .map(|(n, _)| *n)
            .collect();

        let mut events = Vec::new();
        for number in timed_out {
            if let Some(entry) = self.devices.remove(&number) {
                info!(target: "prolink", "device left: {:?}", entry.announcement);
                events.push(RegistryEvent::Left(entry.announcement));
            }
        }
        if self.devices.is_empty() {
            self.first_seen = None;
        }
        events
    }

    pub fn current_devices(&self) -> impl Iterator<Item = &DeviceAnnouncement> {
        self.devices.values().map(|e| &e.announcement)
    }

    pub fn latest_from(&self, player_number: u8) -> Option<&DeviceAnnouncement> {
        self.devices.get(&player_number).map(|e| &e.announcement)
    }

    pub fn is_number_taken(&self, player_number: u8) -> bool {
        self.devices.contains_key(&player_number)
    }

    /// The instant the first announcement was ever observed since the
    /// registry last emptied out, used by the self-assignment wait
    /// (spec.md §4.3 step 4).
    pub fn first_device_time(&self) -> Option<Instant> {
        self.first_seen
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ann(n: u8) -> DeviceAnnouncement {
        DeviceAnnouncement {
            device_number: n,
            name: format!("cdj-{}", n),
            mac_addr: [0, 1, 2, 3, 4, n],
            ip_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)),
            proto_ver: 1,
        }
    }

    #[test]
    fn first_observation_is_a_join() {
        let mut reg = DeviceRegistry::new();
        let now = Instant::now();
        let event = reg.observe(ann(2), now);
        assert_eq!(event, Some(RegistryEvent::Joined(ann(2))));
        assert!(reg.latest_from(2).is_some());
    }

    #[test]
    fn repeat_observation_is_silent() {
        let mut reg = DeviceRegistry::new();
        let now = Instant::now();
        reg.observe(ann(2), now);
        assert_eq!(reg.observe(ann(2), now + Duration::from_millis(50)), None);
    }

    #[test]
    fn ignored_addresses_are_never_joined() {
        let mut reg = DeviceRegistry::new();
        reg.ignore_address(ann(2).ip_addr);
        assert_eq!(reg.observe(ann(2), Instant::now()), None);
        assert!(reg.latest_from(2).is_none());
    }

    #[test]
    fn expiry_emits_left_and_resets_first_seen() {
        let mut reg = DeviceRegistry::new();
        reg.set_max_age(Duration::from_millis(10));
        let now = Instant::now();
        reg.observe(ann(3), now);
        assert!(reg.first_device_time().is_some());

        let later = now + Duration::from_millis(50);
        let events = reg.expire(later);
        assert_eq!(events, vec![RegistryEvent::Left(ann(3))]);
        assert!(reg.first_device_time().is_none());
        assert!(reg.latest_from(3).is_none());
    }

    #[test]
    fn number_taken_reflects_current_membership() {
        let mut reg = DeviceRegistry::new();
        assert!(!reg.is_number_taken(5));
        reg.observe(ann(5), Instant::now());
        assert!(reg.is_number_taken(5));
    }
}
