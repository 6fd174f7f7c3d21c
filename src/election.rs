//! Tempo-master election and handoff state machine (spec.md §4.4).
//!
//! Mutated exclusively from the ingest task (see `src/tasks/ingest.rs`) so
//! it never needs its own lock; this mirrors the teacher's single-writer
//! `MembershipTask` owning `peers` outright rather than sharing it behind a
//! mutex.

use std::net::SocketAddr;

use log::warn;

pub const NO_MASTER: u8 = 0xFF;
pub const NO_REQUEST: u8 = 0;

/// The subset of an incoming CDJ status packet the election cares about.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusView {
    pub device_number: u8,
    pub addr: SocketAddr,
    pub is_master: bool,
    /// 0 = not yielding.
    pub yield_to: u8,
    pub sync_counter: u32,
    pub effective_tempo: f64,
}

/// Events the election state machine raises for listener fan-out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ElectionEvent {
    /// New master device number, or `None` if mastership is now ours/absent.
    MasterChanged(Option<u8>),
    TempoChanged(f64),
}

pub struct MasterElection {
    our_device_number: u8,
    tempo_epsilon: f64,

    pub am_master: bool,
    pub next_master: u8,
    pub requesting_from: u8,
    pub yielded_from: u8,
    pub sync_counter: u32,
    pub largest_seen_sync_counter: u32,

    current_master: Option<(u8, SocketAddr)>,
    master_tempo: f64,
    our_tempo: f64,
}

impl MasterElection {
    pub fn new(our_device_number: u8, our_tempo: f64, tempo_epsilon: f64) -> Self {
        MasterElection {
            our_device_number,
            tempo_epsilon,
            am_master: false,
            next_master: NO_MASTER,
            requesting_from: NO_REQUEST,
            yielded_from: NO_REQUEST,
            sync_counter: 0,
            largest_seen_sync_counter: 0,
            current_master: None,
            master_tempo: our_tempo,
            our_tempo,
        }
    }

    pub fn set_our_device_number(&mut self, n: u8) {
        self.our_device_number = n;
    }

    pub fn set_our_tempo(&mut self, tempo: f64) -> Vec<ElectionEvent> {
        self.our_tempo = tempo;
        // Our own tempo only becomes "the" tempo while we're master.
        if self.am_master {
            self.set_master_tempo(tempo)
        } else {
            Vec::new()
        }
    }

    pub fn current_master(&self) -> Option<(u8, SocketAddr)> {
        self.current_master
    }

    fn set_tempo_master(&mut self, new: Option<(u8, SocketAddr)>) -> ElectionEvent {
        self.current_master = new;
        ElectionEvent::MasterChanged(new.map(|(n, _)| n))
    }

    fn set_master_tempo(&mut self, tempo: f64) -> Vec<ElectionEvent> {
        let mut events = Vec::new();
        let master_exists = self.current_master.is_some() || self.am_master;
        if master_exists && (tempo - self.master_tempo).abs() > self.tempo_epsilon {
            events.push(ElectionEvent::TempoChanged(tempo));
        }
        self.master_tempo = tempo;
        events
    }

    /// Applies spec.md §4.4's pseudocode for one incoming CDJ status packet.
    pub fn on_status_update(&mut self, u: &StatusView) -> Vec<ElectionEvent> {
        let mut events = Vec::new();

        if u.is_master {
            if u.yield_to == 0 {
                if self.am_master && self.next_master == u.device_number {
                    self.sync_counter = self.largest_seen_sync_counter + 1;
                } else if self.am_master {
                    warn!(target: "prolink", "unsolicited master takeover by device {}", u.device_number);
                }
                self.am_master = false;
                self.next_master = NO_MASTER;
                events.push(self.set_tempo_master(Some((u.device_number, u.addr))));
                events.extend(self.set_master_tempo(u.effective_tempo));
            } else if u.yield_to == self.our_device_number {
                if u.device_number != self.yielded_from {
                    warn!(target: "prolink", "unsolicited or unexpected yield from device {}", u.device_number);
                }
                self.am_master = true;
                self.yielded_from = NO_REQUEST;
                events.push(self.set_tempo_master(None));
                events.extend(self.set_master_tempo(self.our_tempo));
            }
        } else if let Some((_, addr)) = self.current_master {
            if addr == u.addr {
                events.push(self.set_tempo_master(None));
            }
        }

        self.largest_seen_sync_counter = self.largest_seen_sync_counter.max(u.sync_counter);
        events
    }

    /// `become_tempo_master` (spec.md §4.4). Returns `Some(target)` if the
    /// caller must unicast a `MasterHandoffRequest` to `target`; otherwise
    /// mastership was taken immediately and the returned event should be
    /// published.
    pub fn request_master(&mut self, sending_status: bool) -> crate::error::Result<RequestOutcome> {
        if !sending_status {
            return Err(crate::error::ProlinkError::NotSendingStatus);
        }
        if let Some((master_number, _)) = self.current_master {
            self.requesting_from = master_number;
            Ok(RequestOutcome::RequestSentTo(master_number))
        } else {
            self.am_master = true;
            let event = self.set_tempo_master(None);
            let tempo_events = self.set_master_tempo(self.our_tempo);
            let mut events = vec![event];
            events.extend(tempo_events);
            Ok(RequestOutcome::TookMasterImmediately(events))
        }
    }

    /// `MasterHandoffResponse(yield=true, from=d)`.
    pub fn receive_handoff_response(&mut self, yield_flag: bool, from: u8, sending_status: bool) {
        if sending_status && yield_flag && from == self.requesting_from {
            self.yielded_from = from;
            self.requesting_from = NO_REQUEST;
        }
    }

    /// `YieldMasterTo(d)` command. Returns the device to Ack if we act on it.
    pub fn receive_yield_command(&mut self, target: u8) -> Option<u8> {
        if self.am_master && target != self.our_device_number {
            self.next_master = target;
            Some(target)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    RequestSentTo(u8),
    TookMasterImmediately(Vec<ElectionEvent>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 50002)
    }

    fn status(device_number: u8, is_master: bool, yield_to: u8) -> StatusView {
        StatusView {
            device_number,
            addr: addr(device_number),
            is_master,
            yield_to,
            sync_counter: 1,
            effective_tempo: 128.0,
        }
    }

    #[test]
    fn s2_unsolicited_master_takeover() {
        let mut election = MasterElection::new(2, 120.0, 0.0001);
        election.am_master = true;
        election.next_master = NO_MASTER;

        let events = election.on_status_update(&status(5, true, 0));

        assert!(!election.am_master);
        assert_eq!(election.current_master(), Some((5, addr(5))));
        assert!(events.contains(&ElectionEvent::MasterChanged(Some(5))));
    }

    #[test]
    fn request_master_takes_role_immediately_when_none_exists() {
        let mut election = MasterElection::new(3, 120.0, 0.0001);
        match election.request_master(true).unwrap() {
            RequestOutcome::TookMasterImmediately(_) => assert!(election.am_master),
            _ => panic!("expected immediate mastership with no existing master"),
        }
    }

    #[test]
    fn s3_assisted_handoff_to_us() {
        let mut election = MasterElection::new(3, 120.0, 0.0001);
        // A master (device 7) already exists.
        election.on_status_update(&status(7, true, 0));
        match election.request_master(true).unwrap() {
            RequestOutcome::RequestSentTo(target) => assert_eq!(target, 7),
            _ => panic!("expected a handoff request"),
        }
        election.receive_handoff_response(true, 7, true);
        assert_eq!(election.yielded_from, 7);
        assert_eq!(election.requesting_from, NO_REQUEST);

        let events = election.on_status_update(&status(7, true, 3));
        assert!(election.am_master);
        assert_eq!(election.yielded_from, NO_REQUEST);
        assert!(events.contains(&ElectionEvent::MasterChanged(None)));
    }

    #[test]
    fn yield_command_sets_next_master_and_acks() {
        let mut election = MasterElection::new(1, 120.0, 0.0001);
        election.am_master = true;
        let ack_target = election.receive_yield_command(4);
        assert_eq!(ack_target, Some(4));
        assert_eq!(election.next_master, 4);

        // Device 4 now asserts normal mastery; next_master clears.
        election.on_status_update(&status(4, true, 0));
        assert_eq!(election.next_master, NO_MASTER);
        assert!(!election.am_master);
    }

    #[test]
    fn tempo_change_gated_by_epsilon_and_master_presence() {
        let mut election = MasterElection::new(2, 120.0, 1.0);
        // No master yet: tiny tempo drift from a non-master packet does nothing.
        let events = election.on_status_update(&status(9, false, 0));
        assert!(events.is_empty());

        election.on_status_update(&status(9, true, 0));
        let events = election.on_status_update(&status(9, true, 0).tweak_tempo(128.5));
        assert!(events.is_empty(), "drift under epsilon should not publish");

        let events = election.on_status_update(&status(9, true, 0).tweak_tempo(135.0));
        assert!(events.iter().any(|e| matches!(e, ElectionEvent::TempoChanged(_))));
    }

    #[test]
    fn resignation_clears_master_when_source_matches() {
        let mut election = MasterElection::new(2, 120.0, 0.0001);
        election.on_status_update(&status(6, true, 0));
        assert!(election.current_master().is_some());

        let events = election.on_status_update(&status(6, false, 0));
        assert_eq!(election.current_master(), None);
        assert!(events.contains(&ElectionEvent::MasterChanged(None)));
    }

    impl StatusView {
        fn tweak_tempo(mut self, tempo: f64) -> Self {
            self.effective_tempo = tempo;
            self
        }
    }
}
