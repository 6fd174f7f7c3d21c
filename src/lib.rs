//! Pro DJ Link virtual participant core: impersonates a CDJ-class player
//! on the local Pro DJ Link segment, tracking every real device on the
//! wire and optionally acting as tempo master and command sender.
//!
//! The [`Participant`] handle owns the whole lifecycle: [`Participant::start`]
//! runs the join protocol (spec.md §4.3) and spawns the announcement and
//! ingest tasks; [`Participant::next`] polls lifecycle/command events;
//! [`Participant::subscribe_device_updates`] wires up a listener for the
//! high-frequency per-packet stream.

pub mod beatgrid;
mod clock;
mod config;
mod election;
mod error;
mod listeners;
pub mod message;
mod participant;
mod proto;
mod registry;
mod tasks;

pub use config::ParticipantConfig;
pub use error::{ProlinkError, Result};
pub use message::Message;
pub use participant::Participant;
pub use registry::DeviceAnnouncement;
