use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::message::Message;

#[derive(Error, Debug)]
pub enum ProlinkError {
    #[error("terminating")]
    Terminating,

    #[error("{error_kind} error at 0x{pos:x} parsing @{timestamp}: \n{dump}")]
    ParseError {
        error_kind: String,
        pos: usize,
        timestamp: u128,
        dump: String,
    },

    #[error("packet too short for {kind}: got {len} bytes, need at least {min}")]
    MalformedPacket {
        kind: &'static str,
        len: usize,
        min: usize,
    },

    #[error("unrecognized packet magic/type")]
    UnknownKind,

    #[error("no real devices seen on the wire within the join timeout")]
    NoPeers,

    #[error("every standalone device number (5..=15) is already taken")]
    NoAvailableNumber,

    #[error("cannot change device number while sending status")]
    BusySendingStatus,

    #[error("participant is not running")]
    NotRunning,

    #[error("cannot request tempo master while not sending status")]
    NotSendingStatus,

    #[error("device number {0} cannot send status; status senders must use 1..=4")]
    InvalidDeviceNumberForStatus(u8),

    #[error("no announcement has been seen for device {0}")]
    UnknownPeer(u8),

    #[error("socket failure: {0}")]
    SocketFailure(String),

    #[error("interrupted")]
    Interrupted,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    SystemTime(#[from] std::time::SystemTimeError),

    #[error(transparent)]
    WatchRecvError(#[from] watch::error::RecvError),
    #[error(transparent)]
    WatchSendError(#[from] watch::error::SendError<bool>),
    #[error(transparent)]
    MessageSendError(#[from] mpsc::error::SendError<Message>),
}

pub type Result<T> = std::result::Result<T, ProlinkError>;
