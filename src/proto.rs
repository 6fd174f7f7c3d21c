use std::convert::TryInto;
use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};
use nom::bytes::complete::{tag, take};
use nom::error::context;
use nom::number::complete::{be_u16, be_u32, be_u8};
use nom::IResult;
use nom_locate::LocatedSpan;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use pretty_hex::pretty_hex;

use crate::{ProlinkError, Result};

type Span<'a> = LocatedSpan<&'a [u8]>;

/// Fixed 10-byte magic every PDL packet starts with (spec.md §4.1).
const MAGIC: &[u8] = &[0x51, 0x73, 0x70, 0x74, 0x31, 0x57, 0x6d, 0x4a, 0x4f, 0x4c];

/// Byte following the type byte: 0x00 on announcement packets, 0x01 on
/// every other kind (the "reserved" byte in the 12-byte preamble).
const RESERVED_ANNOUNCE: u8 = 0x00;
const RESERVED_OTHER: u8 = 0x01;

#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum Kind {
    Announcement = 0x06,
    FaderStart = 0x02,
    ChannelsOnAir = 0x03,
    MediaQuery = 0x05,
    CdjStatus = 0x0A,
    LoadTrack = 0x19,
    MasterHandoffRequest = 0x26,
    MasterHandoffAck = 0x27,
    Beat = 0x28,
    MixerStatus = 0x29,
    SyncControl = 0x2A,
}

impl Kind {
    fn min_payload_len(self) -> usize {
        match self {
            Kind::Announcement => 0x36 - 12, // table's min len is whole-packet for announce
            Kind::CdjStatus => 208,
            Kind::MixerStatus => 56,
            Kind::Beat => 96,
            Kind::LoadTrack => 58,
            Kind::SyncControl => 13,
            Kind::FaderStart => 9,
            Kind::ChannelsOnAir => 14,
            Kind::MediaQuery => 17,
            Kind::MasterHandoffRequest => 9,
            Kind::MasterHandoffAck => 13,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Kind::Announcement => "Announcement",
            Kind::CdjStatus => "CdjStatus",
            Kind::MixerStatus => "MixerStatus",
            Kind::Beat => "Beat",
            Kind::LoadTrack => "LoadTrack",
            Kind::SyncControl => "SyncControl",
            Kind::FaderStart => "FaderStart",
            Kind::ChannelsOnAir => "ChannelsOnAir",
            Kind::MediaQuery => "MediaQuery",
            Kind::MasterHandoffRequest => "MasterHandoffRequest",
            Kind::MasterHandoffAck => "MasterHandoffAck",
        }
    }
}

/// Recognises a buffer's magic/type and returns its `Kind`, tolerating
/// packets longer than the declared minimum (spec.md §4.1). Does not
/// check `expected_port`; callers bind one socket per port already, so
/// this only exists to let a caller assert a packet arrived where it
/// should have.
pub fn validate_header(buffer: &[u8], _expected_port: u16) -> Option<Kind> {
    if buffer.len() < 12 || &buffer[0..10] != MAGIC {
        return None;
    }
    Kind::from_u8(buffer[10])
}

fn header(i: Span) -> IResult<Span, ()> {
    let (i, _) = tag(MAGIC)(i)?;
    Ok((i, ()))
}

fn preamble(kind_byte: u8, reserved: u8) -> impl Fn(Span) -> IResult<Span, ()> {
    move |i: Span| {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[kind_byte])(i)?;
        let (i, _) = tag(&[reserved])(i)?;
        Ok((i, ()))
    }
}

fn write_preamble(w: &mut dyn Write, kind: Kind, reserved: u8) -> std::io::Result<()> {
    w.write_all(MAGIC)?;
    w.write_u8(kind as u8)?;
    w.write_u8(reserved)?;
    Ok(())
}

fn device_name_20(i: Span) -> IResult<Span, String> {
    let (i, raw) = take(20usize)(i)?;
    let name = String::from_utf8_lossy(raw.fragment());
    Ok((i, name.trim_end_matches('\0').to_string()))
}

fn write_device_name_20(w: &mut dyn Write, name: &str) -> std::io::Result<()> {
    let mut buf = [0u8; 20];
    let bytes = name.as_bytes();
    let n = bytes.len().min(20);
    buf[..n].copy_from_slice(&bytes[..n]);
    w.write_all(&buf)
}

fn mac_addr(i: Span) -> IResult<Span, [u8; 6]> {
    let (i, raw) = take(6usize)(i)?;
    Ok((i, (*raw.fragment()).try_into().unwrap()))
}

fn ip_addr(i: Span) -> IResult<Span, [u8; 4]> {
    let (i, raw) = take(4usize)(i)?;
    Ok((i, (*raw.fragment()).try_into().unwrap()))
}

/// Announcement packet (spec.md §6): name@0x0C(20), dev#@0x24, MAC@0x26(6),
/// IPv4@0x2C(4), padded to the 54-byte minimum.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnouncementPacket {
    pub name: String,
    pub device_number: u8,
    pub mac_addr: [u8; 6],
    pub ip_addr: [u8; 4],
}

impl AnnouncementPacket {
    pub const MIN_LEN: usize = 0x36;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_preamble(w, Kind::Announcement, RESERVED_ANNOUNCE)?;
        write_device_name_20(w, &self.name)?;
        w.write_all(&[0u8; 4])?; // 0x20..0x24 unknown
        w.write_u8(self.device_number)?;
        w.write_u8(0x00)?; // 0x25 reserved
        w.write_all(&self.mac_addr)?;
        w.write_all(&self.ip_addr)?;
        w.write_all(&[0u8; 6])?; // 0x30..0x36 padding
        Ok(())
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = preamble(Kind::Announcement as u8, RESERVED_ANNOUNCE)(i)?;
        let (i, name) = device_name_20(i)?;
        let (i, _) = take(4usize)(i)?;
        let (i, device_number) = be_u8(i)?;
        let (i, _) = take(1usize)(i)?;
        let (i, mac_addr) = mac_addr(i)?;
        let (i, ip_addr) = ip_addr(i)?;
        Ok((
            i,
            Packet::Announcement(AnnouncementPacket {
                name,
                device_number,
                mac_addr,
                ip_addr,
            }),
        ))
    }
}

/// CDJ status packet (spec.md §4.6/§6). Every field offset below is
/// payload-relative (12 bytes added for the magic+type+reserved preamble).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CdjStatusPacket {
    pub device_number: u8,
    pub playing: bool,
    pub is_master: bool,
    pub synced: bool,
    pub on_air: bool,
    pub sync_number: u32,
    pub tempo: f64,
    pub yield_to: u8,
    pub beat: u32,
    pub beat_within_bar: u8,
    pub packet_counter: u32,
}

impl CdjStatusPacket {
    pub const MIN_PAYLOAD_LEN: usize = 208;

    /// status bitmask `F` per spec.md §4.6's formula.
    fn status_bitmask(&self) -> u8 {
        0x84 | if self.playing { 0x40 } else { 0 }
            | if self.is_master { 0x20 } else { 0 }
            | if self.synced { 0x10 } else { 0 }
            | if self.on_air { 0x08 } else { 0 }
    }

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_preamble(w, Kind::CdjStatus, RESERVED_OTHER)?;
        let mut payload = [0u8; Self::MIN_PAYLOAD_LEN];
        let playing_byte = if self.playing { 1 } else { 0 };
        payload[0x02] = self.device_number;
        payload[0x05] = self.device_number;
        payload[0x08] = playing_byte;
        payload[0x09] = self.device_number;
        payload[0x5C] = playing_byte;
        payload[0x6C] = playing_byte;
        payload[0x6A] = self.status_bitmask();
        payload[0x7E] = playing_byte;
        (&mut payload[0x65..0x69]).write_u32::<BigEndian>(self.sync_number)?;
        (&mut payload[0x73..0x75]).write_u16::<BigEndian>((self.tempo * 100.0).round() as u16)?;
        payload[0x7F] = if self.is_master { 1 } else { 0 };
        payload[0x80] = self.yield_to;
        (&mut payload[0x81..0x85]).write_u32::<BigEndian>(self.beat)?;
        payload[0x87] = self.beat_within_bar;
        (&mut payload[0xA9..0xAD]).write_u32::<BigEndian>(self.packet_counter)?;
        w.write_all(&payload)
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = preamble(Kind::CdjStatus as u8, RESERVED_OTHER)(i)?;
        let (i, payload) = context(
            "CdjStatus payload",
            take(Self::MIN_PAYLOAD_LEN),
        )(i)?;
        let p = payload.fragment();
        let device_number = p[0x02];
        let playing = p[0x08] != 0;
        let bitmask = p[0x6A];
        let is_master = p[0x7F] != 0;
        let synced = bitmask & 0x10 != 0;
        let on_air = bitmask & 0x08 != 0;
        let sync_number = u32::from_be_bytes(p[0x65..0x69].try_into().unwrap());
        let tempo_raw = u16::from_be_bytes(p[0x73..0x75].try_into().unwrap());
        let tempo = tempo_raw as f64 / 100.0;
        let yield_to = p[0x80];
        let beat = u32::from_be_bytes(p[0x81..0x85].try_into().unwrap());
        let beat_within_bar = p[0x87];
        let packet_counter = u32::from_be_bytes(p[0xA9..0xAD].try_into().unwrap());
        Ok((
            i,
            Packet::CdjStatus(CdjStatusPacket {
                device_number,
                playing,
                is_master,
                synced,
                on_air,
                sync_number,
                tempo,
                yield_to,
                beat,
                beat_within_bar,
                packet_counter,
            }),
        ))
    }
}

/// Mixer status packet: no fields of interest are named by the wire table,
/// so only its raw payload is retained.
#[derive(Debug, Clone, PartialEq)]
pub struct MixerStatusPacket {
    pub payload: Vec<u8>,
}

impl MixerStatusPacket {
    pub const MIN_PAYLOAD_LEN: usize = 56;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_preamble(w, Kind::MixerStatus, RESERVED_OTHER)?;
        let mut payload = vec![0u8; Self::MIN_PAYLOAD_LEN.max(self.payload.len())];
        payload[..self.payload.len()].copy_from_slice(&self.payload);
        w.write_all(&payload)
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = preamble(Kind::MixerStatus as u8, RESERVED_OTHER)(i)?;
        let (i, payload) = take(Self::MIN_PAYLOAD_LEN)(i)?;
        Ok((
            i,
            Packet::MixerStatus(MixerStatusPacket {
                payload: payload.fragment().to_vec(),
            }),
        ))
    }
}

/// Beat packet (spec.md §4.5/§6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatPacket {
    pub device_number: u8,
    pub next_beat_ms: u32,
    pub next_bar_ms: u32,
    pub tempo: f64,
    pub beat_within_bar: u8,
}

impl BeatPacket {
    pub const MIN_PAYLOAD_LEN: usize = 96;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_preamble(w, Kind::Beat, RESERVED_OTHER)?;
        let mut payload = [0u8; Self::MIN_PAYLOAD_LEN];
        payload[0x02] = self.device_number;
        (&mut payload[0x05..0x09]).write_u32::<BigEndian>(self.next_beat_ms)?;
        (&mut payload[0x0D..0x11]).write_u32::<BigEndian>(self.next_bar_ms)?;
        (&mut payload[0x3B..0x3D]).write_u16::<BigEndian>((self.tempo * 100.0).round() as u16)?;
        payload[0x3D] = self.beat_within_bar;
        payload[0x40] = self.device_number;
        w.write_all(&payload)
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = preamble(Kind::Beat as u8, RESERVED_OTHER)(i)?;
        let (i, payload) = take(Self::MIN_PAYLOAD_LEN)(i)?;
        let p = payload.fragment();
        let device_number = p[0x02];
        let next_beat_ms = u32::from_be_bytes(p[0x05..0x09].try_into().unwrap());
        let next_bar_ms = u32::from_be_bytes(p[0x0D..0x11].try_into().unwrap());
        let tempo_raw = u16::from_be_bytes(p[0x3B..0x3D].try_into().unwrap());
        let tempo = tempo_raw as f64 / 100.0;
        let beat_within_bar = p[0x3D];
        Ok((
            i,
            Packet::Beat(BeatPacket {
                device_number,
                next_beat_ms,
                next_bar_ms,
                tempo,
                beat_within_bar,
            }),
        ))
    }
}

/// Load-track command (spec.md §4.8/§6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadTrackPacket {
    pub target_device: u8,
    pub sender_device: u8,
    pub source_player: u8,
    pub source_slot: u8,
    pub source_type: u8,
    pub rekordbox_id: u32,
}

impl LoadTrackPacket {
    pub const MIN_PAYLOAD_LEN: usize = 58;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_preamble(w, Kind::LoadTrack, RESERVED_OTHER)?;
        let mut payload = [0u8; Self::MIN_PAYLOAD_LEN];
        payload[0x02] = self.target_device;
        payload[0x05] = self.sender_device;
        payload[0x09] = self.source_player;
        payload[0x0A] = self.source_slot;
        payload[0x0B] = self.source_type;
        (&mut payload[0x0D..0x11]).write_u32::<BigEndian>(self.rekordbox_id)?;
        w.write_all(&payload)
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = preamble(Kind::LoadTrack as u8, RESERVED_OTHER)(i)?;
        let (i, payload) = take(Self::MIN_PAYLOAD_LEN)(i)?;
        let p = payload.fragment();
        Ok((
            i,
            Packet::LoadTrack(LoadTrackPacket {
                target_device: p[0x02],
                sender_device: p[0x05],
                source_player: p[0x09],
                source_slot: p[0x0A],
                source_type: p[0x0B],
                rekordbox_id: u32::from_be_bytes(p[0x0D..0x11].try_into().unwrap()),
            }),
        ))
    }
}

/// Sync-control command (spec.md §4.8/§6): on/off/appoint-master.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncCommand {
    On,
    Off,
    BecomeMaster,
}

impl SyncCommand {
    fn to_byte(self) -> u8 {
        match self {
            SyncCommand::On => 0x10,
            SyncCommand::Off => 0x20,
            SyncCommand::BecomeMaster => 0x01,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x10 => Some(SyncCommand::On),
            0x20 => Some(SyncCommand::Off),
            0x01 => Some(SyncCommand::BecomeMaster),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncControlPacket {
    pub command: SyncCommand,
}

impl SyncControlPacket {
    pub const MIN_PAYLOAD_LEN: usize = 13;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_preamble(w, Kind::SyncControl, RESERVED_OTHER)?;
        let mut payload = [0u8; Self::MIN_PAYLOAD_LEN];
        payload[0x0C] = self.command.to_byte();
        w.write_all(&payload)
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = preamble(Kind::SyncControl as u8, RESERVED_OTHER)(i)?;
        let (i, payload) = take(Self::MIN_PAYLOAD_LEN)(i)?;
        let p = payload.fragment();
        let command = SyncCommand::from_byte(p[0x0C]).ok_or_else(|| {
            nom::Err::Error(nom::error::Error::new(i, nom::error::ErrorKind::Tag))
        })?;
        Ok((i, Packet::SyncControl(SyncControlPacket { command })))
    }
}

/// Fader-start command (spec.md §4.8/§6): one byte per player 1..=4.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaderStartPacket {
    pub per_player: [u8; 4],
}

impl FaderStartPacket {
    pub const MIN_PAYLOAD_LEN: usize = 9;
    pub const NO_OP: u8 = 2;
    pub const START: u8 = 0;
    pub const STOP: u8 = 1;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_preamble(w, Kind::FaderStart, RESERVED_OTHER)?;
        let mut payload = [Self::NO_OP; Self::MIN_PAYLOAD_LEN];
        payload[0..5].fill(0);
        payload[0x05..0x09].copy_from_slice(&self.per_player);
        w.write_all(&payload)
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = preamble(Kind::FaderStart as u8, RESERVED_OTHER)(i)?;
        let (i, payload) = take(Self::MIN_PAYLOAD_LEN)(i)?;
        let p = payload.fragment();
        Ok((
            i,
            Packet::FaderStart(FaderStartPacket {
                per_player: p[0x05..0x09].try_into().unwrap(),
            }),
        ))
    }
}

/// Channels-on-air command (spec.md §4.8/§6): one byte per player 1..=4.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelsOnAirPacket {
    pub per_player: [u8; 4],
}

impl ChannelsOnAirPacket {
    pub const MIN_PAYLOAD_LEN: usize = 14;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_preamble(w, Kind::ChannelsOnAir, RESERVED_OTHER)?;
        let mut payload = [0u8; Self::MIN_PAYLOAD_LEN];
        payload[0x05..0x09].copy_from_slice(&self.per_player);
        w.write_all(&payload)
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = preamble(Kind::ChannelsOnAir as u8, RESERVED_OTHER)(i)?;
        let (i, payload) = take(Self::MIN_PAYLOAD_LEN)(i)?;
        let p = payload.fragment();
        Ok((
            i,
            Packet::ChannelsOnAir(ChannelsOnAirPacket {
                per_player: p[0x05..0x09].try_into().unwrap(),
            }),
        ))
    }
}

/// Media-slot query (spec.md §4.8/§6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaQueryPacket {
    pub device_number: u8,
    pub source_ip: [u8; 4],
    pub target_player: u8,
    pub slot: u8,
}

impl MediaQueryPacket {
    pub const MIN_PAYLOAD_LEN: usize = 17;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_preamble(w, Kind::MediaQuery, RESERVED_OTHER)?;
        let mut payload = [0u8; Self::MIN_PAYLOAD_LEN];
        payload[0x02] = self.device_number;
        payload[0x05..0x09].copy_from_slice(&self.source_ip);
        payload[0x0C] = self.target_player;
        payload[0x10] = self.slot;
        w.write_all(&payload)
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = preamble(Kind::MediaQuery as u8, RESERVED_OTHER)(i)?;
        let (i, payload) = take(Self::MIN_PAYLOAD_LEN)(i)?;
        let p = payload.fragment();
        Ok((
            i,
            Packet::MediaQuery(MediaQueryPacket {
                device_number: p[0x02],
                source_ip: p[0x05..0x09].try_into().unwrap(),
                target_player: p[0x0C],
                slot: p[0x10],
            }),
        ))
    }
}

/// Master-handoff request (spec.md §4.4/§6): sent to the current master.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MasterHandoffRequestPacket {
    pub requesting_device: u8,
    pub target_device: u8,
}

impl MasterHandoffRequestPacket {
    pub const MIN_PAYLOAD_LEN: usize = 9;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_preamble(w, Kind::MasterHandoffRequest, RESERVED_OTHER)?;
        let mut payload = [0u8; Self::MIN_PAYLOAD_LEN];
        payload[0x02] = self.requesting_device;
        payload[0x08] = self.target_device;
        w.write_all(&payload)
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = preamble(Kind::MasterHandoffRequest as u8, RESERVED_OTHER)(i)?;
        let (i, payload) = take(Self::MIN_PAYLOAD_LEN)(i)?;
        let p = payload.fragment();
        Ok((
            i,
            Packet::MasterHandoffRequest(MasterHandoffRequestPacket {
                requesting_device: p[0x02],
                target_device: p[0x08],
            }),
        ))
    }
}

/// Master-handoff ack/response (spec.md §4.4/§6). Serves both as the
/// explicit yield response to a request and as an ack to a `YieldMasterTo`
/// command; the caller distinguishes by context (see `src/election.rs`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MasterHandoffAckPacket {
    pub device_number: u8,
    pub acking_to: u8,
    pub next_master: u8,
}

impl MasterHandoffAckPacket {
    pub const MIN_PAYLOAD_LEN: usize = 13;

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_preamble(w, Kind::MasterHandoffAck, RESERVED_OTHER)?;
        let mut payload = [0u8; Self::MIN_PAYLOAD_LEN];
        payload[0x02] = self.device_number;
        payload[0x08] = self.acking_to;
        payload[0x0C] = self.next_master;
        w.write_all(&payload)
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = preamble(Kind::MasterHandoffAck as u8, RESERVED_OTHER)(i)?;
        let (i, payload) = take(Self::MIN_PAYLOAD_LEN)(i)?;
        let p = payload.fragment();
        Ok((
            i,
            Packet::MasterHandoffAck(MasterHandoffAckPacket {
                device_number: p[0x02],
                acking_to: p[0x08],
                next_master: p[0x0C],
            }),
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Announcement(AnnouncementPacket),
    CdjStatus(CdjStatusPacket),
    MixerStatus(MixerStatusPacket),
    Beat(BeatPacket),
    LoadTrack(LoadTrackPacket),
    SyncControl(SyncControlPacket),
    FaderStart(FaderStartPacket),
    ChannelsOnAir(ChannelsOnAirPacket),
    MediaQuery(MediaQueryPacket),
    MasterHandoffRequest(MasterHandoffRequestPacket),
    MasterHandoffAck(MasterHandoffAckPacket),
}

impl Packet {
    fn parse_impl(kind: Kind, data: Span) -> IResult<Span, Packet> {
        match kind {
            Kind::Announcement => AnnouncementPacket::parse(data),
            Kind::CdjStatus => CdjStatusPacket::parse(data),
            Kind::MixerStatus => MixerStatusPacket::parse(data),
            Kind::Beat => BeatPacket::parse(data),
            Kind::LoadTrack => LoadTrackPacket::parse(data),
            Kind::SyncControl => SyncControlPacket::parse(data),
            Kind::FaderStart => FaderStartPacket::parse(data),
            Kind::ChannelsOnAir => ChannelsOnAirPacket::parse(data),
            Kind::MediaQuery => MediaQueryPacket::parse(data),
            Kind::MasterHandoffRequest => MasterHandoffRequestPacket::parse(data),
            Kind::MasterHandoffAck => MasterHandoffAckPacket::parse(data),
        }
    }

    /// Decodes one packet, per spec.md §4.1's `decode(kind, buffer)`.
    /// Packets longer than the kind's minimum are accepted (the parser
    /// simply doesn't consume the trailing bytes); packets shorter than the
    /// minimum, or with an unrecognized magic/type, fail.
    pub fn decode(data: &[u8]) -> Result<Packet> {
        let kind = validate_header(data, 0).ok_or(ProlinkError::UnknownKind)?;
        let min_len = 12 + kind.min_payload_len();
        if data.len() < min_len {
            return Err(ProlinkError::MalformedPacket {
                kind: kind.name(),
                len: data.len(),
                min: min_len,
            });
        }

        match Self::parse_impl(kind, Span::new(data)) {
            Ok((_, pkt)) => Ok(pkt),
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
                let timestamp = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)?
                    .as_millis();
                Err(ProlinkError::ParseError {
                    error_kind: format!("{:?}", e.code),
                    pos: e.input.location_offset(),
                    timestamp,
                    dump: pretty_hex(&data),
                })
            }
            Err(nom::Err::Incomplete(_)) => Err(ProlinkError::MalformedPacket {
                kind: kind.name(),
                len: data.len(),
                min: min_len,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(pkt: &Packet) -> Packet {
        let mut buf = Vec::new();
        match pkt {
            Packet::Announcement(p) => p.write(&mut buf).unwrap(),
            Packet::CdjStatus(p) => p.write(&mut buf).unwrap(),
            Packet::MixerStatus(p) => p.write(&mut buf).unwrap(),
            Packet::Beat(p) => p.write(&mut buf).unwrap(),
            Packet::LoadTrack(p) => p.write(&mut buf).unwrap(),
            Packet::SyncControl(p) => p.write(&mut buf).unwrap(),
            Packet::FaderStart(p) => p.write(&mut buf).unwrap(),
            Packet::ChannelsOnAir(p) => p.write(&mut buf).unwrap(),
            Packet::MediaQuery(p) => p.write(&mut buf).unwrap(),
            Packet::MasterHandoffRequest(p) => p.write(&mut buf).unwrap(),
            Packet::MasterHandoffAck(p) => p.write(&mut buf).unwrap(),
        }
        Packet::decode(&buf).unwrap()
    }

    #[test]
    fn announcement_round_trips() {
        let pkt = Packet::Announcement(AnnouncementPacket {
            name: "prolink-core".to_string(),
            device_number: 5,
            mac_addr: [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01],
            ip_addr: [10, 0, 0, 5],
        });
        assert_eq!(round_trip(&pkt), pkt);
    }

    #[test]
    fn cdj_status_round_trips() {
        let pkt = Packet::CdjStatus(CdjStatusPacket {
            device_number: 2,
            playing: true,
            is_master: true,
            synced: true,
            on_air: false,
            sync_number: 7,
            tempo: 128.3,
            yield_to: 0,
            beat: 42,
            beat_within_bar: 3,
            packet_counter: 99,
        });
        assert_eq!(round_trip(&pkt), pkt);
    }

    #[test]
    fn beat_round_trips() {
        let pkt = Packet::Beat(BeatPacket {
            device_number: 4,
            next_beat_ms: 500,
            next_bar_ms: 2000,
            tempo: 120.0,
            beat_within_bar: 1,
        });
        assert_eq!(round_trip(&pkt), pkt);
    }

    #[test]
    fn load_track_round_trips() {
        let pkt = Packet::LoadTrack(LoadTrackPacket {
            target_device: 1,
            sender_device: 5,
            source_player: 2,
            source_slot: 3,
            source_type: 1,
            rekordbox_id: 0x1234_5678,
        });
        assert_eq!(round_trip(&pkt), pkt);
    }

    #[test]
    fn s4_fader_start_stop_wins_over_start() {
        let pkt = FaderStartPacket {
            per_player: [
                FaderStartPacket::START,
                FaderStartPacket::STOP,
                FaderStartPacket::STOP,
                FaderStartPacket::NO_OP,
            ],
        };
        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        assert_eq!(&buf[0x05 + 12..0x09 + 12], &[0, 1, 1, 2]);
    }

    #[test]
    fn malformed_packet_rejected_below_minimum() {
        let mut buf = MAGIC.to_vec();
        buf.push(Kind::Beat as u8);
        buf.push(RESERVED_OTHER);
        buf.extend_from_slice(&[0u8; 4]); // far too short
        let err = Packet::decode(&buf).unwrap_err();
        assert!(matches!(err, ProlinkError::MalformedPacket { .. }));
    }

    #[test]
    fn unknown_magic_rejected() {
        let buf = vec![0u8; 64];
        let err = Packet::decode(&buf).unwrap_err();
        assert!(matches!(err, ProlinkError::UnknownKind));
    }

    #[test]
    fn longer_than_minimum_is_accepted() {
        let pkt = BeatPacket {
            device_number: 1,
            next_beat_ms: 10,
            next_bar_ms: 20,
            tempo: 140.0,
            beat_within_bar: 2,
        };
        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        buf.extend_from_slice(&[0xAA; 8]); // trailing junk, must not be rejected
        let decoded = Packet::decode(&buf).unwrap();
        assert_eq!(decoded, Packet::Beat(pkt));
    }

    #[test]
    fn sync_control_commands_round_trip() {
        for cmd in [SyncCommand::On, SyncCommand::Off, SyncCommand::BecomeMaster] {
            let pkt = Packet::SyncControl(SyncControlPacket { command: cmd });
            assert_eq!(round_trip(&pkt), pkt);
        }
    }
}
