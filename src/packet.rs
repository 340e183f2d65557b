use std::convert::TryInto;
use std::net::Ipv4Addr;

use bincode::Options;
use chrono::{DateTime, Utc};
use log::debug;
use serde::Deserialize;

use crate::error::{ChecksumError, DecodeError};
use crate::util;

pub const IPPROTO_ICMP: u8 = 1;

pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_NO_CODE: u8 = 0;

/// Network headers are big endian and fixed width, no length prefixes.
fn coder() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

#[derive(Deserialize)]
struct WireIpHeader {
    version_and_header_len: u8,
    type_of_service: u8,
    datagram_length: u16,
    ip_identifier: u16,
    flags_and_frag_offset: u16, // flags are u3
    ttl: u8,
    protocol: u8,
    checksum: u16,
    source_ip: u32,
    destination_ip: u32,
}

#[derive(Deserialize)]
struct WireIcmpHeader {
    message_type: u8,
    message_code: u8,
    checksum: u16,
    identifier: u16,
    sequence_num: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpFlags {
    /// Must be zero on the wire. Seeing it set is worth a note, not a drop.
    pub reserved: bool,
    pub dont_fragment: bool,
    pub more_fragments: bool,
}

impl IpFlags {
    fn from_bits(bits: u16) -> Self {
        IpFlags {
            reserved: bits & 0b100 != 0,
            dont_fragment: bits & 0b010 != 0,
            more_fragments: bits & 0b001 != 0,
        }
    }

    pub fn bits(self) -> u16 {
        (self.reserved as u16) << 2 | (self.dont_fragment as u16) << 1 | self.more_fragments as u16
    }
}

/// Fixed 20 byte IPv4 header, options are not looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpHeader {
    pub version: u8,
    pub ihl: u8,
    pub tos: u8,
    pub length: u16,
    pub ident: u16,
    pub flags: IpFlags,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src_addr: u32,
    pub dst_addr: u32,
}

impl IpHeader {
    pub const LEN: usize = 20;
    const CHECKSUM_WORD: usize = 5;

    /// Structural decode of the first 20 bytes. The checksum is not checked,
    /// see [`IpHeader::from_bytes`].
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let malformed = DecodeError::Malformed {
            what: "IP header",
            needed: Self::LEN,
            got: bytes.len(),
        };
        let raw = bytes.get(..Self::LEN).ok_or_else(|| malformed.clone())?;
        let wire: WireIpHeader = coder().deserialize(raw).map_err(|_| malformed)?;

        let flags = IpFlags::from_bits(wire.flags_and_frag_offset >> 13);
        if flags.reserved {
            debug!("reserved flag set in IP datagram {} from {}",
                wire.ip_identifier, Ipv4Addr::from(wire.source_ip));
        }

        Ok(IpHeader {
            version: wire.version_and_header_len >> 4,
            ihl: wire.version_and_header_len & 0x0F,
            tos: wire.type_of_service,
            length: wire.datagram_length,
            ident: wire.ip_identifier,
            flags,
            fragment_offset: wire.flags_and_frag_offset & 0x1FFF,
            ttl: wire.ttl,
            protocol: wire.protocol,
            checksum: wire.checksum,
            src_addr: wire.source_ip,
            dst_addr: wire.destination_ip,
        })
    }

    /// Decode and verify the header checksum. A header with a bad checksum
    /// is never returned.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let header = Self::decode(bytes)?;
        header.validate_checksum()?;
        Ok(header)
    }

    pub fn validate_checksum(&self) -> Result<(), ChecksumError> {
        util::verify_checksum(&self.encode(), Self::CHECKSUM_WORD)
    }

    pub fn encode(&self) -> [u8; 20] {
        let mut bytes = [0; 20];
        bytes[0] = (self.version & 0x0F) << 4 | (self.ihl & 0x0F);
        bytes[1] = self.tos;
        bytes[2..4].copy_from_slice(&self.length.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.ident.to_be_bytes());
        let flags_and_frag_offset = self.flags.bits() << 13 | (self.fragment_offset & 0x1FFF);
        bytes[6..8].copy_from_slice(&flags_and_frag_offset.to_be_bytes());
        bytes[8] = self.ttl;
        bytes[9] = self.protocol;
        bytes[10..12].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.src_addr.to_be_bytes());
        bytes[16..20].copy_from_slice(&self.dst_addr.to_be_bytes());
        bytes
    }

    pub fn source(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_addr)
    }

    pub fn destination(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_addr)
    }
}

/// An ICMP message: the 8 byte header plus an owned copy of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpPacket {
    pub message_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl IcmpPacket {
    pub const HEADER_LEN: usize = 8;
    const CHECKSUM_WORD: usize = 1;

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let malformed = DecodeError::Malformed {
            what: "ICMP header",
            needed: Self::HEADER_LEN,
            got: bytes.len(),
        };
        if bytes.len() < Self::HEADER_LEN {
            return Err(malformed);
        }
        let wire: WireIcmpHeader = coder()
            .deserialize(&bytes[..Self::HEADER_LEN])
            .map_err(|_| malformed)?;

        Ok(IcmpPacket {
            message_type: wire.message_type,
            code: wire.message_code,
            checksum: wire.checksum,
            identifier: wire.identifier,
            sequence: wire.sequence_num,
            payload: bytes[Self::HEADER_LEN..].to_vec(),
        })
    }

    /// Decode and verify the checksum over header and payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let packet = Self::decode(bytes)?;
        packet.validate_checksum()?;
        Ok(packet)
    }

    pub fn validate_checksum(&self) -> Result<(), ChecksumError> {
        util::verify_checksum(&self.encode(), Self::CHECKSUM_WORD)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::HEADER_LEN + self.payload.len());
        bytes.push(self.message_type);
        bytes.push(self.code);
        bytes.extend_from_slice(&self.checksum.to_be_bytes());
        bytes.extend_from_slice(&self.identifier.to_be_bytes());
        bytes.extend_from_slice(&self.sequence.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// RFC 792 echo request. Echo replies and everything else are not.
    pub fn is_echo_request(&self) -> bool {
        self.message_type == ICMP_ECHO_REQUEST && self.code == ICMP_NO_CODE
    }

    /// Best effort guess at a send time embedded by the pinging host.
    pub fn timestamp(&self) -> Option<Timeval> {
        Timeval::from_payload(&self.payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimevalLayout {
    /// `struct timeval` with 64 bit fields, as sent by most current pings.
    Le64,
    Le32,
}

impl TimevalLayout {
    /// Tried in order, first plausible result wins.
    const CANDIDATES: [TimevalLayout; 2] = [TimevalLayout::Le64, TimevalLayout::Le32];

    fn read(self, payload: &[u8]) -> Option<(i64, i64)> {
        match self {
            TimevalLayout::Le64 => {
                let seconds = i64::from_le_bytes(payload.get(0..8)?.try_into().ok()?);
                let micros = i64::from_le_bytes(payload.get(8..16)?.try_into().ok()?);
                Some((seconds, micros))
            }
            TimevalLayout::Le32 => {
                let seconds = i32::from_le_bytes(payload.get(0..4)?.try_into().ok()?);
                let micros = i32::from_le_bytes(payload.get(4..8)?.try_into().ok()?);
                Some((seconds.into(), micros.into()))
            }
        }
    }
}

/// 9999-12-31T23:59:59Z
const MAX_SECONDS: i64 = 253_402_300_799;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeval {
    pub seconds: i64,
    pub micros: i64,
    pub layout: TimevalLayout,
}

impl Timeval {
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        TimevalLayout::CANDIDATES.iter().find_map(|&layout| {
            let (seconds, micros) = layout.read(payload)?;
            let timeval = Timeval { seconds, micros, layout };
            timeval.to_datetime().map(|_| timeval)
        })
    }

    /// `None` unless the value is a calendar time between the epoch and
    /// the end of year 9999 with a sub-second microsecond part.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        if !(0..=MAX_SECONDS).contains(&self.seconds) || !(0..1_000_000).contains(&self.micros) {
            return None;
        }
        DateTime::from_timestamp(self.seconds, (self.micros * 1_000) as u32)
    }
}

#[cfg(test)]
impl IpHeader {
    /// Header for an ICMP datagram carrying `payload_len` bytes, checksum filled in.
    pub fn for_icmp(source: Ipv4Addr, destination: Ipv4Addr, ident: u16, payload_len: usize) -> Self {
        IpHeader {
            version: 4,
            ihl: 5,
            tos: 0,
            length: (Self::LEN + payload_len) as u16,
            ident,
            flags: IpFlags::default(),
            fragment_offset: 0,
            ttl: 42,
            protocol: IPPROTO_ICMP,
            checksum: 0,
            src_addr: source.into(),
            dst_addr: destination.into(),
        }
        .with_checksum()
    }

    pub fn with_checksum(mut self) -> Self {
        self.checksum = util::get_checksum(&self.encode(), Self::CHECKSUM_WORD);
        self
    }
}

#[cfg(test)]
impl IcmpPacket {
    pub fn echo_request(identifier: u16, sequence: u16, payload: &[u8]) -> Self {
        IcmpPacket {
            message_type: ICMP_ECHO_REQUEST,
            code: ICMP_NO_CODE,
            checksum: 0,
            identifier,
            sequence,
            payload: payload.to_vec(),
        }
        .with_checksum()
    }

    pub fn with_checksum(mut self) -> Self {
        self.checksum = util::get_checksum(&self.encode(), Self::CHECKSUM_WORD);
        self
    }
}
