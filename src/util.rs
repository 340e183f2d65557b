use std::io::{Error, ErrorKind, Result};
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};

use crate::error::ChecksumError;

/// Resolve the address to listen on. Raw ICMP sockets here are IPv4 only,
/// so the first IPv4 result wins.
pub fn resolve_host(host: &str) -> Result<Ipv4Addr> {
    (host, 0).to_socket_addrs()?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no IPv4 address for {}", host)))
}

/// RFC 1071: the ones' complement of the ones' complement sum of `words`.
pub fn checksum<I>(words: I) -> u16
where
    I: IntoIterator<Item = u16>,
{
    let mut sum: u64 = words.into_iter().map(u64::from).sum();
    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }

    !sum as u16 // The checksum field should be the ones complement of the sum
}

/// Split `data` into big endian words. An odd trailing byte is padded
/// with a zero low byte.
pub fn be_words(data: &[u8]) -> impl Iterator<Item = u16> + '_ {
    data.chunks(2).map(|word| match *word {
        [wh] => u16::from_be_bytes([wh, 0]),
        [wh, wl] => u16::from_be_bytes([wh, wl]),
        _ => unreachable!(),
    })
}

/// Checksum over `data` with the word at word offset `location` zeroed.
pub fn get_checksum(data: &[u8], location: usize) -> u16 {
    checksum(
        be_words(data)
            .enumerate()
            .map(|(i, w)| if i == location { 0 } else { w }),
    )
}

#[cfg(test)]
#[allow(clippy::double_parens)] // For stylistic reasons
pub fn set_checksum(data: &mut [u8], location: usize) {
    let sum = get_checksum(data, location);
    data[location*2    ] = ((sum & 0xFF00) >> 8) as u8;
    data[location*2 + 1] = ((sum & 0x00FF)     ) as u8;
}

/// Compare the checksum carried at word offset `location` against the one
/// recomputed from the rest of `data`.
pub fn verify_checksum(data: &[u8], location: usize) -> std::result::Result<(), ChecksumError> {
    let found = be_words(data).nth(location).unwrap_or(0);
    let expected = get_checksum(data, location);
    if found == expected {
        Ok(())
    } else {
        Err(ChecksumError { found, expected })
    }
}
