//! ISO 14443-3 Type A framing primitives.
//!
//! Mifare Classic sits on top of the 14443-3A activation sequence but then
//! abandons the standard at the framing level: parity bits become part of the
//! ciphertext, and 4-bit ACK/NAK "frames" exist. So unlike a normal reader
//! stack we carry parity per byte explicitly and track frame length in bits.

use nom::number::complete::be_u8;
use nom::sequence::tuple;

use crate::errors::{Error, Result};

pub type IResult<'a, T> = nom::IResult<&'a [u8], T>;

/// REQA, transmitted as a 7-bit short frame.
pub const CMD_REQA: u8 = 0x26;
/// WUPA, also 7 bits; wakes tags in the HALT state too.
pub const CMD_WUPA: u8 = 0x52;
/// Cascade level 1 select/anticollision prefix.
pub const CMD_SEL_CL1: u8 = 0x93;
/// NVB value for the full anticollision round (prefix + 0 UID bits).
pub const NVB_ANTICOLLISION: u8 = 0x20;
/// NVB value for a complete select (prefix + 4 UID bytes + BCC).
pub const NVB_SELECT: u8 = 0x70;

/// ISO 14443-3A CRC_A, appended little-endian to standard frames.
pub fn crc_a(data: &[u8]) -> u16 {
    let mut crc: u16 = 0x6363;
    for byte in data {
        let mut b = *byte ^ (crc as u8);
        b ^= b << 4;
        crc = (crc >> 8) ^ ((b as u16) << 8) ^ ((b as u16) << 3) ^ ((b as u16) >> 4);
    }
    crc
}

/// Odd parity bit for one byte: makes the total number of set bits odd.
pub fn odd_parity8(byte: u8) -> u8 {
    (byte.count_ones() as u8 ^ 1) & 1
}

/// One half-duplex frame, with explicit per-byte parity.
///
/// `len_bits` covers short frames (7-bit REQA/WUPA) and the 4-bit ACK/NAK
/// responses Mifare Classic tags send; for those, `parity` is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    parity: Vec<u8>,
    len_bits: usize,
}

impl Frame {
    /// A standard frame: full bytes, conventionally computed odd parity.
    pub fn standard(data: Vec<u8>) -> Self {
        let parity = data.iter().map(|b| odd_parity8(*b)).collect();
        let len_bits = data.len() * 8;
        Self { data, parity, len_bits }
    }

    /// A standard frame with CRC_A appended.
    pub fn with_crc(mut data: Vec<u8>) -> Self {
        let crc = crc_a(&data);
        data.push(crc as u8);
        data.push((crc >> 8) as u8);
        Self::standard(data)
    }

    /// A frame with caller-supplied parity bits, one per byte (LSB used).
    /// This is how deliberately wrong parity and ciphertext parity go out.
    pub fn with_parity(data: Vec<u8>, parity: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), parity.len());
        let len_bits = data.len() * 8;
        Self { data, parity, len_bits }
    }

    /// A 7-bit short frame (REQA/WUPA). No parity bit is transmitted.
    pub fn short(cmd: u8) -> Self {
        Self { data: vec![cmd], parity: Vec::new(), len_bits: 7 }
    }

    /// A 4-bit frame (ACK/NAK). Low nibble of `nibble` is significant.
    pub fn nibble(nibble: u8) -> Self {
        Self { data: vec![nibble & 0x0F], parity: Vec::new(), len_bits: 4 }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn parity(&self) -> &[u8] {
        &self.parity
    }

    pub fn len_bits(&self) -> usize {
        self.len_bits
    }

    pub fn len_bytes(&self) -> usize {
        self.data.len()
    }

    /// True for the 4-bit ACK/NAK responses.
    pub fn is_nibble(&self) -> bool {
        self.len_bits == 4
    }

    pub fn is_short(&self) -> bool {
        self.len_bits == 7
    }

    /// Validates the trailing CRC_A. Only meaningful on full-byte frames of
    /// at least 3 bytes.
    pub fn check_crc(&self) -> bool {
        if self.data.len() < 3 {
            return false;
        }
        let (payload, crc) = self.data.split_at(self.data.len() - 2);
        crc_a(payload) == u16::from_le_bytes([crc[0], crc[1]])
    }

    /// Payload with the CRC_A stripped, or a protocol error if it is wrong.
    pub fn strip_crc(&self) -> Result<&[u8]> {
        if !self.check_crc() {
            return Err(Error::Protocol("bad CRC_A"));
        }
        Ok(&self.data[..self.data.len() - 2])
    }

    /// True if every received parity bit matches conventional odd parity.
    pub fn check_parity(&self) -> bool {
        self.data
            .iter()
            .zip(self.parity.iter())
            .all(|(b, p)| odd_parity8(*b) == (*p & 1))
    }
}

/// Answer to Request: 2 bytes, little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Atqa(pub u16);

impl Atqa {
    /// Bits 6-7 encode the UID size: 0 = single (4 byte), 1 = double, 2 = triple.
    pub fn uid_size_hint(&self) -> u8 {
        ((self.0 >> 6) & 0x03) as u8
    }
}

pub fn parse_atqa(data: &[u8]) -> Result<Atqa> {
    let (_, (lo, hi)) = tuple((be_u8, be_u8))(data).map_err(|_: nom::Err<nom::error::Error<&[u8]>>| {
        Error::Protocol("short ATQA")
    })?;
    Ok(Atqa(u16::from(hi) << 8 | u16::from(lo)))
}

/// Cascade level 1 anticollision response: 4 UID bytes plus the BCC
/// check byte (XOR of the UID).
pub fn parse_anticollision(data: &[u8]) -> Result<[u8; 4]> {
    fn inner(data: &[u8]) -> IResult<([u8; 4], u8)> {
        let (rest, (u0, u1, u2, u3, bcc)) = tuple((be_u8, be_u8, be_u8, be_u8, be_u8))(data)?;
        Ok((rest, ([u0, u1, u2, u3], bcc)))
    }
    let (_, (uid, bcc)) = inner(data).map_err(|_| Error::Protocol("short anticollision response"))?;
    if uid.iter().fold(0, |acc, b| acc ^ b) != bcc {
        return Err(Error::Protocol("UID BCC mismatch"));
    }
    Ok(uid)
}

/// Select acknowledge. For Mifare Classic the interesting bits are the
/// family hints; the 14443-4 capability bit never is set on real Classics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sak(pub u8);

impl Sak {
    pub fn uid_incomplete(&self) -> bool {
        self.0 & 0x04 != 0
    }
}

pub fn parse_sak(frame: &Frame) -> Result<Sak> {
    let payload = frame.strip_crc()?;
    let (_, sak) =
        be_u8::<_, nom::error::Error<&[u8]>>(payload).map_err(|_| Error::Protocol("empty SAK"))?;
    Ok(Sak(sak))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_a_halt_frame() {
        // The HLTA frame is the textbook CRC_A example: 50 00 57 CD.
        assert_eq!(crc_a(&[0x50, 0x00]), 0xCD57);
        let frame = Frame::with_crc(vec![0x50, 0x00]);
        assert_eq!(frame.data(), &[0x50, 0x00, 0x57, 0xCD]);
        assert!(frame.check_crc());
    }

    #[test]
    fn crc_roundtrip() {
        let frame = Frame::with_crc(vec![0x30, 0x04]);
        assert!(frame.check_crc());
        assert_eq!(frame.strip_crc().unwrap(), &[0x30, 0x04]);
    }

    #[test]
    fn parity_bits() {
        assert_eq!(odd_parity8(0x00), 1);
        assert_eq!(odd_parity8(0x01), 0);
        assert_eq!(odd_parity8(0xFF), 1);
        assert_eq!(odd_parity8(0x7F), 0);

        let frame = Frame::standard(vec![0x00, 0x01]);
        assert_eq!(frame.parity(), &[1, 0]);
        assert!(frame.check_parity());

        let bad = Frame::with_parity(vec![0x00], vec![0]);
        assert!(!bad.check_parity());
    }

    #[test]
    fn short_and_nibble_frames() {
        let reqa = Frame::short(CMD_REQA);
        assert!(reqa.is_short());
        assert_eq!(reqa.len_bits(), 7);

        let ack = Frame::nibble(0x0A);
        assert!(ack.is_nibble());
        assert_eq!(ack.data(), &[0x0A]);
    }

    #[test]
    fn anticollision_checks_bcc() {
        let uid = parse_anticollision(&[0xDE, 0xAD, 0xBE, 0xEF, 0xDE ^ 0xAD ^ 0xBE ^ 0xEF]).unwrap();
        assert_eq!(uid, [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(
            parse_anticollision(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00]),
            Err(Error::Protocol("UID BCC mismatch"))
        );
    }

    #[test]
    fn atqa_uid_size() {
        assert_eq!(parse_atqa(&[0x04, 0x00]).unwrap().uid_size_hint(), 0);
        assert_eq!(parse_atqa(&[0x44, 0x00]).unwrap().uid_size_hint(), 1);
    }
}
