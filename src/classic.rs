//! Mifare Classic data model: keys, blocks, sectors, access conditions and
//! the per-session tag snapshot the attack fills in.

use std::fmt;
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::errors::{Error, Result};

pub const BLOCK_SIZE: usize = 16;
pub const KEY_SIZE: usize = 6;
/// Keys per sector: A and B.
pub const KEYS_PER_SECTOR: u8 = 2;

/// Command bytes, including the Fudan backdoor authentication pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    AuthKeyA = 0x60,
    AuthKeyB = 0x61,
    BackdoorAuthKeyA = 0x64,
    BackdoorAuthKeyB = 0x65,
    Read = 0x30,
    Write = 0xA0,
    Decrement = 0xC0,
    Increment = 0xC1,
    Restore = 0xC2,
    Transfer = 0xB0,
    Halt = 0x50,
}

/// 4-bit tag responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Ack {
    Ack = 0x0A,
    NakInvalidOperation = 0x00,
    NakParityCrcError = 0x01,
    NakInvalidArgument = 0x04,
    NakWriteError = 0x05,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    A,
    B,
}

impl KeyType {
    pub fn other(&self) -> Self {
        match self {
            KeyType::A => KeyType::B,
            KeyType::B => KeyType::A,
        }
    }

    /// 0 for A, 1 for B; used for target-key indexing in the nested attack.
    pub fn index(&self) -> u8 {
        match self {
            KeyType::A => 0,
            KeyType::B => 1,
        }
    }

    pub fn auth_command(&self, backdoor: bool) -> Command {
        match (self, backdoor) {
            (KeyType::A, false) => Command::AuthKeyA,
            (KeyType::B, false) => Command::AuthKeyB,
            (KeyType::A, true) => Command::BackdoorAuthKeyA,
            (KeyType::B, true) => Command::BackdoorAuthKeyB,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::A => write!(f, "A"),
            KeyType::B => write!(f, "B"),
        }
    }
}

/// A 48-bit sector key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(pub [u8; KEY_SIZE]);

impl Key {
    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| acc << 8 | u64::from(*b))
    }

    pub fn from_u64(v: u64) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (v >> (8 * (KEY_SIZE - 1 - i))) as u8;
        }
        Key(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|_| Error::Protocol("bad key hex"))?;
        let bytes: [u8; KEY_SIZE] =
            bytes.try_into().map_err(|_| Error::Protocol("key must be 6 bytes"))?;
        Ok(Key(bytes))
    }
}

/// One 16-byte block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block(pub [u8; BLOCK_SIZE]);

impl Default for Block {
    fn default() -> Self {
        Block([0u8; BLOCK_SIZE])
    }
}

/// Tag capacity variants. 4K tags switch to 16-block sectors past sector 32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagSize {
    Mini,
    #[default]
    S1k,
    S4k,
}

impl TagSize {
    pub fn from_sak(sak: u8) -> Self {
        match sak {
            0x09 => TagSize::Mini,
            0x18 => TagSize::S4k,
            _ => TagSize::S1k,
        }
    }

    pub fn sector_count(&self) -> u8 {
        match self {
            TagSize::Mini => 5,
            TagSize::S1k => 16,
            TagSize::S4k => 40,
        }
    }

    pub fn block_count(&self) -> u16 {
        match self {
            TagSize::Mini => 20,
            TagSize::S1k => 64,
            TagSize::S4k => 256,
        }
    }
}

/// Blocks in a sector: 4 below sector 32, 16 from there on (4K only).
pub fn blocks_in_sector(sector: u8) -> u8 {
    if sector < 32 {
        4
    } else {
        16
    }
}

pub fn first_block_of_sector(sector: u8) -> u16 {
    if sector < 32 {
        u16::from(sector) * 4
    } else {
        128 + (u16::from(sector) - 32) * 16
    }
}

pub fn sector_of_block(block: u16) -> u8 {
    if block < 128 {
        (block / 4) as u8
    } else {
        (32 + (block - 128) / 16) as u8
    }
}

pub fn sector_trailer_block(sector: u8) -> u16 {
    first_block_of_sector(sector) + u16::from(blocks_in_sector(sector)) - 1
}

pub fn is_sector_trailer(block: u16) -> bool {
    block == sector_trailer_block(sector_of_block(block))
}

/// Data operations gated by the access condition bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
    Increment,
    /// Covers decrement, restore and transfer, which share rights.
    Decrement,
}

/// Which keys an access condition grants for some operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perm {
    Never,
    KeyA,
    KeyB,
    Either,
}

impl Perm {
    pub fn allows(&self, key_type: KeyType) -> bool {
        match self {
            Perm::Never => false,
            Perm::KeyA => key_type == KeyType::A,
            Perm::KeyB => key_type == KeyType::B,
            Perm::Either => true,
        }
    }
}

/// Decoded access conditions of one sector, as four 3-bit groups
/// (c1 c2 c3 per block group, trailer group last).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessConditions {
    groups: [u8; 4],
}

impl AccessConditions {
    /// Parses trailer bytes 6..9, validating the inverted nibbles.
    pub fn parse(trailer: &Block) -> Result<Self> {
        let (b6, b7, b8) = (trailer.0[6], trailer.0[7], trailer.0[8]);
        let c1 = b7 >> 4;
        let c2 = b8 & 0x0F;
        let c3 = b8 >> 4;
        let ok = (b6 & 0x0F) == !c1 & 0x0F && (b6 >> 4) == !c2 & 0x0F && (b7 & 0x0F) == !c3 & 0x0F;
        if !ok {
            return Err(Error::Protocol("inconsistent access condition bits"));
        }
        let mut groups = [0u8; 4];
        for (g, slot) in groups.iter_mut().enumerate() {
            *slot = (c1 >> g & 1) << 2 | (c2 >> g & 1) << 1 | (c3 >> g & 1);
        }
        Ok(Self { groups })
    }

    /// The default transport configuration (FF 07 80): everything open.
    pub fn transport() -> Self {
        Self { groups: [0b000, 0b000, 0b000, 0b001] }
    }

    /// Encodes back into trailer bytes 6..9 (byte 9 is left 0x69).
    pub fn encode(&self) -> [u8; 4] {
        let mut c1 = 0u8;
        let mut c2 = 0u8;
        let mut c3 = 0u8;
        for (g, bits) in self.groups.iter().enumerate() {
            c1 |= (bits >> 2 & 1) << g;
            c2 |= (bits >> 1 & 1) << g;
            c3 |= (bits & 1) << g;
        }
        [(!c2 & 0x0F) << 4 | (!c1 & 0x0F), c1 << 4 | (!c3 & 0x0F), c3 << 4 | c2, 0x69]
    }

    /// Access group for a block within its sector (3 data groups + trailer).
    fn group_of(sector: u8, block: u16) -> usize {
        let offset = (block - first_block_of_sector(sector)) as usize;
        if sector < 32 {
            offset
        } else {
            // Large sectors map 5 blocks per data group.
            offset / 5
        }
    }

    /// Rights for a data operation on a data block.
    pub fn data_perm(&self, sector: u8, block: u16, action: Action) -> Perm {
        let bits = self.groups[Self::group_of(sector, block)];
        match (bits, action) {
            (0b000, _) => Perm::Either,
            (0b010, Action::Read) => Perm::Either,
            (0b100, Action::Read) => Perm::Either,
            (0b100, Action::Write) => Perm::KeyB,
            (0b110, Action::Read) => Perm::Either,
            (0b110, Action::Write) => Perm::KeyB,
            (0b110, Action::Increment) => Perm::KeyB,
            (0b110, Action::Decrement) => Perm::Either,
            (0b001, Action::Read) => Perm::Either,
            (0b001, Action::Decrement) => Perm::Either,
            (0b011, Action::Read) => Perm::KeyB,
            (0b011, Action::Write) => Perm::KeyB,
            (0b101, Action::Read) => Perm::KeyB,
            _ => Perm::Never,
        }
    }

    /// Whether key B is readable from the trailer (in which case it cannot
    /// be used for authentication on real tags).
    pub fn key_b_readable(&self) -> bool {
        matches!(self.groups[3], 0b000 | 0b001 | 0b010)
    }

    /// Write rights for the key areas and access bytes of the trailer.
    pub fn trailer_write_perm(&self, part: TrailerPart) -> Perm {
        let bits = self.groups[3];
        match (bits, part) {
            (0b000, TrailerPart::KeyA | TrailerPart::KeyB) => Perm::KeyA,
            (0b001, TrailerPart::KeyA | TrailerPart::KeyB) => Perm::KeyA,
            (0b001, TrailerPart::AccessBits) => Perm::KeyA,
            (0b100, TrailerPart::KeyA | TrailerPart::KeyB) => Perm::KeyB,
            (0b011, TrailerPart::KeyA | TrailerPart::KeyB) => Perm::KeyB,
            (0b011, TrailerPart::AccessBits) => Perm::KeyB,
            (0b101, TrailerPart::AccessBits) => Perm::KeyB,
            _ => Perm::Never,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailerPart {
    KeyA,
    AccessBits,
    KeyB,
}

/// A decoded value block: a signed 32-bit value and its backup address byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueBlock {
    pub value: i32,
    pub addr: u8,
}

impl ValueBlock {
    pub fn parse(block: &Block) -> Result<Self> {
        let b = &block.0;
        let v = LittleEndian::read_i32(&b[0..4]);
        let v_inv = LittleEndian::read_i32(&b[4..8]);
        let v2 = LittleEndian::read_i32(&b[8..12]);
        let (addr, addr_inv) = (b[12], b[13]);
        if v != v2 || v != !v_inv || addr != !addr_inv || addr != b[14] || addr_inv != b[15] {
            return Err(Error::Protocol("not a value block"));
        }
        Ok(Self { value: v, addr })
    }

    pub fn encode(&self) -> Block {
        let mut b = [0u8; BLOCK_SIZE];
        LittleEndian::write_i32(&mut b[0..4], self.value);
        LittleEndian::write_i32(&mut b[4..8], !self.value);
        LittleEndian::write_i32(&mut b[8..12], self.value);
        b[12] = self.addr;
        b[13] = !self.addr;
        b[14] = self.addr;
        b[15] = !self.addr;
        Block(b)
    }
}

/// Per-sector key slots. `None` means not recovered yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct SectorKeys {
    pub key_a: Option<Key>,
    pub key_b: Option<Key>,
}

impl SectorKeys {
    pub fn get(&self, key_type: KeyType) -> Option<Key> {
        match key_type {
            KeyType::A => self.key_a,
            KeyType::B => self.key_b,
        }
    }

    pub fn set(&mut self, key_type: KeyType, key: Key) {
        match key_type {
            KeyType::A => self.key_a = Some(key),
            KeyType::B => self.key_b = Some(key),
        }
    }

    /// Any known key, A preferred, with its type.
    pub fn any(&self) -> Option<(Key, KeyType)> {
        self.key_a
            .map(|k| (k, KeyType::A))
            .or_else(|| self.key_b.map(|k| (k, KeyType::B)))
    }
}

/// The session's snapshot of a tag: identity, block contents and recovered
/// keys. Owned by the attack session and discarded with it.
#[derive(Debug, Clone, Default)]
pub struct TagData {
    pub uid: [u8; 4],
    pub atqa: u16,
    pub sak: u8,
    pub size: TagSize,
    blocks: Vec<Block>,
    block_read: Vec<bool>,
    keys: Vec<SectorKeys>,
}

impl TagData {
    pub fn new(size: TagSize) -> Self {
        Self {
            size,
            blocks: vec![Block::default(); size.block_count() as usize],
            block_read: vec![false; size.block_count() as usize],
            keys: vec![SectorKeys::default(); size.sector_count() as usize],
            ..Default::default()
        }
    }

    pub fn uid_u32(&self) -> u32 {
        u32::from_be_bytes(self.uid)
    }

    pub fn sector_count(&self) -> u8 {
        self.size.sector_count()
    }

    pub fn keys_of(&self, sector: u8) -> &SectorKeys {
        &self.keys[sector as usize]
    }

    pub fn set_key(&mut self, sector: u8, key_type: KeyType, key: Key) {
        self.keys[sector as usize].set(key_type, key);
    }

    pub fn is_key_known(&self, sector: u8, key_type: KeyType) -> bool {
        self.keys[sector as usize].get(key_type).is_some()
    }

    pub fn keys_found(&self) -> u8 {
        self.keys
            .iter()
            .map(|k| k.key_a.is_some() as u8 + k.key_b.is_some() as u8)
            .sum()
    }

    /// First sector that still has at least one unknown key, from `from` on.
    pub fn next_sector_missing_key(&self, from: u8) -> Option<u8> {
        (from..self.sector_count())
            .find(|s| !self.is_key_known(*s, KeyType::A) || !self.is_key_known(*s, KeyType::B))
    }

    pub fn block(&self, block: u16) -> &Block {
        &self.blocks[block as usize]
    }

    pub fn set_block(&mut self, block: u16, data: Block) {
        self.blocks[block as usize] = data;
        self.block_read[block as usize] = true;
    }

    pub fn is_block_read(&self, block: u16) -> bool {
        self.block_read[block as usize]
    }

    /// A sector counts as read once all of its blocks have been read.
    pub fn is_sector_read(&self, sector: u8) -> bool {
        let first = first_block_of_sector(sector);
        (first..first + u16::from(blocks_in_sector(sector)))
            .all(|b| self.block_read[b as usize])
    }

    pub fn sectors_read(&self) -> u8 {
        (0..self.sector_count()).filter(|s| self.is_sector_read(*s)).count() as u8
    }

    /// Access conditions for a sector, if its trailer has been read and
    /// decodes cleanly.
    pub fn access_conditions(&self, sector: u8) -> Option<AccessConditions> {
        let trailer = sector_trailer_block(sector);
        if !self.block_read[trailer as usize] {
            return None;
        }
        AccessConditions::parse(&self.blocks[trailer as usize]).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn key_u64_roundtrip() {
        let key = Key(hex!("A0A1A2A3A4A5"));
        assert_eq!(key.to_u64(), 0xA0A1A2A3A4A5);
        assert_eq!(Key::from_u64(0xA0A1A2A3A4A5), key);
        assert_eq!(key.to_string(), "A0A1A2A3A4A5");
        assert_eq!("a0a1a2a3a4a5".parse::<Key>().unwrap(), key);
    }

    #[test]
    fn sector_block_math() {
        assert_eq!(first_block_of_sector(0), 0);
        assert_eq!(first_block_of_sector(31), 124);
        assert_eq!(first_block_of_sector(32), 128);
        assert_eq!(first_block_of_sector(39), 240);
        assert_eq!(sector_of_block(127), 31);
        assert_eq!(sector_of_block(128), 32);
        assert_eq!(sector_of_block(255), 39);
        assert_eq!(sector_trailer_block(0), 3);
        assert_eq!(sector_trailer_block(32), 143);
        assert!(is_sector_trailer(3));
        assert!(is_sector_trailer(143));
        assert!(!is_sector_trailer(142));
    }

    #[test]
    fn transport_access_conditions() {
        // FF 07 80 69 is the shipped transport configuration.
        let mut trailer = Block::default();
        trailer.0[6..10].copy_from_slice(&hex!("FF078069"));
        let acc = AccessConditions::parse(&trailer).unwrap();
        assert_eq!(acc, AccessConditions::transport());
        assert_eq!(acc.encode(), hex!("FF078069"));
        assert_eq!(acc.data_perm(0, 0, Action::Read), Perm::Either);
        assert_eq!(acc.data_perm(0, 1, Action::Write), Perm::Either);
        assert!(acc.key_b_readable());
    }

    #[test]
    fn locked_down_conditions() {
        // Data group 011: key B only; trailer group 011: key B writes keys.
        let acc = AccessConditions { groups: [0b011, 0b011, 0b011, 0b011] };
        let encoded = acc.encode();
        let mut trailer = Block::default();
        trailer.0[6..10].copy_from_slice(&encoded);
        let parsed = AccessConditions::parse(&trailer).unwrap();
        assert_eq!(parsed, acc);
        assert_eq!(parsed.data_perm(0, 1, Action::Read), Perm::KeyB);
        assert_eq!(parsed.data_perm(0, 1, Action::Increment), Perm::Never);
        assert!(!parsed.key_b_readable());
        assert_eq!(parsed.trailer_write_perm(TrailerPart::KeyA), Perm::KeyB);
    }

    #[test]
    fn bad_access_bits_rejected() {
        let mut trailer = Block::default();
        trailer.0[6..10].copy_from_slice(&hex!("FF078169"));
        assert!(AccessConditions::parse(&trailer).is_err());
    }

    #[test]
    fn value_block_roundtrip() {
        let v = ValueBlock { value: -1337, addr: 0x04 };
        let block = v.encode();
        assert_eq!(ValueBlock::parse(&block).unwrap(), v);

        let mut corrupt = block;
        corrupt.0[5] ^= 1;
        assert!(ValueBlock::parse(&corrupt).is_err());
    }

    #[test]
    fn tag_data_bookkeeping() {
        let mut tag = TagData::new(TagSize::S1k);
        assert_eq!(tag.sector_count(), 16);
        assert_eq!(tag.keys_found(), 0);
        assert_eq!(tag.sectors_read(), 0);

        tag.set_key(0, KeyType::A, Key::from_u64(0xFFFFFFFFFFFF));
        assert_eq!(tag.keys_found(), 1);
        assert!(tag.is_key_known(0, KeyType::A));
        assert!(!tag.is_key_known(0, KeyType::B));
        assert_eq!(tag.next_sector_missing_key(0), Some(0));

        for b in 0..4 {
            tag.set_block(b, Block::default());
        }
        assert!(tag.is_sector_read(0));
        assert_eq!(tag.sectors_read(), 1);
    }
}
