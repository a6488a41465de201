//! A software Mifare Classic tag.
//!
//! Implements the tag half of everything the poller speaks: activation,
//! plain and nested Crypto1 authentication, encrypted reads/writes, value
//! commands, halt, parity checking and the known auth backdoors. Used as the
//! engine's test double and as the CLI's demo target; it is not a tag
//! emulator for external readers.

use std::cell::RefCell;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::classic::{
    is_sector_trailer, sector_of_block, sector_trailer_block, AccessConditions, Ack, Action,
    Block, Command, Key, KeyType, TagSize, ValueBlock, BLOCK_SIZE,
};
use crate::crypto1::{prng_successor, weak_nonce_from_state, Crypto1};
use crate::errors::{Error, Result};
use crate::iso14443a::{odd_parity8, Frame, CMD_REQA, CMD_SEL_CL1, CMD_WUPA, NVB_ANTICOLLISION};
use crate::poller::Backdoor;
use crate::transport::FrameTransport;

/// Nonce generator behavior.
#[derive(Debug, Clone, Copy)]
pub enum SimPrng {
    /// Predictable 16-bit LFSR advancing a near-constant amount per
    /// authentication, like the classic weak tags.
    Weak,
    /// Uniformly random nonces.
    Hard,
    /// The same encrypted nonce every time (FM11RF08S-style).
    StaticEncrypted,
}

/// How far the weak PRNG steps between authentications. The small jitter
/// stays well inside the engine's default calibration tolerance.
const WEAK_ADVANCE_BASE: u32 = 160;

#[derive(Debug)]
enum PendingAuth {
    /// Nonce sent, waiting for the encrypted {nr}{ar} answer.
    ReaderAnswer { nt: u32, sector: u8, key_type: KeyType, backdoor: bool },
}

#[derive(Debug)]
enum PendingData {
    Write(u16),
    Value { block: u16, cmd: Command },
}

pub struct SimTag {
    size: TagSize,
    uid: [u8; 4],
    blocks: Vec<Block>,
    prng: SimPrng,
    backdoor: Backdoor,
    backdoor_key: Option<Key>,

    present: bool,
    halted: bool,
    selected: bool,
    cipher: Option<Crypto1>,
    auth: Option<(u8, KeyType, bool)>,
    pending_auth: Option<PendingAuth>,
    pending_data: Option<PendingData>,
    transfer: Option<ValueBlock>,

    weak_nt: u32,
    auth_count: u32,
    static_nt: u32,
    rng: StdRng,

    /// Total frames answered; handy for test assertions about traffic.
    pub exchanges: u64,
}

impl SimTag {
    pub fn new(size: TagSize, uid: [u8; 4], seed: u64) -> Self {
        let mut blocks = vec![Block::default(); size.block_count() as usize];
        for sector in 0..size.sector_count() {
            let trailer = sector_trailer_block(sector) as usize;
            blocks[trailer].0[0..6].copy_from_slice(&[0xFF; 6]);
            blocks[trailer].0[6..10].copy_from_slice(&[0xFF, 0x07, 0x80, 0x69]);
            blocks[trailer].0[10..16].copy_from_slice(&[0xFF; 6]);
        }
        Self {
            size,
            uid,
            blocks,
            prng: SimPrng::Weak,
            backdoor: Backdoor::None,
            backdoor_key: None,
            present: true,
            halted: false,
            selected: false,
            cipher: None,
            auth: None,
            pending_auth: None,
            pending_data: None,
            transfer: None,
            weak_nt: weak_nonce_from_state((seed as u16).max(1)),
            auth_count: 0,
            static_nt: 0x5AA55AA5,
            rng: StdRng::seed_from_u64(seed),
            exchanges: 0,
        }
    }

    pub fn set_prng(&mut self, prng: SimPrng) {
        self.prng = prng;
    }

    /// Enables one of the known backdoors with its fixed key.
    pub fn set_backdoor(&mut self, kind: Backdoor, key: Key) {
        self.backdoor = kind;
        self.backdoor_key = Some(key);
    }

    pub fn set_keys(&mut self, sector: u8, key_a: Key, key_b: Key) {
        let trailer = sector_trailer_block(sector) as usize;
        self.blocks[trailer].0[0..6].copy_from_slice(key_a.as_bytes());
        self.blocks[trailer].0[10..16].copy_from_slice(key_b.as_bytes());
    }

    pub fn set_access(&mut self, sector: u8, access: [u8; 4]) {
        let trailer = sector_trailer_block(sector) as usize;
        self.blocks[trailer].0[6..10].copy_from_slice(&access);
    }

    pub fn set_block(&mut self, block: u16, data: Block) {
        self.blocks[block as usize] = data;
    }

    pub fn block(&self, block: u16) -> &Block {
        &self.blocks[block as usize]
    }

    /// Pull the tag out of the field (everything volatile is lost).
    pub fn remove(&mut self) {
        self.present = false;
        self.reset_protocol();
        self.halted = false;
    }

    pub fn insert(&mut self) {
        self.present = true;
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    fn reset_protocol(&mut self) {
        self.selected = false;
        self.cipher = None;
        self.auth = None;
        self.pending_auth = None;
        self.pending_data = None;
    }

    fn key_of(&self, sector: u8, key_type: KeyType) -> Key {
        let trailer = sector_trailer_block(sector) as usize;
        let bytes = match key_type {
            KeyType::A => &self.blocks[trailer].0[0..6],
            KeyType::B => &self.blocks[trailer].0[10..16],
        };
        Key(bytes.try_into().unwrap())
    }

    fn access_of(&self, sector: u8) -> AccessConditions {
        let trailer = sector_trailer_block(sector) as usize;
        AccessConditions::parse(&self.blocks[trailer]).unwrap_or_else(|_| {
            AccessConditions::transport()
        })
    }

    fn next_nonce(&mut self) -> u32 {
        self.auth_count += 1;
        match self.prng {
            SimPrng::Weak => {
                let jitter = (self.auth_count % 4) * 2;
                self.weak_nt = prng_successor(self.weak_nt, WEAK_ADVANCE_BASE + jitter);
                self.weak_nt
            }
            SimPrng::Hard => self.rng.gen(),
            SimPrng::StaticEncrypted => self.static_nt,
        }
    }

    fn atqa_sak(&self) -> ([u8; 2], u8) {
        match self.size {
            TagSize::Mini => ([0x04, 0x00], 0x09),
            TagSize::S1k => ([0x04, 0x00], 0x08),
            TagSize::S4k => ([0x02, 0x00], 0x18),
        }
    }

    fn exchange_impl(&mut self, tx: &Frame, _fwt_fc: u32) -> Result<Frame> {
        if !self.present {
            return Err(Error::Timeout);
        }
        self.exchanges += 1;

        // Short frames are always plaintext, whatever the cipher state.
        if tx.is_short() {
            return match tx.data()[0] {
                CMD_WUPA => {
                    self.reset_protocol();
                    self.halted = false;
                    Ok(Frame::standard(self.atqa_sak().0.to_vec()))
                }
                CMD_REQA if !self.halted => {
                    self.reset_protocol();
                    Ok(Frame::standard(self.atqa_sak().0.to_vec()))
                }
                _ => Err(Error::Timeout),
            };
        }

        if let Some(PendingAuth::ReaderAnswer { .. }) = self.pending_auth {
            return self.handle_reader_answer(tx);
        }

        if self.cipher.is_some() {
            return self.handle_encrypted(tx);
        }

        self.handle_plain(tx)
    }

    fn handle_plain(&mut self, tx: &Frame) -> Result<Frame> {
        let data = tx.data();
        match data {
            [CMD_SEL_CL1, NVB_ANTICOLLISION] => {
                let mut out = self.uid.to_vec();
                out.push(self.uid.iter().fold(0, |acc, b| acc ^ b));
                Ok(Frame::standard(out))
            }
            [CMD_SEL_CL1, _, rest @ ..] if rest.len() == 7 => {
                if rest[0..4] != self.uid {
                    return Err(Error::Timeout);
                }
                self.selected = true;
                let mut out = vec![self.atqa_sak().1];
                let crc = crate::iso14443a::crc_a(&out);
                out.push(crc as u8);
                out.push((crc >> 8) as u8);
                Ok(Frame::standard(out))
            }
            [cmd, block, _, _] if self.selected => self.handle_auth_start(*cmd, *block, false),
            _ => Err(Error::Timeout),
        }
    }

    /// Starts an authentication. With `nested` set the request arrived under
    /// a live cipher, so the nonce goes out encrypted under the new key.
    fn handle_auth_start(&mut self, cmd: u8, block: u8, nested: bool) -> Result<Frame> {
        let (key_type, backdoor) = match Command::try_from(cmd) {
            Ok(Command::AuthKeyA) => (KeyType::A, false),
            Ok(Command::AuthKeyB) => (KeyType::B, false),
            Ok(Command::BackdoorAuthKeyA) => (KeyType::A, true),
            Ok(Command::BackdoorAuthKeyB) => (KeyType::B, true),
            Ok(Command::Halt) => {
                self.halted = true;
                self.reset_protocol();
                return Err(Error::Timeout);
            }
            _ => return Err(Error::Timeout),
        };
        let sector = sector_of_block(u16::from(block));
        let key = if backdoor {
            match (self.backdoor, &self.backdoor_key) {
                (Backdoor::None | Backdoor::Unknown, _) | (_, None) => {
                    // No backdoor on this tag revision: mute.
                    self.reset_protocol();
                    return Err(Error::Timeout);
                }
                (_, Some(key)) => *key,
            }
        } else {
            self.key_of(sector, key_type)
        };

        let nt = if backdoor && self.backdoor == Backdoor::Auth3 {
            self.static_nt
        } else {
            self.next_nonce()
        };
        let mut cipher = Crypto1::new(key.to_u64());
        let uid = u32::from_be_bytes(self.uid);

        let response = if nested {
            // Nested: the fresh cipher encrypts its own nonce while feeding
            // uid ^ nt.
            let xored = (uid ^ nt).to_be_bytes();
            let nt_bytes = nt.to_be_bytes();
            let mut data = Vec::with_capacity(4);
            let mut parity = Vec::with_capacity(4);
            for i in 0..4 {
                let ks = cipher.byte(xored[i], false);
                data.push(ks ^ nt_bytes[i]);
                parity.push(odd_parity8(nt_bytes[i]) ^ cipher.peek_bit());
            }
            Frame::with_parity(data, parity)
        } else {
            // Plain: nonce in the clear, then both sides feed uid ^ nt.
            cipher.word(uid ^ nt, false);
            Frame::standard(nt.to_be_bytes().to_vec())
        };

        self.cipher = Some(cipher);
        self.auth = None;
        self.pending_auth = Some(PendingAuth::ReaderAnswer { nt, sector, key_type, backdoor });
        Ok(response)
    }

    fn handle_reader_answer(&mut self, tx: &Frame) -> Result<Frame> {
        let (nt, sector, key_type, backdoor) = match self.pending_auth.take() {
            Some(PendingAuth::ReaderAnswer { nt, sector, key_type, backdoor }) => {
                (nt, sector, key_type, backdoor)
            }
            None => return Err(Error::Timeout),
        };
        if tx.len_bytes() != 8 {
            self.reset_protocol();
            return Err(Error::Timeout);
        }
        let cipher = match self.cipher.as_mut() {
            Some(cipher) => cipher,
            None => return Err(Error::Timeout),
        };

        let mut plain = [0u8; 8];
        let mut parity_ok = true;
        for i in 0..8 {
            let enc = tx.data()[i];
            plain[i] = if i < 4 {
                // {nr}: the register eats the encrypted bits.
                cipher.byte(enc, true) ^ enc
            } else {
                cipher.decrypt_byte(enc)
            };
            let expect = odd_parity8(plain[i]) ^ cipher.peek_bit();
            if tx.parity().get(i).copied().unwrap_or(2) & 1 != expect {
                parity_ok = false;
            }
        }
        let ar = u32::from_be_bytes(plain[4..8].try_into().unwrap());
        if !parity_ok || ar != prng_successor(nt, 64) {
            // Wrong key or mangled parity: the tag goes mute.
            self.reset_protocol();
            return Err(Error::Timeout);
        }

        let at = prng_successor(nt, 96);
        let mut data = Vec::with_capacity(4);
        let mut parity = Vec::with_capacity(4);
        for b in at.to_be_bytes() {
            let ks = cipher.byte(0, false);
            data.push(ks ^ b);
            parity.push(odd_parity8(b) ^ cipher.peek_bit());
        }
        self.auth = Some((sector, key_type, backdoor));
        Ok(Frame::with_parity(data, parity))
    }

    fn handle_encrypted(&mut self, tx: &Frame) -> Result<Frame> {
        let (sector, key_type, backdoor_session) = match self.auth {
            Some(auth) => auth,
            None => return Err(Error::Timeout),
        };

        // Decrypt and parity-check the whole frame first.
        let mut plain = Vec::with_capacity(tx.len_bytes());
        let mut parity_ok = true;
        {
            let cipher = self.cipher.as_mut().ok_or(Error::Timeout)?;
            for (i, enc) in tx.data().iter().enumerate() {
                let p = cipher.decrypt_byte(*enc);
                let expect = odd_parity8(p) ^ cipher.peek_bit();
                if tx.parity().get(i).copied().unwrap_or(2) & 1 != expect {
                    parity_ok = false;
                }
                plain.push(p);
            }
        }
        if !parity_ok {
            return self.nak(Ack::NakParityCrcError);
        }

        if let Some(pending) = self.pending_data.take() {
            return self.handle_data_leg(pending, &plain);
        }

        if plain.len() != 4 {
            return Err(Error::Timeout);
        }
        let crc_ok = {
            let frame = Frame::standard(plain.clone());
            frame.check_crc()
        };
        if !crc_ok {
            return self.nak(Ack::NakParityCrcError);
        }
        let (cmd, block) = (plain[0], u16::from(plain[1]));

        match Command::try_from(cmd) {
            Ok(
                Command::AuthKeyA
                | Command::AuthKeyB
                | Command::BackdoorAuthKeyA
                | Command::BackdoorAuthKeyB,
            ) => self.handle_auth_start(cmd, plain[1], true),
            Ok(Command::Halt) => {
                self.halted = true;
                self.reset_protocol();
                Err(Error::Timeout)
            }
            Ok(Command::Read) => self.handle_read(block, sector, key_type, backdoor_session),
            Ok(Command::Write) => {
                if !backdoor_session
                    && !self
                        .writable(block, sector, key_type)
                {
                    return self.nak(Ack::NakInvalidArgument);
                }
                self.pending_data = Some(PendingData::Write(block));
                self.ack()
            }
            Ok(cmd @ (Command::Increment | Command::Decrement | Command::Restore)) => {
                let action = match cmd {
                    Command::Increment => Action::Increment,
                    _ => Action::Decrement,
                };
                let allowed = sector_of_block(block) == sector
                    && !is_sector_trailer(block)
                    && self.access_of(sector).data_perm(sector, block, action).allows(key_type)
                    && ValueBlock::parse(&self.blocks[block as usize]).is_ok();
                if !allowed {
                    return self.nak(Ack::NakInvalidArgument);
                }
                self.pending_data = Some(PendingData::Value { block, cmd });
                self.ack()
            }
            Ok(Command::Transfer) => {
                let staged = match self.transfer.take() {
                    Some(staged) => staged,
                    None => return self.nak(Ack::NakInvalidOperation),
                };
                let allowed = sector_of_block(block) == sector
                    && !is_sector_trailer(block)
                    && self
                        .access_of(sector)
                        .data_perm(sector, block, Action::Decrement)
                        .allows(key_type);
                if !allowed {
                    return self.nak(Ack::NakInvalidArgument);
                }
                self.blocks[block as usize] = staged.encode();
                self.ack()
            }
            Err(_) => self.nak(Ack::NakInvalidOperation),
        }
    }

    fn handle_data_leg(&mut self, pending: PendingData, plain: &[u8]) -> Result<Frame> {
        match pending {
            PendingData::Write(block) => {
                if plain.len() != BLOCK_SIZE + 2 || !Frame::standard(plain.to_vec()).check_crc() {
                    return self.nak(Ack::NakParityCrcError);
                }
                self.blocks[block as usize] =
                    Block(plain[..BLOCK_SIZE].try_into().unwrap());
                self.ack()
            }
            PendingData::Value { block, cmd } => {
                if plain.len() != 6 || !Frame::standard(plain.to_vec()).check_crc() {
                    return self.nak(Ack::NakParityCrcError);
                }
                let operand = i32::from_le_bytes(plain[..4].try_into().unwrap());
                let current = match ValueBlock::parse(&self.blocks[block as usize]) {
                    Ok(value) => value,
                    Err(_) => return self.nak(Ack::NakInvalidOperation),
                };
                let value = match cmd {
                    Command::Increment => current.value.wrapping_add(operand),
                    Command::Decrement => current.value.wrapping_sub(operand),
                    _ => current.value,
                };
                self.transfer = Some(ValueBlock { value, addr: current.addr });
                // The data leg of a value command is never acknowledged.
                Err(Error::Timeout)
            }
        }
    }

    fn handle_read(
        &mut self,
        block: u16,
        sector: u8,
        key_type: KeyType,
        backdoor_session: bool,
    ) -> Result<Frame> {
        if block >= self.size.block_count() {
            return self.nak(Ack::NakInvalidArgument);
        }
        if !backdoor_session {
            if sector_of_block(block) != sector {
                return self.nak(Ack::NakInvalidArgument);
            }
            if !is_sector_trailer(block)
                && !self
                    .access_of(sector)
                    .data_perm(sector, block, Action::Read)
                    .allows(key_type)
            {
                return self.nak(Ack::NakInvalidArgument);
            }
        }

        let mut data = self.blocks[block as usize].0;
        if is_sector_trailer(block) && !backdoor_session {
            // Key A never reads back; key B only under permissive bits.
            data[0..6].fill(0);
            if !self.access_of(sector_of_block(block)).key_b_readable() {
                data[10..16].fill(0);
            }
        }
        let mut payload = data.to_vec();
        let crc = crate::iso14443a::crc_a(&payload);
        payload.push(crc as u8);
        payload.push((crc >> 8) as u8);
        self.encrypt_response(&payload)
    }

    fn writable(&self, block: u16, sector: u8, key_type: KeyType) -> bool {
        if sector_of_block(block) != sector || block == 0 {
            return false;
        }
        let access = self.access_of(sector);
        if is_sector_trailer(block) {
            [
                crate::classic::TrailerPart::KeyA,
                crate::classic::TrailerPart::AccessBits,
                crate::classic::TrailerPart::KeyB,
            ]
            .iter()
            .any(|part| access.trailer_write_perm(*part).allows(key_type))
        } else {
            access.data_perm(sector, block, Action::Write).allows(key_type)
        }
    }

    fn encrypt_response(&mut self, payload: &[u8]) -> Result<Frame> {
        let cipher = self.cipher.as_mut().ok_or(Error::Timeout)?;
        let mut data = Vec::with_capacity(payload.len());
        let mut parity = Vec::with_capacity(payload.len());
        for b in payload {
            let enc = cipher.encrypt_byte(*b, 0);
            data.push(enc.data);
            parity.push(enc.parity);
        }
        Ok(Frame::with_parity(data, parity))
    }

    fn ack(&mut self) -> Result<Frame> {
        self.nibble_response(Ack::Ack)
    }

    fn nak(&mut self, code: Ack) -> Result<Frame> {
        self.nibble_response(code)
    }

    fn nibble_response(&mut self, code: Ack) -> Result<Frame> {
        let cipher = self.cipher.as_mut().ok_or(Error::Timeout)?;
        let ks = cipher.nibble(0, false);
        Ok(Frame::nibble(u8::from(code) ^ ks))
    }
}

impl FrameTransport for SimTag {
    fn exchange(&mut self, tx: &Frame, fwt_fc: u32) -> Result<Frame> {
        self.exchange_impl(tx, fwt_fc)
    }
}

/// Shared handle so tests and the CLI can yank the tag out of the field
/// while the poller owns the transport.
#[derive(Clone)]
pub struct SharedTag(Rc<RefCell<SimTag>>);

impl SharedTag {
    pub fn new(tag: SimTag) -> Self {
        Self(Rc::new(RefCell::new(tag)))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut SimTag) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }
}

impl FrameTransport for SharedTag {
    fn exchange(&mut self, tx: &Frame, fwt_fc: u32) -> Result<Frame> {
        self.0.borrow_mut().exchange_impl(tx, fwt_fc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::{Poller, PollerConfig};

    fn make_poller(tag: SimTag) -> Poller<SimTag> {
        Poller::new(tag, PollerConfig::default())
    }

    #[test]
    fn activation_and_plain_auth() {
        let tag = SimTag::new(TagSize::S1k, [0xDE, 0xAD, 0xBE, 0xEF], 7);
        let mut poller = make_poller(tag);
        poller.activate().unwrap();
        assert_eq!(poller.data().uid, [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(poller.data().sak, 0x08);

        let ctx = poller
            .authenticate(3, Key::from_u64(0xFFFFFFFFFFFF), KeyType::A, false)
            .unwrap();
        assert!(crate::crypto1::is_weak_nonce(ctx.nt));
    }

    #[test]
    fn wrong_key_goes_mute() {
        let tag = SimTag::new(TagSize::S1k, [1, 2, 3, 4], 7);
        let mut poller = make_poller(tag);
        poller.activate().unwrap();
        let err = poller
            .authenticate(3, Key::from_u64(0x123456789ABC), KeyType::A, false)
            .unwrap_err();
        assert_eq!(err, Error::Timeout);
    }

    #[test]
    fn read_block_roundtrip() {
        let mut tag = SimTag::new(TagSize::S1k, [1, 2, 3, 4], 7);
        let mut secret = Block::default();
        secret.0[0..4].copy_from_slice(b"mfc!");
        tag.set_block(1, secret);

        let mut poller = make_poller(tag);
        poller.activate().unwrap();
        poller
            .authenticate(3, Key::from_u64(0xFFFFFFFFFFFF), KeyType::A, false)
            .unwrap();
        let read = poller.read_block(1).unwrap();
        assert_eq!(read, secret);
    }

    #[test]
    fn trailer_read_masks_keys() {
        let mut tag = SimTag::new(TagSize::S1k, [1, 2, 3, 4], 7);
        tag.set_keys(1, Key::from_u64(0xA0A1A2A3A4A5), Key::from_u64(0xB0B1B2B3B4B5));
        // Lock the sector down so key B stops being readable.
        let acc = {
            let mut trailer = Block::default();
            trailer.0[6..10].copy_from_slice(&[0x0F, 0x00, 0xFF, 0x69]);
            AccessConditions::parse(&trailer).unwrap()
        };
        tag.set_access(1, acc.encode());

        let mut poller = make_poller(tag);
        poller.activate().unwrap();
        poller
            .authenticate(7, Key::from_u64(0xB0B1B2B3B4B5), KeyType::B, false)
            .unwrap();
        let trailer = poller.read_block(7).unwrap();
        assert_eq!(&trailer.0[0..6], &[0; 6]);
        assert_eq!(&trailer.0[10..16], &[0; 6]);
    }

    #[test]
    fn write_and_read_back() {
        let tag = SimTag::new(TagSize::S1k, [1, 2, 3, 4], 9);
        let mut poller = make_poller(tag);
        poller.activate().unwrap();
        poller
            .authenticate(3, Key::from_u64(0xFFFFFFFFFFFF), KeyType::A, false)
            .unwrap();
        let mut data = Block::default();
        data.0[..5].copy_from_slice(b"hello");
        poller.write_block(2, &data).unwrap();
        assert_eq!(poller.read_block(2).unwrap(), data);
    }

    #[test]
    fn value_block_increment_and_transfer() {
        let mut tag = SimTag::new(TagSize::S1k, [1, 2, 3, 4], 9);
        tag.set_block(1, ValueBlock { value: 100, addr: 1 }.encode());
        let mut poller = make_poller(tag);
        poller.activate().unwrap();
        poller
            .authenticate(3, Key::from_u64(0xFFFFFFFFFFFF), KeyType::A, false)
            .unwrap();
        poller
            .value_cmd(1, crate::poller::ValueCommand::Increment, 23)
            .unwrap();
        poller.value_transfer(1).unwrap();
        let value = poller.read_value(1).unwrap();
        assert_eq!(value.value, 123);
    }

    #[test]
    fn nested_auth_under_live_session() {
        let mut tag = SimTag::new(TagSize::S1k, [1, 2, 3, 4], 11);
        tag.set_keys(2, Key::from_u64(0x4D3A99C351DD), Key::from_u64(0x4D3A99C351DD));
        let mut poller = make_poller(tag);
        poller.activate().unwrap();
        poller
            .authenticate(3, Key::from_u64(0xFFFFFFFFFFFF), KeyType::A, false)
            .unwrap();
        let ctx = poller
            .authenticate_nested(11, Key::from_u64(0x4D3A99C351DD), KeyType::A, false, false)
            .unwrap();
        assert!(crate::crypto1::is_weak_nonce(ctx.nt));
        // The new session works: read from sector 2.
        let _ = poller.read_block(8).unwrap();
    }

    #[test]
    fn early_return_burns_the_session() {
        let tag = SimTag::new(TagSize::S1k, [1, 2, 3, 4], 11);
        let mut poller = make_poller(tag);
        poller.activate().unwrap();
        poller
            .authenticate(3, Key::from_u64(0xFFFFFFFFFFFF), KeyType::A, false)
            .unwrap();
        let ctx = poller
            .authenticate_nested(7, Key::from_u64(0), KeyType::A, false, true)
            .unwrap();
        assert_ne!(ctx.nt_enc, 0);
        assert_eq!(poller.read_block(0).unwrap_err(), Error::Session);
    }

    #[test]
    fn halt_is_idempotent_and_wupa_wakes() {
        let tag = SimTag::new(TagSize::S1k, [1, 2, 3, 4], 3);
        let mut poller = make_poller(tag);
        poller.activate().unwrap();
        poller.halt().unwrap();
        poller.halt().unwrap();
        poller.activate().unwrap();
    }

    #[test]
    fn backdoor_auth_works_only_when_present() {
        let key = Key::from_u64(0xA396EFA4E24F);
        let mut tag = SimTag::new(TagSize::S1k, [1, 2, 3, 4], 3);
        tag.set_backdoor(Backdoor::Auth3, key);
        let mut poller = make_poller(tag);
        poller.activate().unwrap();
        poller.authenticate(3, key, KeyType::A, true).unwrap();
        // Backdoor sessions read trailers unmasked.
        let trailer = poller.read_block(3).unwrap();
        assert_eq!(&trailer.0[0..6], &[0xFF; 6]);

        let tag = SimTag::new(TagSize::S1k, [1, 2, 3, 4], 3);
        let mut poller = make_poller(tag);
        poller.activate().unwrap();
        assert_eq!(
            poller.authenticate(3, key, KeyType::A, true).unwrap_err(),
            Error::Timeout
        );
    }

    #[test]
    fn removal_goes_quiet() {
        let shared = SharedTag::new(SimTag::new(TagSize::S1k, [1, 2, 3, 4], 3));
        let mut poller = Poller::new(shared.clone(), PollerConfig::default());
        poller.activate().unwrap();
        shared.with(|tag| tag.remove());
        assert!(poller.activate().is_err());
        shared.with(|tag| tag.insert());
        poller.activate().unwrap();
    }
}
