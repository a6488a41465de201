//! Wire-level operations: activation, plain and nested authentication,
//! halt, and the post-authentication data commands.
//!
//! All of these require the poller to hold the field, and the data commands
//! additionally require a live cipher; misuse is reported as
//! [`Error::Session`] rather than trusted to caller discipline.

use rand::Rng;
use tracing::{trace, trace_span};

use crate::classic::{
    sector_of_block, Ack, Action, Block, Command, Key, KeyType, TagSize, ValueBlock, BLOCK_SIZE,
};
use crate::crypto1::{prng_successor, Crypto1};
use crate::errors::{Error, Result};
use crate::iso14443a::{
    self, parse_anticollision, parse_atqa, parse_sak, Frame, CMD_SEL_CL1, CMD_WUPA,
    NVB_ANTICOLLISION, NVB_SELECT,
};
use crate::transport::{FrameTransport, FWT_ACTIVATION_FC, FWT_DEFAULT_FC};

use super::Poller;

/// Everything learned from one completed (or truncated) authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthContext {
    pub block: u16,
    pub key_type: KeyType,
    /// Plaintext tag nonce. Zero when the exchange was truncated early.
    pub nt: u32,
    /// The nonce as received: equal to `nt` for a plain authentication,
    /// ciphertext for a nested one.
    pub nt_enc: u32,
    /// Parity bits of the received nonce, one per byte.
    pub parity: [u8; 4],
    pub nr: u32,
    pub ar: u32,
    pub at: u32,
}

/// Value block manipulation commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueCommand {
    Increment,
    Decrement,
    Restore,
}

impl ValueCommand {
    fn command(&self) -> Command {
        match self {
            ValueCommand::Increment => Command::Increment,
            ValueCommand::Decrement => Command::Decrement,
            ValueCommand::Restore => Command::Restore,
        }
    }
}

/// Outcome of the ISO14443-3A activation sequence.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Activation {
    pub atqa: u16,
    pub uid: [u8; 4],
    pub sak: u8,
}

impl<T: FrameTransport> Poller<T> {
    /// Runs WUPA, anticollision and select. Tears down any cipher state:
    /// a reselected tag has forgotten everything.
    pub fn activate(&mut self) -> Result<()> {
        let act = self.activate_raw()?;
        if self.data.sak == 0 && self.data.atqa == 0 {
            // First contact: size the snapshot from the SAK.
            let size = TagSize::from_sak(act.sak);
            self.data = crate::classic::TagData::new(size);
            self.read_attempted = vec![false; size.sector_count() as usize];
        } else if self.data.uid != act.uid {
            return Err(Error::Protocol("different tag in field"));
        }
        self.data.uid = act.uid;
        self.data.atqa = act.atqa;
        self.data.sak = act.sak;
        Ok(())
    }

    fn activate_raw(&mut self) -> Result<Activation> {
        let span = trace_span!("activate");
        let _enter = span.enter();

        self.session.reset();

        let rx = self
            .transport
            .exchange(&Frame::short(CMD_WUPA), FWT_ACTIVATION_FC)?;
        let atqa = parse_atqa(rx.data())?;

        let rx = self.transport.exchange(
            &Frame::standard(vec![CMD_SEL_CL1, NVB_ANTICOLLISION]),
            FWT_ACTIVATION_FC,
        )?;
        let uid = parse_anticollision(rx.data())?;
        if atqa.uid_size_hint() != 0 {
            return Err(Error::Protocol("cascaded UIDs not supported"));
        }

        let bcc = uid.iter().fold(0, |acc, b| acc ^ b);
        let mut select = vec![CMD_SEL_CL1, NVB_SELECT];
        select.extend_from_slice(&uid);
        select.push(bcc);
        let rx = self
            .transport
            .exchange(&Frame::with_crc(select), FWT_ACTIVATION_FC)?;
        let sak = parse_sak(&rx)?;

        trace!(uid = %hex::encode_upper(uid), sak = sak.0, "tag selected");
        self.session.active = true;
        Ok(Activation { atqa: atqa.0, uid, sak: sak.0 })
    }

    /// Quick presence probe: can the tag still be activated?
    pub(crate) fn check_presence(&mut self) -> bool {
        self.activate().is_ok()
    }

    /// Issues an authentication-start command and captures the tag nonce
    /// without completing the exchange. Burns the session: the tag is left
    /// mid-handshake and must be reselected.
    pub fn get_nt(&mut self, block: u16, key_type: KeyType, backdoor: bool) -> Result<u32> {
        if !self.session.active {
            return Err(Error::Session);
        }
        let span = trace_span!("get_nt", block, %key_type);
        let _enter = span.enter();

        let cmd = key_type.auth_command(backdoor);
        let tx = Frame::with_crc(vec![cmd.into(), block as u8]);
        self.session.active = false;
        let rx = self.transport.exchange(&tx, FWT_DEFAULT_FC)?;
        if rx.len_bytes() != 4 {
            return Err(Error::Protocol("bad nonce length"));
        }
        Ok(u32::from_be_bytes(rx.data().try_into().unwrap()))
    }

    /// Same, but under an already-open authenticated session.
    pub fn get_nt_nested(&mut self, block: u16, key_type: KeyType, backdoor: bool) -> Result<u32> {
        let ctx =
            self.authenticate_nested(block, Key::from_u64(0), key_type, backdoor, true)?;
        Ok(ctx.nt_enc)
    }

    /// Full three-pass authentication. On success the cipher goes live and
    /// encrypted operations become valid.
    pub fn authenticate(
        &mut self,
        block: u16,
        key: Key,
        key_type: KeyType,
        backdoor: bool,
    ) -> Result<AuthContext> {
        if !self.session.active {
            return Err(Error::Session);
        }
        let span = trace_span!("auth", block, %key_type, backdoor);
        let _enter = span.enter();

        let cmd = key_type.auth_command(backdoor);
        let tx = Frame::with_crc(vec![cmd.into(), block as u8]);
        let rx = self.transport.exchange(&tx, FWT_DEFAULT_FC).map_err(|e| {
            self.session.active = false;
            e
        })?;
        if rx.len_bytes() != 4 {
            self.session.active = false;
            return Err(Error::Protocol("bad nonce length"));
        }
        let nt = u32::from_be_bytes(rx.data().try_into().unwrap());
        let mut parity = [0u8; 4];
        if rx.parity().len() == 4 {
            parity.copy_from_slice(rx.parity());
        }

        let mut cipher = Crypto1::new(key.to_u64());
        cipher.word(self.data.uid_u32() ^ nt, false);

        self.finish_auth(block, key_type, backdoor, cipher, nt, nt, parity)
    }

    /// Nested authentication: the start command goes out encrypted under the
    /// live cipher, and the tag nonce comes back encrypted under the target
    /// key. With `early_return` the exchange stops right after the encrypted
    /// nonce (`key` is not used); this is the nonce-harvesting path.
    pub fn authenticate_nested(
        &mut self,
        block: u16,
        key: Key,
        key_type: KeyType,
        backdoor: bool,
        early_return: bool,
    ) -> Result<AuthContext> {
        let span = trace_span!("auth_nested", block, %key_type, early_return);
        let _enter = span.enter();

        let cmd = key_type.auth_command(backdoor);
        let tx = self.encrypt_frame(&{
            let mut plain = vec![cmd.into(), block as u8];
            let crc = iso14443a::crc_a(&plain);
            plain.push(crc as u8);
            plain.push((crc >> 8) as u8);
            plain
        })?;

        let rx = self.transport.exchange(&tx, FWT_DEFAULT_FC).map_err(|e| {
            self.session.reset();
            e
        })?;
        if rx.len_bytes() != 4 {
            self.session.reset();
            return Err(Error::Protocol("bad nested nonce length"));
        }
        let nt_enc = u32::from_be_bytes(rx.data().try_into().unwrap());
        let mut parity = [0u8; 4];
        if rx.parity().len() == 4 {
            parity.copy_from_slice(rx.parity());
        }

        if early_return {
            // The old cipher is dead and the new one never came up; the tag
            // must be reselected before anything else happens.
            self.session.reset();
            return Ok(AuthContext {
                block,
                key_type,
                nt: 0,
                nt_enc,
                parity,
                nr: 0,
                ar: 0,
                at: 0,
            });
        }

        let mut cipher = Crypto1::new(key.to_u64());
        let ks = cipher.word(nt_enc ^ self.data.uid_u32(), true);
        let nt = ks ^ nt_enc;
        self.finish_auth(block, key_type, backdoor, cipher, nt, nt_enc, parity)
    }

    /// The shared {nr}{ar} / {at} tail of both authentication flavors.
    fn finish_auth(
        &mut self,
        block: u16,
        key_type: KeyType,
        backdoor: bool,
        mut cipher: Crypto1,
        nt: u32,
        nt_enc: u32,
        parity: [u8; 4],
    ) -> Result<AuthContext> {
        let nr: u32 = self.rng.gen();
        let ar = prng_successor(nt, 64);

        let mut data = Vec::with_capacity(8);
        let mut parity_out = Vec::with_capacity(8);
        for b in nr.to_be_bytes() {
            let enc = cipher.encrypt_byte(b, b);
            data.push(enc.data);
            parity_out.push(enc.parity);
        }
        for b in ar.to_be_bytes() {
            let enc = cipher.encrypt_byte(b, 0);
            data.push(enc.data);
            parity_out.push(enc.parity);
        }

        let rx = self
            .transport
            .exchange(&Frame::with_parity(data, parity_out), FWT_DEFAULT_FC)
            .map_err(|e| {
                self.session.reset();
                e
            })?;
        if rx.len_bytes() != 4 {
            self.session.reset();
            return Err(Error::Protocol("bad auth acknowledge"));
        }
        let mut at_bytes = [0u8; 4];
        for (i, b) in rx.data().iter().enumerate() {
            at_bytes[i] = cipher.decrypt_byte(*b);
        }
        let at = u32::from_be_bytes(at_bytes);
        if at != prng_successor(nt, 96) {
            self.session.reset();
            return Err(Error::Protocol("tag failed its own proof"));
        }

        self.session.active = true;
        self.session.cipher = Some(cipher);
        self.session.sector = Some(sector_of_block(block));
        self.session.key_type = Some(key_type);
        self.session.backdoor = backdoor;
        Ok(AuthContext { block, key_type, nt, nt_enc, parity, nr, ar, at })
    }

    /// Sends HLTA and tears the session down. Idempotent; a tag that is
    /// already gone counts as halted.
    pub fn halt(&mut self) -> Result<()> {
        if !self.session.active {
            self.session.reset();
            return Ok(());
        }
        let plain = {
            let mut p = vec![Command::Halt.into(), 0x00];
            let crc = iso14443a::crc_a(&p);
            p.push(crc as u8);
            p.push((crc >> 8) as u8);
            p
        };
        let tx = if self.session.cipher.is_some() {
            self.encrypt_frame(&plain)?
        } else {
            Frame::standard(plain)
        };
        let result = self.transport.exchange(&tx, FWT_ACTIVATION_FC);
        self.session.reset();
        match result {
            // Silence is the success case for HLTA.
            Err(Error::Timeout) => Ok(()),
            Err(e) => Err(e),
            Ok(_) => Err(Error::Protocol("tag answered HLTA")),
        }
    }

    /// Reads one block under the live session. Checks the access conditions
    /// first when the sector trailer is already known.
    pub fn read_block(&mut self, block: u16) -> Result<Block> {
        self.check_access(block, Action::Read)?;
        let span = trace_span!("read_block", block);
        let _enter = span.enter();

        let rx = self.exchange_encrypted(&[Command::Read.into(), block as u8], true)?;
        if rx.is_nibble() {
            return Err(nak_error(rx.data()[0]));
        }
        if rx.len_bytes() != BLOCK_SIZE + 2 {
            return Err(Error::Protocol("bad read response length"));
        }
        let payload = rx.strip_crc()?;
        Ok(Block(payload.try_into().unwrap()))
    }

    /// Writes one block under the live session.
    pub fn write_block(&mut self, block: u16, data: &Block) -> Result<()> {
        self.check_access(block, Action::Write)?;
        let span = trace_span!("write_block", block);
        let _enter = span.enter();

        let rx = self.exchange_encrypted(&[Command::Write.into(), block as u8], true)?;
        expect_ack(&rx)?;
        let mut payload = data.0.to_vec();
        let crc = iso14443a::crc_a(&payload);
        payload.push(crc as u8);
        payload.push((crc >> 8) as u8);
        let rx = self.exchange_encrypted(&payload, false)?;
        expect_ack(&rx)
    }

    /// Increment/decrement/restore into the tag's internal transfer block.
    /// Use [`Poller::value_transfer`] to commit the result.
    pub fn value_cmd(&mut self, block: u16, cmd: ValueCommand, operand: i32) -> Result<()> {
        let action = match cmd {
            ValueCommand::Increment => Action::Increment,
            _ => Action::Decrement,
        };
        self.check_access(block, action)?;
        let span = trace_span!("value_cmd", block, ?cmd, operand);
        let _enter = span.enter();

        let rx = self.exchange_encrypted(&[cmd.command().into(), block as u8], true)?;
        expect_ack(&rx)?;

        let mut payload = operand.to_le_bytes().to_vec();
        let crc = iso14443a::crc_a(&payload);
        payload.push(crc as u8);
        payload.push((crc >> 8) as u8);
        // The data leg of a value command is unacknowledged; silence means
        // the tag accepted it.
        match self.exchange_encrypted(&payload, false) {
            Err(Error::Timeout) => Ok(()),
            Ok(rx) if rx.is_nibble() => Err(nak_error(rx.data()[0])),
            Ok(_) => Err(Error::Protocol("unexpected value data response")),
            Err(e) => Err(e),
        }
    }

    /// Commits the transfer block written by [`Poller::value_cmd`].
    pub fn value_transfer(&mut self, block: u16) -> Result<()> {
        self.check_access(block, Action::Decrement)?;
        let rx = self.exchange_encrypted(&[Command::Transfer.into(), block as u8], true)?;
        expect_ack(&rx)
    }

    /// Parses a block as a value block, for the read-back after transfers.
    pub fn read_value(&mut self, block: u16) -> Result<ValueBlock> {
        let data = self.read_block(block)?;
        ValueBlock::parse(&data)
    }

    /// Transmit/receive a standard frame. Exposed for protocol exploration;
    /// the attack flows go through the typed operations above.
    pub fn send_frame(&mut self, data: Vec<u8>, fwt_fc: u32) -> Result<Frame> {
        self.transport.exchange(&Frame::standard(data), fwt_fc)
    }

    /// Transmit/receive a frame with caller-controlled parity bits.
    pub fn send_custom_parity_frame(&mut self, frame: &Frame, fwt_fc: u32) -> Result<Frame> {
        self.transport.exchange(frame, fwt_fc)
    }

    /// Transmit plaintext encrypted under the live cipher and return the
    /// decrypted response.
    pub fn send_encrypted_frame(&mut self, plain: Vec<u8>, fwt_fc: u32) -> Result<Frame> {
        let tx = self.encrypt_frame(&plain)?;
        let rx = self.transport.exchange(&tx, fwt_fc)?;
        self.decrypt_frame(&rx)
    }

    /// `cmd_leg` marks the command leg, where appending CRC_A is our job.
    fn exchange_encrypted(&mut self, plain: &[u8], cmd_leg: bool) -> Result<Frame> {
        let payload = if cmd_leg {
            let mut p = plain.to_vec();
            let crc = iso14443a::crc_a(&p);
            p.push(crc as u8);
            p.push((crc >> 8) as u8);
            p
        } else {
            plain.to_vec()
        };
        let tx = self.encrypt_frame(&payload)?;
        let rx = self.transport.exchange(&tx, FWT_DEFAULT_FC)?;
        self.decrypt_frame(&rx)
    }

    fn encrypt_frame(&mut self, plain: &[u8]) -> Result<Frame> {
        let cipher = self.session.cipher.as_mut().ok_or(Error::Session)?;
        let mut data = Vec::with_capacity(plain.len());
        let mut parity = Vec::with_capacity(plain.len());
        for b in plain {
            let enc = cipher.encrypt_byte(*b, 0);
            data.push(enc.data);
            parity.push(enc.parity);
        }
        Ok(Frame::with_parity(data, parity))
    }

    fn decrypt_frame(&mut self, rx: &Frame) -> Result<Frame> {
        let cipher = self.session.cipher.as_mut().ok_or(Error::Session)?;
        if rx.is_nibble() {
            let plain = cipher.nibble(0, false) ^ rx.data()[0];
            return Ok(Frame::nibble(plain));
        }
        let plain: Vec<u8> = rx.data().iter().map(|b| cipher.decrypt_byte(*b)).collect();
        Ok(Frame::standard(plain))
    }

    /// Local access-condition gate: refuse an operation the trailer bits
    /// already rule out, before touching the wire.
    fn check_access(&self, block: u16, action: Action) -> Result<()> {
        let key_type = match (self.session.cipher.as_ref(), self.session.key_type) {
            (Some(_), Some(kt)) => kt,
            _ => return Err(Error::Session),
        };
        if self.session.sector != Some(sector_of_block(block)) {
            return Err(Error::Session);
        }
        if self.session.backdoor {
            return Ok(());
        }
        let sector = sector_of_block(block);
        if let Some(acc) = self.data.access_conditions(sector) {
            if !crate::classic::is_sector_trailer(block)
                && !acc.data_perm(sector, block, action).allows(key_type)
            {
                return Err(Error::AccessDenied);
            }
        }
        Ok(())
    }
}

fn expect_ack(rx: &Frame) -> Result<()> {
    if !rx.is_nibble() {
        return Err(Error::Protocol("expected ACK/NAK"));
    }
    match Ack::try_from(rx.data()[0]) {
        Ok(Ack::Ack) => Ok(()),
        Ok(_) | Err(_) => Err(nak_error(rx.data()[0])),
    }
}

fn nak_error(nibble: u8) -> Error {
    match Ack::try_from(nibble) {
        Ok(Ack::NakInvalidArgument) => Error::AccessDenied,
        Ok(Ack::NakParityCrcError) => Error::Protocol("tag NAK: parity/CRC"),
        Ok(Ack::NakWriteError) => Error::Protocol("tag NAK: write failed"),
        _ => Error::Protocol("tag NAK"),
    }
}
