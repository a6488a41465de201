//! Session glue between the poller, the dictionary sources and the view —
//! the piece a frontend embeds.
//!
//! The runner answers the poller's request events from its dictionaries,
//! mirrors notification events into the view, forwards the view's skip
//! signal, and decides when a vanished card means "give up". It performs no
//! protocol logic of its own.

use tracing::{debug, info};

use crate::classic::TagData;
use crate::dict::KeyDictionary;
use crate::errors::{Error, Result};
use crate::poller::{Poller, PollerCommand, PollerEvent, PollerMode};
use crate::transport::FrameTransport;
use crate::view::DictAttackView;

/// How an attack session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttackOutcome {
    Success,
    Fail(Error),
    /// The card left the field and never came back within the configured
    /// patience.
    CardAbsent,
}

#[derive(Debug, Clone)]
pub struct AttackSummary {
    pub outcome: AttackOutcome,
    pub keys_found: u8,
    pub sectors_read: u8,
    pub sectors_total: u8,
}

pub struct DictAttackSession<D, N, V> {
    mode: PollerMode,
    dict: D,
    /// Dictionary for the nested engine's offline filter; typically the big
    /// system dictionary while `dict` is the per-card user one.
    nested_dict: N,
    view: V,
    /// Consecutive polls without a detected card before giving up.
    pub max_absent_polls: u32,

    dict_current: usize,
    serving_nested: bool,
    outcome: Option<AttackOutcome>,
}

impl<D, N, V> DictAttackSession<D, N, V>
where
    D: KeyDictionary,
    N: KeyDictionary,
    V: DictAttackView,
{
    pub fn new(mode: PollerMode, dict: D, nested_dict: N, view: V) -> Self {
        Self {
            mode,
            dict,
            nested_dict,
            view,
            max_absent_polls: 64,
            dict_current: 0,
            serving_nested: false,
            outcome: None,
        }
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut V {
        &mut self.view
    }

    /// Polls the attack to completion.
    pub fn run<T: FrameTransport>(&mut self, poller: &mut Poller<T>) -> Result<AttackSummary> {
        self.view.reset();
        self.view.set_header("Dictionary Attack");
        let mut absent: u32 = 0;

        loop {
            if self.view.skip_requested() {
                poller.request_skip();
            }
            let command = poller.poll(&mut |event| self.on_event(event))?;

            if poller.card_detected() {
                absent = 0;
            } else {
                absent += 1;
                if absent > self.max_absent_polls {
                    info!("card gone for too long, aborting session");
                    self.outcome = Some(AttackOutcome::CardAbsent);
                    break;
                }
            }
            if command == PollerCommand::Stop {
                break;
            }
        }

        Ok(self.summarize(poller.data()))
    }

    fn summarize(&self, data: &TagData) -> AttackSummary {
        AttackSummary {
            outcome: self
                .outcome
                .clone()
                .unwrap_or(AttackOutcome::Fail(Error::TagLost)),
            keys_found: data.keys_found(),
            sectors_read: data.sectors_read(),
            sectors_total: data.sector_count(),
        }
    }

    fn on_event(&mut self, event: PollerEvent<'_>) {
        match event {
            PollerEvent::RequestMode(request) => {
                request.mode = self.mode;
                self.view.set_sectors_total(request.sectors_total);
                self.view.set_dict_keys_total(self.dict.total());
            }
            PollerEvent::RequestKey(request) => {
                if request.nested != self.serving_nested {
                    // Switching between the per-sector pass and the nested
                    // filter; the view gets the other dictionary's total.
                    self.serving_nested = request.nested;
                    self.dict_current = 0;
                    let total = if request.nested {
                        self.nested_dict.total()
                    } else {
                        self.dict.total()
                    };
                    self.view.set_dict_keys_total(total);
                }
                let dict: &mut dyn KeyDictionary = if request.nested {
                    &mut self.nested_dict
                } else {
                    &mut self.dict
                };
                request.key = dict.next_key();
                match request.key {
                    Some(_) => self.dict_current += 1,
                    None => self.dict_current = 0,
                }
                self.view.set_dict_keys_current(self.dict_current);
            }
            // This session only drives attack modes; read/write requests go
            // unanswered and those sectors are skipped.
            PollerEvent::RequestReadSector(_)
            | PollerEvent::RequestSectorTrailer(_)
            | PollerEvent::RequestWriteBlock(_) => {}
            PollerEvent::NextSector { current_sector } => {
                self.dict.rewind();
                self.dict_current = 0;
                self.view.set_current_sector(current_sector);
                self.view.set_dict_keys_current(0);
            }
            PollerEvent::DataUpdate(update) => {
                self.view.set_sectors_read(update.sectors_read);
                self.view.set_keys_found(update.keys_found);
                self.view.set_current_sector(update.current_sector);
                self.view.set_nested_phase(update.nested_phase);
                self.view.set_prng_type(update.prng_type);
                self.view.set_backdoor(update.backdoor);
                self.view.set_nested_target_key(update.nested_target_key);
                self.view.set_msb_count(update.msb_count);
            }
            PollerEvent::FoundKeyA { sector, key } => {
                debug!(sector, %key, "key A recovered");
            }
            PollerEvent::FoundKeyB { sector, key } => {
                debug!(sector, %key, "key B recovered");
            }
            PollerEvent::KeyAttackStart { current_sector }
            | PollerEvent::KeyAttackNextSector { current_sector } => {
                self.view.set_key_attack(current_sector);
            }
            PollerEvent::KeyAttackStop => {
                self.view.reset_key_attack();
            }
            PollerEvent::CardDetected => {
                self.view.set_card_detected(true);
            }
            PollerEvent::CardLost => {
                self.view.set_card_detected(false);
            }
            PollerEvent::Success => {
                self.outcome = Some(AttackOutcome::Success);
            }
            PollerEvent::Fail { error } => {
                self.outcome = Some(AttackOutcome::Fail(error));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classic::{Key, KeyType, TagSize};
    use crate::dict::MemoryDict;
    use crate::poller::{NestedConfig, NestedPhase, PollerConfig, PrngType};
    use crate::sim::{SharedTag, SimPrng, SimTag};
    use crate::view::ProgressModel;

    const UID: [u8; 4] = [0xC0, 0xFF, 0xEE, 0x01];
    const DICT_KEY: u64 = 0xFFFFFFFFFFFF;

    fn fast_config() -> PollerConfig {
        PollerConfig {
            nested: NestedConfig {
                analyze_nonces: 3,
                nonces_per_target: 2,
                calibration_rounds: 3,
                msb_threshold: 8,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn keys(v: &[u64]) -> MemoryDict {
        MemoryDict::new(v.iter().copied().map(Key::from_u64).collect())
    }

    /// Two-key dictionary, key A is the second entry: one miss, one hit.
    #[test]
    fn second_dict_key_wins_after_one_miss() {
        let mut tag = SimTag::new(TagSize::Mini, UID, 42);
        // Sector 0: key A is dict entry #2, key B is unguessable. Other
        // sectors stay on factory keys, which are not in this dictionary.
        tag.set_keys(0, Key::from_u64(0x222222222222), Key::from_u64(0x5EC2E7B10C5u64));

        /// Captures the dictionary cursor at the moment a key lands, and the
        /// whole cursor history up to that point.
        #[derive(Default)]
        struct Probe {
            model: ProgressModel,
            history: Vec<usize>,
            current_at_first_key: Option<usize>,
        }
        impl DictAttackView for Probe {
            fn set_dict_keys_current(&mut self, current: usize) {
                if self.current_at_first_key.is_none() {
                    self.history.push(current);
                }
                self.model.set_dict_keys_current(current);
            }
            fn set_keys_found(&mut self, found: u8) {
                if found == 1 && self.current_at_first_key.is_none() {
                    self.current_at_first_key = Some(self.model.dict_keys_current);
                }
                self.model.set_keys_found(found);
            }
        }

        let mut poller = Poller::new(tag, PollerConfig::default());
        let dict = keys(&[0x111111111111, 0x222222222222]);
        let mut session = DictAttackSession::new(
            PollerMode::DictAttackStandard,
            dict,
            keys(&[]),
            Probe::default(),
        );
        let summary = session.run(&mut poller).unwrap();

        assert_eq!(summary.outcome, AttackOutcome::Success);
        assert_eq!(summary.keys_found, 1);
        assert_eq!(summary.sectors_read, 1);
        // One failed and one successful attempt: cursor read 2 when the key
        // was reported.
        assert_eq!(session.view().current_at_first_key, Some(2));
        // And it never moved backwards within the sector's pass.
        assert!(session.view().history.windows(2).all(|w| w[0] <= w[1]));
        assert!(poller.data().is_key_known(0, KeyType::A));
        assert!(!poller.data().is_key_known(0, KeyType::B));
    }

    /// A found key is tried on the next unresolved sector before the
    /// dictionary continues.
    #[test]
    fn key_reuse_precedes_further_dictionary_work() {
        let shared_key = Key::from_u64(0x4D3A99C351DD);
        let mut tag = SimTag::new(TagSize::Mini, UID, 7);
        for sector in 0..5 {
            tag.set_keys(sector, shared_key, shared_key);
        }

        let mut poller = Poller::new(tag, PollerConfig::default());
        let mut dict = keys(&[0x111111111111, 0x4D3A99C351DD]);
        let mut log: Vec<String> = Vec::new();
        loop {
            let cmd = poller
                .poll(&mut |event| match event {
                    PollerEvent::RequestMode(req) => {
                        req.mode = PollerMode::DictAttackStandard;
                        log.push("mode".into());
                    }
                    PollerEvent::RequestKey(req) => {
                        req.key = dict.next_key();
                        log.push(format!("request_key s{}", req.sector));
                    }
                    PollerEvent::NextSector { .. } => {
                        dict.rewind();
                        log.push("next_sector".into());
                    }
                    PollerEvent::FoundKeyA { sector, .. } => log.push(format!("found_a s{sector}")),
                    PollerEvent::FoundKeyB { sector, .. } => log.push(format!("found_b s{sector}")),
                    PollerEvent::KeyAttackStart { .. } => log.push("reuse_start".into()),
                    PollerEvent::KeyAttackNextSector { current_sector } => {
                        log.push(format!("reuse s{current_sector}"))
                    }
                    PollerEvent::KeyAttackStop => log.push("reuse_stop".into()),
                    _ => {}
                })
                .unwrap();
            if cmd == PollerCommand::Stop {
                break;
            }
        }

        let found_a0 = log.iter().position(|e| e == "found_a s0").unwrap();
        let reuse_s1 = log.iter().position(|e| e == "reuse s1").unwrap();
        let found_a1 = log.iter().position(|e| e == "found_a s1").unwrap();
        // The sweep on sector 1 happens right after the sector 0 hit, and it
        // lands the key before any more dictionary requests.
        assert!(found_a0 < reuse_s1 && reuse_s1 < found_a1);
        let dict_requests_between = log[found_a0..found_a1]
            .iter()
            .filter(|e| e.starts_with("request_key"))
            .count();
        assert_eq!(dict_requests_between, 0);
        // The single shared key cracks the whole tag.
        assert_eq!(poller.data().keys_found(), 10);
    }

    /// A tag removed mid-attack resumes at the same dictionary cursor,
    /// skipping and repeating nothing.
    #[test]
    fn card_loss_pauses_and_resumes_at_cursor() {
        let mut tag = SimTag::new(TagSize::Mini, UID, 13);
        let secret = Key::from_u64(0x0000000C0FFE);
        tag.set_keys(0, secret, secret);
        let shared = SharedTag::new(tag);

        let mut poller = Poller::new(shared.clone(), PollerConfig::default());
        let dict_keys: Vec<u64> =
            vec![0x1, 0x2, 0x3, 0x4, 0x0000000C0FFE, 0x5];
        let mut dict = keys(&dict_keys);
        let mut served: Vec<Key> = Vec::new();
        let mut lost_seen = false;
        let mut detected_count = 0u32;
        let mut polls = 0u32;

        loop {
            polls += 1;
            assert!(polls < 10_000, "attack did not converge");
            let shared_for_cb = shared.clone();
            let cmd = poller
                .poll(&mut |event| match event {
                    PollerEvent::RequestMode(req) => req.mode = PollerMode::DictAttackStandard,
                    PollerEvent::RequestKey(req) => {
                        req.key = dict.next_key();
                        if let Some(key) = req.key {
                            served.push(key);
                        }
                        // Yank the card right after the second key is served.
                        if served.len() == 2 && shared_for_cb.with(|t| t.is_present()) {
                            shared_for_cb.with(|t| t.remove());
                        }
                    }
                    PollerEvent::NextSector { .. } => dict.rewind(),
                    PollerEvent::CardLost => lost_seen = true,
                    PollerEvent::CardDetected => detected_count += 1,
                    _ => {}
                })
                .unwrap();
            if lost_seen && !shared.with(|t| t.is_present()) {
                shared.with(|t| t.insert());
            }
            if cmd == PollerCommand::Stop {
                break;
            }
        }

        assert!(lost_seen);
        assert_eq!(detected_count, 2);
        assert!(poller.data().is_key_known(0, KeyType::A));
        // Sector 0's pass served each key at most once: no rewind happened
        // because of the interruption.
        let first_pass: Vec<_> = served.iter().take(5).map(|k| k.to_u64()).collect();
        assert_eq!(first_pass, dict_keys[..5].to_vec());
    }

    #[test]
    fn skip_abandons_the_current_sector() {
        let mut tag = SimTag::new(TagSize::Mini, UID, 5);
        tag.set_keys(0, Key::from_u64(DICT_KEY), Key::from_u64(DICT_KEY));
        let mut poller = Poller::new(tag, PollerConfig::default());
        let mut dict = keys(&[DICT_KEY]);
        let mut first_sector_requests = 0u32;

        loop {
            let cmd = poller
                .poll(&mut |event| match event {
                    PollerEvent::RequestMode(req) => req.mode = PollerMode::DictAttackStandard,
                    PollerEvent::RequestKey(req) => {
                        if req.sector == 0 {
                            first_sector_requests += 1;
                        }
                        req.key = dict.next_key();
                    }
                    PollerEvent::NextSector { .. } => dict.rewind(),
                    PollerEvent::CardDetected => {}
                    _ => {}
                })
                .unwrap();
            // Ask to skip before sector 0 ever gets a key attempt.
            poller.request_skip();
            if cmd == PollerCommand::Stop {
                break;
            }
        }
        assert_eq!(first_sector_requests, 0);
        assert_eq!(poller.data().keys_found(), 0);
    }

    /// Weak PRNG with one unresolved key slot: collection takes exactly the
    /// configured nonces and stays on sector 0.
    #[test]
    fn weak_nested_recovers_single_missing_key() {
        let secret_b = 0x0B0B0B0B0B0B;
        let mut tag = SimTag::new(TagSize::Mini, UID, 21);
        // Everything is on dictionary keys except sector 0's key B.
        for sector in 0..5 {
            tag.set_keys(sector, Key::from_u64(DICT_KEY), Key::from_u64(DICT_KEY));
        }
        tag.set_keys(0, Key::from_u64(DICT_KEY), Key::from_u64(secret_b));

        let mut poller = Poller::new(tag, fast_config());
        let mut session = DictAttackSession::new(
            PollerMode::DictAttackEnhanced,
            keys(&[DICT_KEY]),
            keys(&[0x123456789ABC, secret_b, 0xA0A1A2A3A4A5]),
            ProgressModel::default(),
        );
        let summary = session.run(&mut poller).unwrap();

        assert_eq!(summary.outcome, AttackOutcome::Success);
        assert_eq!(summary.keys_found, 10);
        assert_eq!(summary.sectors_read, 5);
        assert_eq!(poller.prng_type(), PrngType::Weak);
        assert_eq!(poller.nested_phase(), NestedPhase::Finished);
        // One target, two nonces: exactly what the configuration asked for.
        assert_eq!(poller.nested_nonce_count(), 2);
        assert!(poller.data().is_key_known(0, KeyType::B));
    }

    /// Full weak-PRNG pipeline: most keys only exist in the nested (system)
    /// dictionary.
    #[test]
    fn weak_nested_cracks_remaining_sectors() {
        let mut tag = SimTag::new(TagSize::Mini, UID, 31);
        let mut secrets = Vec::new();
        for sector in 0..5 {
            let a = 0x0A0000000000 + u64::from(sector);
            let b = 0x0B0000000000 + u64::from(sector);
            secrets.push(a);
            secrets.push(b);
            tag.set_keys(sector, Key::from_u64(a), Key::from_u64(b));
        }
        // The anchor: sector 0 key A is a dictionary key after all.
        tag.set_keys(0, Key::from_u64(DICT_KEY), Key::from_u64(secrets[1]));

        let mut nested_keys = vec![0x111111111111, 0x222222222222];
        nested_keys.extend(&secrets[1..]);

        let mut poller = Poller::new(tag, fast_config());
        let mut session = DictAttackSession::new(
            PollerMode::DictAttackEnhanced,
            keys(&[DICT_KEY]),
            keys(&nested_keys),
            ProgressModel::default(),
        );
        let summary = session.run(&mut poller).unwrap();

        assert_eq!(summary.outcome, AttackOutcome::Success);
        assert_eq!(summary.keys_found, 10);
        assert_eq!(summary.sectors_read, 5);
        assert_eq!(poller.prng_type(), PrngType::Weak);
    }

    /// Hard PRNG path: parity-only filtering with the unique-MSB counter
    /// gating collection.
    #[test]
    fn hard_nested_uses_parity_filter() {
        let secret_b = 0x0DDB1D0DDB1D;
        let mut tag = SimTag::new(TagSize::Mini, UID, 77);
        tag.set_prng(SimPrng::Hard);
        for sector in 0..5 {
            tag.set_keys(sector, Key::from_u64(DICT_KEY), Key::from_u64(DICT_KEY));
        }
        tag.set_keys(0, Key::from_u64(DICT_KEY), Key::from_u64(secret_b));

        let mut poller = Poller::new(tag, fast_config());
        let mut session = DictAttackSession::new(
            PollerMode::DictAttackEnhanced,
            keys(&[DICT_KEY]),
            keys(&[0x999999999999, secret_b]),
            ProgressModel::default(),
        );
        let summary = session.run(&mut poller).unwrap();

        assert_eq!(summary.outcome, AttackOutcome::Success);
        assert_eq!(poller.prng_type(), PrngType::Hard);
        assert!(poller.data().is_key_known(0, KeyType::B));
        // The sufficiency counter is bounded by the byte space.
        assert!(session.view().msb_count <= 256);
    }

    #[test]
    fn absent_card_aborts_eventually() {
        let mut tag = SimTag::new(TagSize::Mini, UID, 3);
        tag.remove();
        let mut poller = Poller::new(tag, PollerConfig::default());
        let mut session = DictAttackSession::new(
            PollerMode::DictAttackStandard,
            keys(&[DICT_KEY]),
            keys(&[]),
            ProgressModel::default(),
        );
        session.max_absent_polls = 8;
        let summary = session.run(&mut poller).unwrap();
        assert_eq!(summary.outcome, AttackOutcome::CardAbsent);
        assert_eq!(summary.keys_found, 0);
    }

    #[test]
    fn unguessable_tag_reports_failure() {
        let mut tag = SimTag::new(TagSize::Mini, UID, 3);
        for sector in 0..5 {
            tag.set_keys(
                sector,
                Key::from_u64(0x600D60D60D60 + u64::from(sector)),
                Key::from_u64(0xBAD0BAD0BAD0 + u64::from(sector)),
            );
        }
        let mut poller = Poller::new(tag, PollerConfig::default());
        let mut session = DictAttackSession::new(
            PollerMode::DictAttackStandard,
            keys(&[DICT_KEY, 0x111111111111]),
            keys(&[]),
            ProgressModel::default(),
        );
        let summary = session.run(&mut poller).unwrap();
        match summary.outcome {
            AttackOutcome::Fail(Error::NoKeyAvailable { .. }) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(summary.keys_found, 0);
        assert_eq!(summary.sectors_read, 0);
    }
}
