//! Nested / hardnested attack state: PRNG classification, timing
//! calibration, nonce records and the offline candidate filter.
//!
//! The poller owns the wire work; this module owns everything the attack
//! remembers between steps and the pure math over it, so the filtering logic
//! stays testable without a tag.

use tracing::debug;

use crate::classic::{Key, KeyType};
use crate::crypto1::{is_weak_nonce, nonce_distance, Crypto1};
use crate::iso14443a::odd_parity8;

/// Where the nested attack currently is. Transitions are monotonic except
/// for the explicit resume re-entry after an interruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NestedPhase {
    #[default]
    None,
    AnalyzePrng,
    DictAttack,
    DictAttackVerify,
    DictAttackResume,
    Calibrate,
    Recalibrate,
    CollectNtEnc,
    Finished,
}

/// PRNG classification; set once per card session, never revised downward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrngType {
    #[default]
    Unknown,
    NoTag,
    Weak,
    Hard,
}

/// Known authentication backdoors, probed once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backdoor {
    #[default]
    Unknown,
    None,
    Auth1,
    Auth2,
    /// Static encrypted nonce variant.
    Auth3,
}

/// The fixed backdoor keys known in the wild, in probe order.
pub(crate) const BACKDOOR_KEYS: [(u64, Backdoor); 3] = [
    (0xA31667A8CEC1, Backdoor::Auth1),
    (0x518B3354E760, Backdoor::Auth2),
    (0xA396EFA4E24F, Backdoor::Auth3),
];

/// Tunables for the nested engine. The defaults match a real tag in a
/// handheld; tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct NestedConfig {
    /// Nonces sampled by the PRNG analysis phase.
    pub analyze_nonces: u8,
    /// Encrypted nonces collected per target for a weak PRNG.
    pub nonces_per_target: u8,
    /// Distance measurements taken during calibration.
    pub calibration_rounds: u8,
    /// Accepted deviation, in PRNG clocks, between calibrated and observed
    /// nonce distance.
    pub distance_tolerance: u16,
    /// Unique most-significant bytes required before hard-PRNG collection
    /// is considered sufficient. Capped at 256.
    pub msb_threshold: u16,
    /// Minimum records per target for the hard-PRNG parity filter.
    pub hard_records_min: u8,
    /// Collections between anchor drift probes (weak PRNG).
    pub drift_check_interval: u8,
}

impl Default for NestedConfig {
    fn default() -> Self {
        Self {
            analyze_nonces: 5,
            nonces_per_target: 2,
            calibration_rounds: 3,
            distance_tolerance: 32,
            msb_threshold: 230,
            hard_records_min: 2,
            drift_check_interval: 8,
        }
    }
}

/// One sector/key-type pair still missing its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Target {
    pub sector: u8,
    pub key_type: KeyType,
}

/// The known-key session used to mount nested authentications.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Anchor {
    pub sector: u8,
    pub key: Key,
    pub key_type: KeyType,
    pub backdoor: bool,
}

/// One harvested encrypted nonce. Meaningful only for the session that
/// produced it; records die with the card.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NonceRecord {
    pub sector: u8,
    pub key_type: KeyType,
    /// Plaintext nonce of the anchoring authentication (weak path).
    pub nt_ref: u32,
    pub nt_enc: u32,
    /// Parity bits of the encrypted nonce as received.
    pub parity: [u8; 4],
    /// Calibrated PRNG distance expected between `nt_ref` and the hidden
    /// plaintext nonce.
    pub dist: u16,
}

/// A dictionary key that survived the offline filter for one target.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub sector: u8,
    pub key_type: KeyType,
    pub key: Key,
}

#[derive(Debug, Default)]
pub(crate) struct NestedState {
    pub phase: NestedPhase,
    pub prng: PrngType,
    pub backdoor: Backdoor,
    pub target_key: u16,
    pub anchor: Option<Anchor>,

    // AnalyzePRNG
    pub analyze_nts: Vec<u32>,
    pub analyze_misses: u8,

    // Calibrate / Recalibrate
    pub calib_samples: Vec<u16>,
    pub calib_misses: u8,
    pub dist: Option<u16>,

    // CollectNtEnc
    pub targets: Vec<Target>,
    pub target_idx: usize,
    pub nonces_for_target: u8,
    pub since_drift_check: u8,
    pub records: Vec<NonceRecord>,
    msb_seen: [u64; 4],
    pub msb_count: u16,

    // DictAttack / Verify
    pub candidates: Vec<Candidate>,
    pub candidate_cursor: usize,
}

impl NestedState {
    /// Classification is sticky: once weak or hard, it stays.
    pub fn classify(&mut self, prng: PrngType) {
        if matches!(self.prng, PrngType::Weak | PrngType::Hard) {
            return;
        }
        debug!(?prng, "PRNG classified");
        self.prng = prng;
    }

    pub fn current_target(&self) -> Option<Target> {
        self.targets.get(self.target_idx).copied()
    }

    /// Moves to the next target, resetting the per-target accounting.
    pub fn advance_target(&mut self) {
        self.target_idx += 1;
        self.nonces_for_target = 0;
        self.msb_seen = [0; 4];
        self.msb_count = 0;
    }

    /// Tracks a unique-MSB observation for the hardnested sufficiency
    /// counter. Returns true if the byte was new. Count never exceeds 256.
    pub fn note_msb(&mut self, nt_enc: u32) -> bool {
        let msb = (nt_enc >> 24) as u8;
        let (word, bit) = ((msb / 64) as usize, msb % 64);
        if self.msb_seen[word] >> bit & 1 == 1 {
            return false;
        }
        self.msb_seen[word] |= 1 << bit;
        self.msb_count += 1;
        true
    }

    /// The §view's target-key counter for a collection attempt. Weak targets
    /// advance per nonce (four steps per sector), hard per key slot.
    pub fn collect_target_key(&self, target: Target, attempt: u8) -> u16 {
        match self.prng {
            PrngType::Weak => {
                u16::from(target.sector) * 4 + u16::from(target.key_type.index()) * 2
                    + u16::from(attempt.min(1))
            }
            _ => u16::from(target.sector) * 2 + u16::from(target.key_type.index()),
        }
    }

    /// The target-key counter during the dictionary filter and verify
    /// phases: half-sector granularity for weak, sixteenths for hard.
    pub fn dict_target_key(&self, target: Target) -> u16 {
        match self.prng {
            PrngType::Weak => u16::from(target.sector) * 2 + u16::from(target.key_type.index()),
            _ => u16::from(target.sector) * 16 + u16::from(target.key_type.index()) * 8,
        }
    }

    /// Median of the calibration samples, if enough were gathered.
    pub fn calibrated_distance(&mut self) -> Option<u16> {
        if self.calib_samples.is_empty() {
            return None;
        }
        self.calib_samples.sort_unstable();
        Some(self.calib_samples[self.calib_samples.len() / 2])
    }

    pub fn records_for(&self, target: Target) -> impl Iterator<Item = &NonceRecord> {
        self.records
            .iter()
            .filter(move |r| r.sector == target.sector && r.key_type == target.key_type)
    }

    /// Offline filter: does `key` explain every nonce collected for this
    /// target? Weak PRNGs let us demand the decrypted nonce be on-orbit and
    /// inside the calibrated window; hard PRNGs only expose parity, so the
    /// verdict needs several records to mean anything.
    pub fn key_matches_target(
        &self,
        key: Key,
        uid: u32,
        target: Target,
        config: &NestedConfig,
    ) -> bool {
        let mut records = 0u8;
        for rec in self.records_for(target) {
            if !key_matches_record(key, uid, rec, self.prng, config.distance_tolerance) {
                return false;
            }
            records += 1;
        }
        match self.prng {
            PrngType::Weak => records > 0,
            _ => records >= config.hard_records_min,
        }
    }
}

/// Decrypts an encrypted tag nonce under a candidate key, returning the
/// would-be plaintext nonce and the keystream bits that covered its parity.
fn decrypt_nt(key: Key, uid: u32, nt_enc: u32) -> (u32, [u8; 4]) {
    let mut cipher = Crypto1::new(key.to_u64());
    let xored = (nt_enc ^ uid).to_be_bytes();
    let enc = nt_enc.to_be_bytes();
    let mut nt = [0u8; 4];
    let mut ks_parity = [0u8; 4];
    for i in 0..4 {
        let ks = cipher.byte(xored[i], true);
        nt[i] = ks ^ enc[i];
        ks_parity[i] = cipher.peek_bit();
    }
    (u32::from_be_bytes(nt), ks_parity)
}

/// One record's worth of keystream-equation checking for one candidate key.
pub(crate) fn key_matches_record(
    key: Key,
    uid: u32,
    rec: &NonceRecord,
    prng: PrngType,
    tolerance: u16,
) -> bool {
    let (nt, ks_parity) = decrypt_nt(key, uid, rec.nt_enc);

    // The tag transmits each nonce byte's odd parity encrypted with the
    // following keystream bit; a wrong key almost never reproduces all four.
    let nt_bytes = nt.to_be_bytes();
    for i in 0..4 {
        if rec.parity[i] & 1 != odd_parity8(nt_bytes[i]) ^ ks_parity[i] {
            return false;
        }
    }

    match prng {
        PrngType::Weak => {
            if !is_weak_nonce(nt) {
                return false;
            }
            // The plaintext nonce must land inside the calibrated window
            // around the anchor nonce.
            match nonce_distance(rec.nt_ref, nt) {
                Some(d) => {
                    let lo = rec.dist.saturating_sub(tolerance);
                    let hi = rec.dist.saturating_add(tolerance);
                    d >= lo && d <= hi
                }
                None => false,
            }
        }
        _ => true,
    }
}

/// Builds the nonce record a tag keyed with `key` would produce, for tests
/// and the calibration self-check.
#[cfg(test)]
pub(crate) fn forge_record(
    key: Key,
    uid: u32,
    nt: u32,
    nt_ref: u32,
    dist: u16,
    target: Target,
) -> NonceRecord {
    let mut cipher = Crypto1::new(key.to_u64());
    let xored = (uid ^ nt).to_be_bytes();
    let nt_bytes = nt.to_be_bytes();
    let mut enc = [0u8; 4];
    let mut parity = [0u8; 4];
    for i in 0..4 {
        let ks = cipher.byte(xored[i], false);
        enc[i] = ks ^ nt_bytes[i];
        parity[i] = odd_parity8(nt_bytes[i]) ^ cipher.peek_bit();
    }
    NonceRecord {
        sector: target.sector,
        key_type: target.key_type,
        nt_ref,
        nt_enc: u32::from_be_bytes(enc),
        parity,
        dist,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto1::{prng_successor, weak_nonce_from_state};

    const UID: u32 = 0x1EE7C0DE;

    fn target() -> Target {
        Target { sector: 2, key_type: KeyType::B }
    }

    fn weak_record(key: Key, dist: u16) -> NonceRecord {
        let nt_ref = weak_nonce_from_state(0x4242);
        let nt = prng_successor(nt_ref, u32::from(dist));
        forge_record(key, UID, nt, nt_ref, dist, target())
    }

    #[test]
    fn classification_is_sticky() {
        let mut state = NestedState::default();
        state.classify(PrngType::Weak);
        state.classify(PrngType::Hard);
        assert_eq!(state.prng, PrngType::Weak);

        let mut state = NestedState::default();
        state.classify(PrngType::NoTag);
        state.classify(PrngType::Hard);
        assert_eq!(state.prng, PrngType::Hard);
    }

    #[test]
    fn msb_counter_tracks_unique_bytes() {
        let mut state = NestedState::default();
        assert!(state.note_msb(0xAA00_0000));
        assert!(!state.note_msb(0xAA11_2233));
        assert!(state.note_msb(0xBB00_0000));
        assert_eq!(state.msb_count, 2);

        for b in 0..=255u32 {
            state.note_msb(b << 24);
        }
        assert_eq!(state.msb_count, 256);
    }

    #[test]
    fn right_key_matches_its_own_record() {
        let key = Key::from_u64(0x4D3A99C351DD);
        let rec = weak_record(key, 120);
        assert!(key_matches_record(key, UID, &rec, PrngType::Weak, 16));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let key = Key::from_u64(0x4D3A99C351DD);
        let rec = weak_record(key, 120);
        for wrong in [0u64, 0xFFFFFFFFFFFF, 0x4D3A99C351DE, 0xA0A1A2A3A4A5] {
            assert!(!key_matches_record(
                Key::from_u64(wrong),
                UID,
                &rec,
                PrngType::Weak,
                16
            ));
        }
    }

    #[test]
    fn out_of_window_nonce_is_rejected() {
        let key = Key::from_u64(0x112233445566);
        // Record claims a calibrated distance of 100, but the nonce really
        // sat 500 clocks out.
        let nt_ref = weak_nonce_from_state(0x1001);
        let nt = prng_successor(nt_ref, 500);
        let rec = forge_record(key, UID, nt, nt_ref, 100, target());
        assert!(!key_matches_record(key, UID, &rec, PrngType::Weak, 32));
        // A generous window lets the same record through.
        assert!(key_matches_record(key, UID, &rec, PrngType::Weak, 400));
    }

    #[test]
    fn hard_filter_needs_multiple_records() {
        let key = Key::from_u64(0xDEAD00BEEF00);
        let config = NestedConfig { hard_records_min: 2, ..Default::default() };
        let mut state = NestedState::default();
        state.classify(PrngType::Hard);

        // Hard nonces: arbitrary, off-orbit.
        state.records.push(forge_record(key, UID, 0x13371337, 0, 0, target()));
        assert!(!state.key_matches_target(key, UID, target(), &config));

        state.records.push(forge_record(key, UID, 0xCAFED00D, 0, 0, target()));
        assert!(state.key_matches_target(key, UID, target(), &config));
    }

    #[test]
    fn target_key_divisor_inputs() {
        let mut state = NestedState::default();
        state.classify(PrngType::Weak);
        let t = Target { sector: 3, key_type: KeyType::B };
        // Weak collection advances per nonce: sector*4 + type*2 + attempt.
        assert_eq!(state.collect_target_key(t, 0), 14);
        assert_eq!(state.collect_target_key(t, 1), 15);
        // Weak dictionary phase is half-sector granular.
        assert_eq!(state.dict_target_key(t), 7);

        let mut state = NestedState::default();
        state.classify(PrngType::Hard);
        assert_eq!(state.collect_target_key(t, 0), 7);
        assert_eq!(state.dict_target_key(t), 56);
    }

    #[test]
    fn calibration_takes_median() {
        let mut state = NestedState::default();
        state.calib_samples = vec![140, 600, 120];
        assert_eq!(state.calibrated_distance(), Some(140));
        state.calib_samples.clear();
        assert_eq!(state.calibrated_distance(), None);
    }
}
