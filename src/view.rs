//! The presentation boundary.
//!
//! The core pushes plain setter calls into a [`DictAttackView`] and reads a
//! single skip signal back; it never formats anything itself. The progress
//! math (including the phase-dependent divisors and the "show 1 instead of
//! 0" nicety) lives here, in [`ProgressModel`], so the attack code stays
//! free of display rules.

use crate::poller::{Backdoor, NestedPhase, PrngType};

/// Setter-style progress sink, mirroring what a screen widget needs. All
/// methods have defaults so a view only implements what it renders.
pub trait DictAttackView {
    fn set_header(&mut self, _header: &str) {}
    fn set_card_detected(&mut self, _detected: bool) {}
    fn set_sectors_total(&mut self, _total: u8) {}
    fn set_sectors_read(&mut self, _read: u8) {}
    fn set_keys_found(&mut self, _found: u8) {}
    fn set_current_sector(&mut self, _sector: u8) {}
    fn set_dict_keys_total(&mut self, _total: usize) {}
    fn set_dict_keys_current(&mut self, _current: usize) {}
    fn set_key_attack(&mut self, _sector: u8) {}
    fn reset_key_attack(&mut self) {}
    fn set_nested_phase(&mut self, _phase: NestedPhase) {}
    fn set_prng_type(&mut self, _prng: PrngType) {}
    fn set_backdoor(&mut self, _backdoor: Backdoor) {}
    fn set_nested_target_key(&mut self, _target_key: u16) {}
    fn set_msb_count(&mut self, _count: u16) {}
    fn reset(&mut self) {}

    /// Polled by the session once per step; true requests a skip.
    fn skip_requested(&mut self) -> bool {
        false
    }
}

/// A view that renders nothing. Useful headless.
#[derive(Debug, Default)]
pub struct NullView;

impl DictAttackView for NullView {}

/// A complete view model with the derivation rules of the handheld UI.
/// Renderers own one, feed it through the trait, and pull strings/ratios.
#[derive(Debug, Clone, Default)]
pub struct ProgressModel {
    pub header: String,
    pub card_detected: bool,
    pub sectors_total: u8,
    pub sectors_read: u8,
    pub current_sector: u8,
    pub keys_found: u8,
    pub dict_keys_total: usize,
    pub dict_keys_current: usize,
    pub is_key_attack: bool,
    pub key_attack_sector: u8,
    pub nested_phase: NestedPhase,
    pub prng_type: PrngType,
    pub backdoor: Backdoor,
    pub nested_target_key: u16,
    pub msb_count: u16,
    pub skip: bool,
}

impl ProgressModel {
    /// Header line: phase name, with hard/backdoor qualifiers.
    pub fn header_line(&self) -> String {
        let mut header = match self.nested_phase {
            NestedPhase::AnalyzePrng => "PRNG Analysis".to_string(),
            NestedPhase::DictAttack
            | NestedPhase::DictAttackVerify
            | NestedPhase::DictAttackResume => "Nested Dictionary".to_string(),
            NestedPhase::Calibrate | NestedPhase::Recalibrate => "Calibration".to_string(),
            NestedPhase::CollectNtEnc => "Nonce Collection".to_string(),
            _ => self.header.clone(),
        };
        if self.prng_type == PrngType::Hard && self.nested_phase != NestedPhase::None {
            header.push_str(" (Hard)");
        }
        if !matches!(self.backdoor, Backdoor::None | Backdoor::Unknown) {
            if self.nested_phase != NestedPhase::None {
                header.push_str(" (Backdoor)");
            } else {
                header = "Backdoor Read".to_string();
            }
        }
        header
    }

    /// Second line: what the attack is currently grinding on.
    pub fn status_line(&self) -> String {
        if self.nested_phase == NestedPhase::CollectNtEnc {
            let divisor = if self.prng_type == PrngType::Weak { 4 } else { 2 };
            format!("Collecting from sector: {}", self.nested_target_key / divisor)
        } else if self.is_key_attack {
            format!("Reuse key check for sector: {}", self.key_attack_sector)
        } else {
            format!("Unlocking sector: {}", self.current_sector)
        }
    }

    /// Progress ratio in [0,1] plus its "current/total" label, using the
    /// phase-dependent divisors of the original tool.
    pub fn progress(&self) -> (f32, String) {
        let (ratio, label) = match self.nested_phase {
            NestedPhase::AnalyzePrng
            | NestedPhase::DictAttack
            | NestedPhase::DictAttackVerify
            | NestedPhase::DictAttackResume => {
                let divisor = if self.prng_type == PrngType::Weak { 2 } else { 16 };
                let target_sector = self.nested_target_key / divisor;
                (
                    ratio(target_sector as usize, self.sectors_total as usize),
                    format!("{}/{}", target_sector, self.sectors_total),
                )
            }
            NestedPhase::Calibrate | NestedPhase::Recalibrate | NestedPhase::CollectNtEnc => {
                if self.prng_type == PrngType::Weak {
                    let target_sector = self.nested_target_key / 4;
                    (
                        ratio(target_sector as usize, self.sectors_total as usize),
                        format!("{}/{}", target_sector, self.sectors_total),
                    )
                } else {
                    (
                        ratio(self.msb_count as usize, 256),
                        format!("{}/{}", self.msb_count, 256),
                    )
                }
            }
            _ => {
                let shown = if self.dict_keys_current == 0 {
                    // People read 0/N as "broken"; show 1/N until the first
                    // result lands. Display only; the counters stay exact.
                    1
                } else {
                    self.dict_keys_current
                };
                (
                    ratio(self.dict_keys_current, self.dict_keys_total),
                    format!("{}/{}", shown, self.dict_keys_total),
                )
            }
        };
        (ratio.clamp(0.0, 1.0), label)
    }

    pub fn keys_line(&self) -> String {
        format!(
            "Keys found: {}/{}",
            self.keys_found,
            u16::from(self.sectors_total) * u16::from(crate::classic::KEYS_PER_SECTOR)
        )
    }

    pub fn sectors_line(&self) -> String {
        format!("Sectors read: {}/{}", self.sectors_read, self.sectors_total)
    }
}

fn ratio(current: usize, total: usize) -> f32 {
    if total == 0 {
        0.0
    } else {
        current as f32 / total as f32
    }
}

impl DictAttackView for ProgressModel {
    fn set_header(&mut self, header: &str) {
        self.header = header.to_string();
    }
    fn set_card_detected(&mut self, detected: bool) {
        self.card_detected = detected;
    }
    fn set_sectors_total(&mut self, total: u8) {
        self.sectors_total = total;
    }
    fn set_sectors_read(&mut self, read: u8) {
        self.sectors_read = read;
    }
    fn set_keys_found(&mut self, found: u8) {
        self.keys_found = found;
    }
    fn set_current_sector(&mut self, sector: u8) {
        self.current_sector = sector;
    }
    fn set_dict_keys_total(&mut self, total: usize) {
        self.dict_keys_total = total;
    }
    fn set_dict_keys_current(&mut self, current: usize) {
        self.dict_keys_current = current;
    }
    fn set_key_attack(&mut self, sector: u8) {
        self.is_key_attack = true;
        self.key_attack_sector = sector;
    }
    fn reset_key_attack(&mut self) {
        self.is_key_attack = false;
    }
    fn set_nested_phase(&mut self, phase: NestedPhase) {
        self.nested_phase = phase;
    }
    fn set_prng_type(&mut self, prng: PrngType) {
        self.prng_type = prng;
    }
    fn set_backdoor(&mut self, backdoor: Backdoor) {
        self.backdoor = backdoor;
    }
    fn set_nested_target_key(&mut self, target_key: u16) {
        self.nested_target_key = target_key;
    }
    fn set_msb_count(&mut self, count: u16) {
        self.msb_count = count;
    }
    fn reset(&mut self) {
        *self = ProgressModel::default();
    }
    fn skip_requested(&mut self) -> bool {
        std::mem::take(&mut self.skip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_progress_and_cosmetic_one() {
        let mut model = ProgressModel { dict_keys_total: 100, ..Default::default() };
        let (ratio, label) = model.progress();
        assert_eq!(ratio, 0.0);
        // Zero tried shows as 1/N, but the ratio stays honest.
        assert_eq!(label, "1/100");

        model.dict_keys_current = 41;
        let (ratio, label) = model.progress();
        assert!((ratio - 0.41).abs() < 1e-6);
        assert_eq!(label, "41/100");
    }

    #[test]
    fn weak_dict_attack_divides_by_two() {
        let model = ProgressModel {
            nested_phase: NestedPhase::DictAttack,
            prng_type: PrngType::Weak,
            nested_target_key: 14,
            sectors_total: 16,
            ..Default::default()
        };
        let (ratio, label) = model.progress();
        assert_eq!(label, "7/16");
        assert!((ratio - 7.0 / 16.0).abs() < 1e-6);
    }

    #[test]
    fn hard_dict_attack_divides_by_sixteen() {
        let model = ProgressModel {
            nested_phase: NestedPhase::DictAttackVerify,
            prng_type: PrngType::Hard,
            nested_target_key: 48,
            sectors_total: 16,
            ..Default::default()
        };
        let (_, label) = model.progress();
        assert_eq!(label, "3/16");
    }

    #[test]
    fn weak_collection_divides_by_four() {
        let model = ProgressModel {
            nested_phase: NestedPhase::CollectNtEnc,
            prng_type: PrngType::Weak,
            nested_target_key: 13,
            sectors_total: 16,
            ..Default::default()
        };
        let (_, label) = model.progress();
        assert_eq!(label, "3/16");
        assert_eq!(model.status_line(), "Collecting from sector: 3");
    }

    #[test]
    fn hard_collection_counts_msbs() {
        let model = ProgressModel {
            nested_phase: NestedPhase::CollectNtEnc,
            prng_type: PrngType::Hard,
            msb_count: 128,
            sectors_total: 16,
            ..Default::default()
        };
        let (ratio, label) = model.progress();
        assert_eq!(label, "128/256");
        assert!((ratio - 0.5).abs() < 1e-6);
    }

    #[test]
    fn ratio_is_clamped() {
        let model = ProgressModel {
            nested_phase: NestedPhase::DictAttack,
            prng_type: PrngType::Weak,
            nested_target_key: 64,
            sectors_total: 16,
            ..Default::default()
        };
        let (ratio, _) = model.progress();
        assert_eq!(ratio, 1.0);
    }

    #[test]
    fn headers_follow_phase() {
        let mut model = ProgressModel {
            nested_phase: NestedPhase::CollectNtEnc,
            prng_type: PrngType::Hard,
            ..Default::default()
        };
        assert_eq!(model.header_line(), "Nonce Collection (Hard)");

        model.nested_phase = NestedPhase::DictAttackResume;
        model.prng_type = PrngType::Weak;
        assert_eq!(model.header_line(), "Nested Dictionary");

        model.backdoor = Backdoor::Auth3;
        assert_eq!(model.header_line(), "Nested Dictionary (Backdoor)");

        model.nested_phase = NestedPhase::None;
        assert_eq!(model.header_line(), "Backdoor Read");
    }

    #[test]
    fn skip_is_one_shot() {
        let mut model = ProgressModel { skip: true, ..Default::default() };
        assert!(model.skip_requested());
        assert!(!model.skip_requested());
    }
}
