//! Small fixed-size signal bitset used for `pending_signals`, `sig_dont_pass`
//! and `sig_dont_stop` (spec §3). Signals are numbered 1..=64 as on Linux.

use bit_field::BitField;

#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct SignalSet(u64);

impl SignalSet {
    pub fn new() -> SignalSet {
        SignalSet(0)
    }

    fn bit(sig: i32) -> usize {
        debug_assert!(sig >= 1 && sig <= 64, "signal {} out of range", sig);
        (sig - 1) as usize
    }

    pub fn set(&mut self, sig: i32, value: bool) {
        self.0.set_bit(Self::bit(sig), value);
    }

    pub fn get(&self, sig: i32) -> bool {
        self.0.get_bit(Self::bit(sig))
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// First set signal not present in `other`, used to pick the
    /// pass-through signal on resume (spec §5 step 4).
    pub fn first_not_in(&self, other: &SignalSet) -> Option<i32> {
        for sig in 1..=64 {
            if self.get(sig) && !other.get(sig) {
                return Some(sig);
            }
        }
        None
    }

    pub fn clear(&mut self, sig: i32) {
        self.set(sig, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_roundtrip() {
        let mut s = SignalSet::new();
        assert!(!s.get(5));
        s.set(5, true);
        assert!(s.get(5));
        s.clear(5);
        assert!(!s.get(5));
    }

    #[test]
    fn first_not_in_skips_excluded() {
        let mut pending = SignalSet::new();
        pending.set(17, true);
        pending.set(2, true);
        let mut dont_pass = SignalSet::new();
        dont_pass.set(2, true);
        assert_eq!(pending.first_not_in(&dont_pass), Some(17));
    }

    #[test]
    fn first_not_in_none_when_all_excluded() {
        let mut pending = SignalSet::new();
        pending.set(9, true);
        let mut dont_pass = SignalSet::new();
        dont_pass.set(9, true);
        assert_eq!(pending.first_not_in(&dont_pass), None);
    }
}
