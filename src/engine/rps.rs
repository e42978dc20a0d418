//! The rock/paper/scissors rotation.
//!
//! A helper carries up to three generation directories with fixed names.
//! Updater and booter share no pointer; both derive the active directory
//! purely from which names exist:
//!
//! | present        | current | next (staging) | previous (reaped) |
//! |----------------|---------|----------------|-------------------|
//! | none           | R       | R (fresh)      | S                 |
//! | one            | it      | its successor  | the third         |
//! | two, missing M | succ(M) | M              | the remaining one |
//! | all three      | R (warn)| P              | S                 |
//!
//! Staging lands in `next`. When `next` is the current slot's successor,
//! the old active must be rotated out of the way (renamed into the
//! `previous` slot) or the presence rule would keep selecting it; when
//! staging filled the gap two slots ahead, reaping `previous` alone moves
//! the selection. Either way the reap leaves a set whose rule picks the
//! freshly staged directory.

use std::fmt;

use strum_macros::EnumIter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum RpsSlot {
    R,
    P,
    S,
}

impl RpsSlot {
    pub const ALL: [RpsSlot; 3] = [RpsSlot::R, RpsSlot::P, RpsSlot::S];

    pub fn dir_name(&self) -> &'static str {
        match self {
            RpsSlot::R => bosun_api::constants::RPS_DIR_R,
            RpsSlot::P => bosun_api::constants::RPS_DIR_P,
            RpsSlot::S => bosun_api::constants::RPS_DIR_S,
        }
    }

    /// Rotation order is the cyclic permutation (R, P, S).
    pub fn successor(&self) -> RpsSlot {
        match self {
            RpsSlot::R => RpsSlot::P,
            RpsSlot::P => RpsSlot::S,
            RpsSlot::S => RpsSlot::R,
        }
    }
}

impl fmt::Display for RpsSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// The roles the three slots play for one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpsPlan {
    pub current: RpsSlot,
    pub next: RpsSlot,
    pub previous: RpsSlot,

    /// Where new content is written: `next`, except on a virgin helper
    /// where content goes straight into `current`.
    pub staged: RpsSlot,

    /// All three slots were present; the selection fell back to R.
    pub degenerate: bool,
}

impl RpsPlan {
    /// Derives the plan from which slots exist, `present` indexed in
    /// R, P, S order.
    pub fn select(present: [bool; 3]) -> RpsPlan {
        let count = present.iter().filter(|p| **p).count();
        let (current, next, previous, degenerate) = match count {
            0 => (RpsSlot::R, RpsSlot::P, RpsSlot::S, false),
            1 => {
                let current = RpsSlot::ALL[present.iter().position(|p| *p).unwrap()];
                let next = current.successor();
                (current, next, next.successor(), false)
            }
            2 => {
                let missing = RpsSlot::ALL[present.iter().position(|p| !*p).unwrap()];
                let current = missing.successor();
                (current, missing, current.successor(), false)
            }
            _ => (RpsSlot::R, RpsSlot::P, RpsSlot::S, true),
        };
        let staged = if count == 0 { current } else { next };
        RpsPlan {
            current,
            next,
            previous,
            staged,
            degenerate,
        }
    }

    /// Whether activation must rotate the old active directory into the
    /// previous slot before the reap can hand selection to the staged one.
    pub fn needs_rotation(&self) -> bool {
        self.staged != self.current && self.staged == self.current.successor()
    }

    /// The slot the presence rule selects for a set of present slots;
    /// this is the booter's view of "active".
    pub fn active_of(present: [bool; 3]) -> Option<RpsSlot> {
        match present.iter().filter(|p| **p).count() {
            0 => None,
            _ => Some(RpsPlan::select(present).current),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use super::RpsSlot::{P, R, S};

    fn plan(present: [bool; 3]) -> RpsPlan {
        RpsPlan::select(present)
    }

    #[test]
    fn test_empty_helper_begins_at_r() {
        let p = plan([false, false, false]);
        assert_eq!((p.current, p.next, p.previous), (R, P, S));
        assert_eq!(p.staged, R);
        assert!(!p.needs_rotation());
        assert!(!p.degenerate);
    }

    #[test]
    fn test_single_slot_rotates_forward() {
        let p = plan([true, false, false]);
        assert_eq!((p.current, p.next, p.previous), (R, P, S));
        assert_eq!(p.staged, P);
        assert!(p.needs_rotation());

        let p = plan([false, true, false]);
        assert_eq!((p.current, p.next, p.previous), (P, S, R));
        assert!(p.needs_rotation());

        let p = plan([false, false, true]);
        assert_eq!((p.current, p.next, p.previous), (S, R, P));
        assert!(p.needs_rotation());
    }

    #[test]
    fn test_two_slots_fill_the_gap() {
        // R and P present: S is the hole, R is active, P gets reaped.
        let p = plan([true, true, false]);
        assert_eq!((p.current, p.next, p.previous), (R, S, P));
        assert_eq!(p.staged, S);
        assert!(!p.needs_rotation());

        // R and S present: S is active (P missing, succ(P) = S).
        let p = plan([true, false, true]);
        assert_eq!((p.current, p.next, p.previous), (S, P, R));
        assert!(!p.needs_rotation());

        // P and S present: P is active.
        let p = plan([false, true, true]);
        assert_eq!((p.current, p.next, p.previous), (P, R, S));
        assert!(!p.needs_rotation());
    }

    #[test]
    fn test_all_three_falls_back_to_r() {
        let p = plan([true, true, true]);
        assert_eq!((p.current, p.next, p.previous), (R, P, S));
        assert_eq!(p.staged, P);
        assert!(p.degenerate);
        assert!(p.needs_rotation());
    }

    #[test]
    fn test_post_update_selection_lands_on_staged() {
        // For every starting set, simulate: stage into `staged`, rotate if
        // needed, reap `previous`; the presence rule must then select the
        // staged slot.
        for bits in 0..8u8 {
            let before = [bits & 1 != 0, bits & 2 != 0, bits & 4 != 0];
            let p = plan(before);

            let mut after = before;
            after[p.staged as usize] = true;
            if p.needs_rotation() {
                // Old active moves into the previous slot.
                after[p.current as usize] = false;
                after[p.previous as usize] = true;
            }
            after[p.previous as usize] = false;

            assert_eq!(
                RpsPlan::active_of(after),
                Some(p.staged),
                "presence {before:?} activated the wrong slot"
            );

            // And the active name changed unless the helper was virgin.
            if before.iter().any(|b| *b) {
                assert_ne!(RpsPlan::active_of(before), RpsPlan::active_of(after));
            }
        }
    }
}
