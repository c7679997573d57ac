//! Bit layout of the per-object lock word.
//!
//! ```text
//!  usize::BITS-1                 FAT_SHIFT+1   FAT_SHIFT   0
//! +-----------------------------+-------------+-----------+
//! |  owner (thread id / index)  |     fat     | recursion |
//! +-----------------------------+-------------+-----------+
//! ```
//!
//! While the fat bit is clear the owner field holds the id of the thread that
//! holds the lock and `recursion` counts holds beyond the first. Once the fat bit
//! is set the owner field is an index into the inflated monitor table and the
//! recursion field is unused. The all-zero word is the unlocked state.
//!
//! Everything here is pure bit arithmetic.

use std::fmt;

use easy_bitfield::{BitField, BitFieldTrait};

use crate::threading::ThreadId;

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        pub const RECURSION_BITS: usize = 8;
    } else {
        pub const RECURSION_BITS: usize = 5;
    }
}

pub const OWNER_BITS: usize = usize::BITS as usize - RECURSION_BITS - 1;

pub type RecursionField = BitField<usize, usize, 0, RECURSION_BITS, false>;
pub type FatField = BitField<usize, bool, { RecursionField::NEXT_BIT }, 1, false>;
pub type OwnerField = BitField<usize, usize, { FatField::NEXT_BIT }, OWNER_BITS, false>;

pub const FAT_SHIFT: usize = RecursionField::NEXT_BIT;
pub const OWNER_SHIFT: usize = FatField::NEXT_BIT;

/// One nested hold.
pub const RECURSION_UNIT: usize = 1;
pub const RECURSION_MASK: usize = (1 << RECURSION_BITS) - 1;
/// Largest recursion count a thin word can carry. A thin owner sitting at the
/// bound inflates on its next enter.
pub const RECURSION_BOUND: usize = RECURSION_MASK;
pub const FAT_MASK: usize = 1 << FAT_SHIFT;
pub const OWNER_MASK: usize = !(RECURSION_MASK | FAT_MASK);
/// Owner and state bits, the part compared by the XOR check.
pub const HIGH_MASK: usize = OWNER_MASK | FAT_MASK;
/// Largest value that fits in the owner field.
pub const MAX_OWNER: usize = OWNER_MASK >> OWNER_SHIFT;

/// Shift a thread id into the owner bits.
#[inline(always)]
pub fn encode_owner(thread: ThreadId) -> usize {
    OwnerField::encode(thread.as_usize())
}

/// XOR the word with the caller's encoded id and check that no owner or fat bit
/// survives.
///
/// Thread ids are never zero, so on an unlocked word the caller's id survives the
/// XOR. The check therefore passes only when the word is thin and owned by
/// `thread`. A free word is caught by [`has_no_locks`] instead. A single XOR
/// replaces separate "is thin" and "is mine" tests.
#[inline(always)]
pub fn is_unlocked_or_self(word: usize, thread: ThreadId) -> bool {
    (encode_owner(thread) ^ word) & HIGH_MASK == 0
}

/// Only meaningful for words that passed [`is_fast_path_eligible`].
#[inline(always)]
pub fn with_incremented_recursion(word: usize) -> usize {
    debug_assert!(is_fast_path_eligible(word));
    word + RECURSION_UNIT
}

/// Only meaningful for thin words with a non-zero recursion count.
#[inline(always)]
pub fn with_decremented_recursion(word: usize) -> usize {
    debug_assert!(!is_fat(word) && recursion(word) > 0);
    word - RECURSION_UNIT
}

#[inline(always)]
pub fn is_fast_path_eligible(word: usize) -> bool {
    word & FAT_MASK == 0 && RecursionField::decode(word) < RECURSION_BOUND
}

/// No owner, no fat monitor, no holds: the word of an object nobody holds.
#[inline(always)]
pub fn has_no_locks(word: usize) -> bool {
    word & (OWNER_MASK | FAT_MASK | RECURSION_MASK) == 0
}

#[inline(always)]
pub fn is_fat(word: usize) -> bool {
    FatField::decode(word)
}

#[inline(always)]
pub fn recursion(word: usize) -> usize {
    RecursionField::decode(word)
}

/// Thin owner of `word`, if any. Returns `None` for unlocked and fat words.
pub fn owner(word: usize) -> Option<ThreadId> {
    if is_fat(word) {
        return None;
    }
    ThreadId::from_usize(OwnerField::decode(word))
}

/// Fat word pointing at inflated monitor `index`.
pub fn encode_fat(index: usize) -> usize {
    debug_assert!(index <= MAX_OWNER, "monitor index {index} overflows the owner field");
    FatField::update(true, OwnerField::encode(index))
}

pub fn fat_index(word: usize) -> usize {
    debug_assert!(is_fat(word));
    OwnerField::decode(word)
}

/// Number of holds a thin word represents. Zero for an unlocked word.
pub fn thin_hold_count(word: usize) -> usize {
    if has_no_locks(word) {
        0
    } else {
        recursion(word) + 1
    }
}

/// Logical state of a lock word as seen by one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Nobody holds the object.
    Unlocked,
    /// The observing thread holds the lock exactly once, through the reservation CAS.
    Reserved,
    /// The observing thread holds the lock more than once.
    ThinOwnedBySelf,
    /// Some other thread holds the lock thin.
    ThinOwnedByOther,
    /// The lock has been inflated; ownership lives in the fat monitor.
    Fat,
}

impl LockState {
    pub fn of(word: usize, observer: ThreadId) -> Self {
        if has_no_locks(word) {
            LockState::Unlocked
        } else if is_fat(word) {
            LockState::Fat
        } else if is_unlocked_or_self(word, observer) {
            if recursion(word) == 0 {
                LockState::Reserved
            } else {
                LockState::ThinOwnedBySelf
            }
        } else {
            LockState::ThinOwnedByOther
        }
    }
}

/// Debug view of a raw lock word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LockWord(pub usize);

impl fmt::Debug for LockWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = self.0;
        if has_no_locks(word) {
            write!(f, "LockWord(unlocked)")
        } else if is_fat(word) {
            write!(f, "LockWord(fat #{})", fat_index(word))
        } else {
            write!(
                f,
                "LockWord(thin owner={} recursion={})",
                OwnerField::decode(word),
                recursion(word)
            )
        }
    }
}
