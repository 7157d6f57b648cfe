//! Sequence number bookkeeping shared by the consensus, view-change
//! and state-transfer sub-protocols.

use std::cmp::{Ordering, PartialEq, PartialOrd};
use std::ops::Add;

use either::{Either, Left, Right};

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

/// Implemented by any value that carries a consensus sequence number,
/// such as a stored message or a local checkpoint.
pub trait Orderable {
    /// Returns the sequence number associated with `self`.
    fn sequence_number(&self) -> SeqNo;
}

/// Represents a sequence number attributed by the primary to a batch
/// of client requests during a consensus instance, or to a view.
///
/// Wraps on overflow rather than panicking; the protocol never expects
/// to run long enough in a single process for this to matter in
/// practice, but malicious peers may try to force an overflow, so all
/// arithmetic here is explicitly checked against that.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Ord, Eq, PartialEq, Hash)]
pub struct SeqNo(i32);

pub(crate) enum InvalidSeqNo {
    Small,
    Big,
}

impl SeqNo {
    /// The first sequence number of a fresh replica.
    pub const ZERO: SeqNo = SeqNo(0);

    /// Maximum distance, in either direction, that two `SeqNo` values
    /// may be apart from each other and still be considered orderable
    /// without risking an overflow false positive.
    const OVERFLOW_THRES_POS: i32 = 10_000_000;
    const OVERFLOW_THRES_NEG: i32 = -Self::OVERFLOW_THRES_POS;

    /// Upper bound on how far ahead of a base sequence number another
    /// may be and still be queued, rather than dropped outright; guards
    /// against a faulty or malicious peer inflating a replica's queues.
    pub const DROP_SEQNO_THRES: i32 = 100_000;

    /// Returns the following sequence number.
    #[inline]
    pub fn next(self) -> SeqNo {
        let (next, overflow) = (self.0).overflowing_add(1);
        SeqNo(if overflow { 0 } else { next })
    }

    /// Returns the preceding sequence number, saturating at zero.
    #[inline]
    pub fn previous(self) -> SeqNo {
        SeqNo(self.0.saturating_sub(1))
    }

    /// Returns `self + amount`, saturating rather than overflowing.
    #[inline]
    pub fn saturating_add(self, amount: u32) -> SeqNo {
        SeqNo(self.0.saturating_add(amount as i32))
    }

    /// Rounds `self` down to the nearest multiple of `period`.
    #[inline]
    pub fn rounddown(self, period: u32) -> SeqNo {
        if period == 0 {
            return self;
        }
        SeqNo((self.0 / period as i32) * period as i32)
    }

    /// Returns `true` if `self` is a positive multiple of `period`.
    #[inline]
    pub fn is_checkpoint(self, period: u32) -> bool {
        period != 0 && self.0 > 0 && self.0 % (period as i32) == 0
    }

    /// Return an appropriate value to index a time-bounded-out-of-order
    /// queue keyed relative to `other`.
    #[inline]
    pub fn index(self, other: SeqNo) -> Either<InvalidSeqNo, usize> {
        let index = {
            let index = (self.0).wrapping_sub(other.0);
            if index < Self::OVERFLOW_THRES_NEG || index > Self::OVERFLOW_THRES_POS {
                // guard against overflows
                i32::MAX.wrapping_add(index).wrapping_add(1)
            } else {
                index
            }
        };

        if index < 0 || index > Self::DROP_SEQNO_THRES {
            Left(if index < 0 {
                InvalidSeqNo::Small
            } else {
                InvalidSeqNo::Big
            })
        } else {
            Right(index as usize)
        }
    }
}

impl From<u32> for SeqNo {
    #[inline]
    fn from(sequence_number: u32) -> SeqNo {
        SeqNo(sequence_number as i32)
    }
}

impl From<SeqNo> for u32 {
    #[inline]
    fn from(sequence_number: SeqNo) -> u32 {
        sequence_number.0 as u32
    }
}

impl Add<u32> for SeqNo {
    type Output = SeqNo;

    #[inline]
    fn add(self, rhs: u32) -> SeqNo {
        self.saturating_add(rhs)
    }
}

impl PartialOrd for SeqNo {
    fn partial_cmp(&self, other: &SeqNo) -> Option<Ordering> {
        match self.index(*other) {
            Right(0) => Some(Ordering::Equal),
            Right(_) => Some(Ordering::Greater),
            Left(InvalidSeqNo::Small) => Some(Ordering::Less),
            Left(InvalidSeqNo::Big) => Some(Ordering::Greater),
        }
    }
}

impl Orderable for SeqNo {
    fn sequence_number(&self) -> SeqNo {
        *self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_consistent_with_subtraction() {
        let a = SeqNo::from(10);
        let b = SeqNo::from(15);
        assert!(a < b);
        assert!(b > a);
        assert_eq!(a, SeqNo::from(10));
    }

    #[test]
    fn rounddown_finds_checkpoint_floor() {
        let seq = SeqNo::from(37);
        assert_eq!(seq.rounddown(10), SeqNo::from(30));
        assert!(SeqNo::from(30).is_checkpoint(10));
        assert!(!seq.is_checkpoint(10));
    }

    #[test]
    fn next_wraps_on_overflow() {
        let seq = SeqNo(i32::MAX);
        assert_eq!(seq.next(), SeqNo::from(0));
    }
}
