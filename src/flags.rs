//! Failure classification for one transaction attempt
//!
//! As an attempt accumulates failures from parallel document operations, each
//! failure reports a set of behavior flags (may we still commit? may the
//! application trigger rollback?) and a candidate final error. Both are merged
//! into a single packed atomic so concurrent reports never lose information:
//! flags are OR'd in, and the final error only ever increases in severity.
//!
//! The packed layout is flags in the low 32 bits, final-error rank in the
//! high 32 bits, manipulated only through a compare-exchange loop.

use std::sync::atomic::{AtomicU64, Ordering};

/// Behavior flags controlling what the attempt epilogue is still allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BehaviorFlags(pub u32);

impl BehaviorFlags {
    pub const NONE: BehaviorFlags = BehaviorFlags(0);
    /// Commit is no longer legal for this attempt.
    pub const COMMIT_NOT_ALLOWED: BehaviorFlags = BehaviorFlags(1);
    /// The application may no longer trigger rollback.
    pub const APP_ROLLBACK_NOT_ALLOWED: BehaviorFlags = BehaviorFlags(1 << 1);
    /// Rollback must be skipped entirely (a stage already partially committed).
    pub const SHOULD_NOT_ROLLBACK: BehaviorFlags = BehaviorFlags(1 << 2);
    /// A fresh attempt must not be retried.
    pub const SHOULD_NOT_RETRY: BehaviorFlags = BehaviorFlags(1 << 3);

    pub fn contains(&self, other: BehaviorFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for BehaviorFlags {
    type Output = BehaviorFlags;

    fn bitor(self, rhs: BehaviorFlags) -> BehaviorFlags {
        BehaviorFlags(self.0 | rhs.0)
    }
}

/// Final error severity, ranked. A later report can only raise the rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum FinalError {
    None = 0,
    TransactionFailed = 1,
    TransactionExpired = 2,
    TransactionCommitAmbiguous = 3,
    TransactionFailedPostCommit = 4,
}

impl FinalError {
    fn from_rank(rank: u32) -> FinalError {
        match rank {
            1 => FinalError::TransactionFailed,
            2 => FinalError::TransactionExpired,
            3 => FinalError::TransactionCommitAmbiguous,
            4 => FinalError::TransactionFailedPostCommit,
            _ => FinalError::None,
        }
    }
}

/// Atomically-merged failure state for one attempt.
///
/// Safe to update from concurrent document-operation failure callbacks; reads
/// at the attempt epilogue see the union of everything reported.
pub struct StateFlags {
    packed: AtomicU64,
}

impl StateFlags {
    pub fn new() -> Self {
        Self {
            packed: AtomicU64::new(0),
        }
    }

    /// Merge `flags` and raise the final error to `final_error` if it outranks
    /// the stored value. Lock-free; loses nothing under contention.
    pub fn set_flags(&self, flags: BehaviorFlags, final_error: FinalError) {
        let mut current = self.packed.load(Ordering::Acquire);
        loop {
            let merged_flags = (current as u32) | flags.0;
            let merged_rank = (current >> 32).max(final_error as u64);
            let next = (merged_rank << 32) | merged_flags as u64;
            if next == current {
                return;
            }
            match self.packed.compare_exchange_weak(
                current,
                next,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(c) => current = c,
            }
        }
    }

    pub fn is_flag_set(&self, flag: BehaviorFlags) -> bool {
        let current = self.packed.load(Ordering::Acquire) as u32;
        BehaviorFlags(current).contains(flag)
    }

    pub fn final_error(&self) -> FinalError {
        let rank = (self.packed.load(Ordering::Acquire) >> 32) as u32;
        FinalError::from_rank(rank)
    }
}

impl Default for StateFlags {
    fn default() -> Self {
        Self::new()
    }
}
