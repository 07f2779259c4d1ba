//! Digest chain verification.

use crate::digest::Digest;
use crate::transaction::TransactionObject;
use std::fmt;

/// A break in the digest chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainViolation {
    /// A csn is missing or out of order.
    Gap {
        /// The csn that should have come next.
        expected: u64,
        /// The csn actually found.
        found: u64,
    },
    /// The stored digest does not match the entry content.
    DigestMismatch {
        /// The offending entry.
        csn: u64,
    },
    /// `before_digest` does not match the previous entry's digest.
    BrokenLink {
        /// The offending entry.
        csn: u64,
        /// Digest of the previous entry, or genesis.
        expected: Digest,
        /// The entry's `before_digest`.
        found: Digest,
    },
}

impl fmt::Display for ChainViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainViolation::Gap { expected, found } => {
                write!(f, "expected csn {expected}, found {found}")
            }
            ChainViolation::DigestMismatch { csn } => {
                write!(f, "csn {csn}: digest does not match content")
            }
            ChainViolation::BrokenLink {
                csn,
                expected,
                found,
            } => write!(
                f,
                "csn {csn}: beforeDigest {found} does not match previous digest {expected}"
            ),
        }
    }
}

/// Outcome of [`verify_chain`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainReport {
    /// Number of entries examined.
    pub checked: usize,
    /// Every violation found, in csn order.
    pub violations: Vec<ChainViolation>,
}

impl ChainReport {
    /// Returns true if no violations were found.
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Verifies that `entries` form an unbroken chain from csn 1.
///
/// Checks contiguous csns, each entry's own digest, and that each
/// `before_digest` matches the digest of the entry before it. Verification
/// continues past a violation so the report lists all of them.
pub fn verify_chain(entries: &[TransactionObject]) -> ChainReport {
    verify_chain_from(entries, 1, Digest::GENESIS)
}

/// Verifies a chain segment starting at `first_csn`, whose first entry
/// must link to `anchor`.
pub fn verify_chain_from(
    entries: &[TransactionObject],
    first_csn: u64,
    anchor: Digest,
) -> ChainReport {
    let mut report = ChainReport::default();
    let mut expected_csn = first_csn;
    let mut previous = anchor;

    for txn in entries {
        report.checked += 1;
        if txn.csn != expected_csn {
            report.violations.push(ChainViolation::Gap {
                expected: expected_csn,
                found: txn.csn,
            });
        }
        if !txn.verify_digest() {
            report
                .violations
                .push(ChainViolation::DigestMismatch { csn: txn.csn });
        }
        if txn.before_digest != previous {
            report.violations.push(ChainViolation::BrokenLink {
                csn: txn.csn,
                expected: previous,
                found: txn.before_digest,
            });
        }
        expected_csn = txn.csn + 1;
        previous = txn.digest;
    }

    report
}
