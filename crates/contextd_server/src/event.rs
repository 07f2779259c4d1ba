//! Context manager events.

use contextd_journal::TransactionObject;

/// Something observable that happened to a context.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextEvent {
    /// This process committed an entry.
    Committed {
        /// Assigned csn.
        csn: u64,
    },
    /// A replicated entry was added to the local journal.
    Applied {
        /// Entry csn.
        csn: u64,
    },
    /// Fork repair replaced the local tail starting at `csn`.
    ///
    /// `discarded` holds every local entry that was replaced or removed, so
    /// callers whose commits were lost can be told.
    Superseded {
        /// First csn of the replaced tail.
        csn: u64,
        /// The replaced and removed entries.
        discarded: Vec<TransactionObject>,
    },
    /// This process now holds the leadership lease.
    LeadershipAcquired,
    /// This process gave up or lost the leadership lease.
    LeadershipLost,
}
