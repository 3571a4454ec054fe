//! History log access
//!
//! The capture path appends transactions to a history log. The passive
//! scanner reads it by id and its only write is tagging, done through
//! the registry.

pub mod memory;

use crate::error::Result;
use crate::models::{HistoryKind, Transaction};

pub use memory::MemoryHistory;

/// Lightweight handle to a committed history record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRef {
    pub id: u64,
    pub kind: HistoryKind,
    pub method: String,
    pub url: String,
}

/// The history collaborator consumed by the scheduler and tasks
pub trait HistoryLog: Send + Sync {
    /// Highest id whose record is fully written. Ids are never reused.
    fn highest_committed_id(&self) -> u64;

    /// Looks up a record. `None` for purged records and id gaps.
    fn resolve(&self, id: u64) -> Option<HistoryRef>;

    /// Loads the full request and response. Fails if the record vanished
    /// after it was resolved.
    fn load(&self, href: &HistoryRef) -> Result<Transaction>;

    /// Whether the record is inside the configured testing scope
    fn is_in_scope(&self, href: &HistoryRef) -> bool;

    /// Tags currently attached to a record
    fn tags(&self, id: u64) -> Vec<String>;

    /// Attaches a tag to a record
    fn add_tag(&self, id: u64, tag: &str) -> Result<()>;
}
