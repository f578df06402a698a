//! Data models for regrade

pub mod assignment;
pub mod listing;
pub mod record;

pub use assignment::{AssignmentId, CacheKey, ThreadId};
pub use listing::{ListingEntry, ListingPage};
pub use record::{Message, MessageRole, Outcome, OutcomeLabel, RequestRecord, ThreadDetail};
