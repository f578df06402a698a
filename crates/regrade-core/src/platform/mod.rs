//! Remote grading platform
//!
//! `GradingPlatform` is the seam the fetcher talks through: a paginated
//! listing of regrade threads and a detail page per thread. `GradescopeClient`
//! is the real implementation; `MockPlatform` scripts responses for tests.

pub mod gradescope;
pub mod mock;
pub mod parse;

pub use gradescope::GradescopeClient;
pub use mock::MockPlatform;

use crate::error::CoreError;
use crate::models::{AssignmentId, ListingEntry, ListingPage, ThreadDetail};
use crate::session::Session;
use async_trait::async_trait;

/// Read-only view of the platform used during a fetch run
#[async_trait]
pub trait GradingPlatform: Send + Sync {
    /// Fetch one listing page. `cursor` is `None` for the first page, then the
    /// `next` value of the previous page.
    async fn fetch_listing_page(
        &self,
        session: &Session,
        assignment: &AssignmentId,
        cursor: Option<&str>,
    ) -> Result<ListingPage, CoreError>;

    /// Fetch and parse one thread page
    async fn fetch_thread(
        &self,
        session: &Session,
        entry: &ListingEntry,
    ) -> Result<ThreadDetail, CoreError>;
}
