//! Query, pagination and aggregate types for store reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{Phase, RecordStatus};

/// A page window over an ordered result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Zero-based page index.
    pub page: u32,
    /// Page size. Zero means unbounded.
    pub size: u32,
}

impl PageRequest {
    pub const DEFAULT_SIZE: u32 = 20;
    pub const MAX_SIZE: u32 = 1000;

    /// A bounded page; size is clamped to `1..=MAX_SIZE`.
    pub fn new(page: u32, size: u32) -> Self {
        Self {
            page,
            size: size.clamp(1, Self::MAX_SIZE),
        }
    }

    /// Everything in one page.
    pub fn unbounded() -> Self {
        Self { page: 0, size: 0 }
    }

    pub fn is_unbounded(&self) -> bool {
        self.size == 0
    }

    /// SQL `LIMIT`; -1 means no limit in SQLite.
    pub fn limit(&self) -> i64 {
        if self.is_unbounded() {
            -1
        } else {
            i64::from(self.size)
        }
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page) * i64::from(self.size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, Self::DEFAULT_SIZE)
    }
}

/// One page of results plus the totals needed to render pagination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub content: Vec<T>,
    pub total_elements: u64,
    pub total_pages: u64,
    pub current_page: u32,
    pub page_size: u32,
    pub has_next: bool,
    pub has_previous: bool,
}

impl<T> Page<T> {
    pub fn new(content: Vec<T>, total_elements: u64, request: PageRequest) -> Self {
        let page_size = if request.is_unbounded() {
            total_elements.min(u64::from(u32::MAX)) as u32
        } else {
            request.size
        };
        let total_pages = if page_size == 0 {
            0
        } else {
            total_elements.div_ceil(u64::from(page_size))
        };
        Self {
            content,
            total_elements,
            total_pages,
            current_page: request.page,
            page_size,
            has_next: u64::from(request.page) + 1 < total_pages,
            has_previous: request.page > 0,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            content: self.content.into_iter().map(f).collect(),
            total_elements: self.total_elements,
            total_pages: self.total_pages,
            current_page: self.current_page,
            page_size: self.page_size,
            has_next: self.has_next,
            has_previous: self.has_previous,
        }
    }
}

/// Which records a bulk selection considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// PENDING, plus FAILED below the attempt limit.
    Runnable { max_attempts: u32 },
    /// Only FAILED below the attempt limit.
    Retryable { max_attempts: u32 },
}

impl Eligibility {
    pub fn max_attempts(&self) -> u32 {
        match self {
            Eligibility::Runnable { max_attempts } | Eligibility::Retryable { max_attempts } => {
                *max_attempts
            }
        }
    }

    /// The claim guard matching this selection.
    pub fn guard(&self) -> ClaimGuard {
        match *self {
            Eligibility::Runnable { max_attempts } => ClaimGuard::runnable(max_attempts),
            Eligibility::Retryable { max_attempts } => ClaimGuard::retryable(max_attempts),
        }
    }
}

/// Conditions a record must still satisfy at claim time.
///
/// The claim is a single conditional update, so a record that changed status
/// since it was selected is simply not claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimGuard {
    pub allow_pending: bool,
    pub allow_failed: bool,
    pub allow_success: bool,
    /// FAILED records are claimable only below this many attempts.
    pub max_attempts: u32,
}

impl ClaimGuard {
    pub fn runnable(max_attempts: u32) -> Self {
        Self {
            allow_pending: true,
            allow_failed: true,
            allow_success: false,
            max_attempts,
        }
    }

    pub fn retryable(max_attempts: u32) -> Self {
        Self {
            allow_pending: false,
            allow_failed: true,
            allow_success: false,
            max_attempts,
        }
    }

    /// Explicitly named records: same as a bulk run.
    pub fn selected(max_attempts: u32) -> Self {
        Self::runnable(max_attempts)
    }

    /// Operator override: SUCCESS records may be re-processed too.
    pub fn overridden(max_attempts: u32) -> Self {
        Self {
            allow_success: true,
            ..Self::runnable(max_attempts)
        }
    }

    /// Whether a record in `status` with `attempt_count` passes this guard.
    pub fn admits(&self, status: RecordStatus, attempt_count: u32) -> bool {
        match status {
            RecordStatus::Pending => self.allow_pending,
            RecordStatus::Failed => self.allow_failed && attempt_count < self.max_attempts,
            RecordStatus::Success => self.allow_success,
            RecordStatus::InProgress | RecordStatus::Skipped => false,
        }
    }
}

/// Filters for listing records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub status: Option<RecordStatus>,
    /// Case-insensitive substring over source id, correspondence id, destination id and last error.
    pub search: Option<String>,
    #[serde(flatten)]
    pub page: PageRequest,
}

/// Per-status counts for one phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub success: u64,
    /// FAILED and still retryable.
    pub failed: u64,
    /// FAILED with no attempts left.
    pub permanently_failed: u64,
    pub skipped: u64,
    pub total: u64,
}

/// One operator override of a SUCCESS record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideAudit {
    pub phase: Phase,
    pub source_id: String,
    pub operator: String,
    pub reason: String,
    pub previous_destination_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_math() {
        let page: Page<u32> = Page::new(vec![1, 2], 5, PageRequest::new(1, 2));
        assert_eq!(page.total_pages, 3);
        assert!(page.has_next);
        assert!(page.has_previous);

        let last: Page<u32> = Page::new(vec![5], 5, PageRequest::new(2, 2));
        assert!(!last.has_next);
    }

    #[test]
    fn test_unbounded_page() {
        let request = PageRequest::unbounded();
        assert_eq!(request.limit(), -1);
        assert_eq!(request.offset(), 0);
        let page = Page::new(vec!["a"; 7], 7, request);
        assert_eq!(page.total_pages, 1);
        assert_eq!(page.page_size, 7);
    }

    #[test]
    fn test_empty_page() {
        let page: Page<u32> = Page::new(vec![], 0, PageRequest::default());
        assert_eq!(page.total_pages, 0);
        assert!(!page.has_next);
        assert!(!page.has_previous);
    }

    #[test]
    fn test_page_size_clamped() {
        assert_eq!(PageRequest::new(0, 0).size, 1);
        assert_eq!(PageRequest::new(0, 50_000).size, PageRequest::MAX_SIZE);
    }

    #[test]
    fn test_claim_guards() {
        let runnable = ClaimGuard::runnable(3);
        assert!(runnable.admits(RecordStatus::Pending, 0));
        assert!(runnable.admits(RecordStatus::Failed, 2));
        assert!(!runnable.admits(RecordStatus::Failed, 3));
        assert!(!runnable.admits(RecordStatus::Success, 1));
        assert!(!runnable.admits(RecordStatus::InProgress, 0));

        let retry = ClaimGuard::retryable(3);
        assert!(!retry.admits(RecordStatus::Pending, 0));
        assert!(retry.admits(RecordStatus::Failed, 1));

        let forced = ClaimGuard::overridden(3);
        assert!(forced.admits(RecordStatus::Success, 4));
        assert!(!forced.admits(RecordStatus::Skipped, 1));
    }
}
