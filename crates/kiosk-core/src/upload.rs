//! Bookkeeping for the slide upload pipeline: slide budget, per-item
//! progress, and the terminal summary.

use uuid::Uuid;

use crate::types::{UploadProgress, UploadStatus};

/// How many pages of a document will actually be uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentPlan {
    pub total_pages: usize,
    pub pages_to_upload: usize,
}

impl DocumentPlan {
    pub fn new(total_pages: usize, remaining_capacity: usize) -> Self {
        Self {
            total_pages,
            pages_to_upload: total_pages.min(remaining_capacity),
        }
    }

    pub fn hits_slide_limit(&self) -> bool {
        self.pages_to_upload < self.total_pages
    }
}

/// Progress state of one upload run. Always ends in `Complete` or `Error`.
#[derive(Debug, Clone)]
pub struct UploadTracker {
    upload_id: String,
    total: usize,
    planned: usize,
    succeeded: usize,
    failed: usize,
    status: UploadStatus,
}

impl UploadTracker {
    /// Start tracking a run over `plan`.
    pub fn new(plan: DocumentPlan) -> Self {
        Self {
            upload_id: Uuid::new_v4().to_string(),
            total: plan.total_pages,
            planned: plan.pages_to_upload,
            succeeded: 0,
            failed: 0,
            status: UploadStatus::Loading,
        }
    }

    /// Tracker for a single file.
    pub fn single() -> Self {
        Self::new(DocumentPlan::new(1, 1))
    }

    /// Fix the page budget once the source has been decoded. Keeps the id.
    pub fn replan(&mut self, plan: DocumentPlan) {
        self.total = plan.total_pages;
        self.planned = plan.pages_to_upload;
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Initial event while the source is read or decoded.
    pub fn loading(&self, message: impl Into<String>) -> UploadProgress {
        self.progress(0, message.into())
    }

    /// Page `index` (zero-based) is about to be processed.
    pub fn processing(&mut self, index: usize) -> UploadProgress {
        self.status = UploadStatus::Processing;
        self.progress(
            index + 1,
            format!("Processing page {} of {}", index + 1, self.planned),
        )
    }

    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    /// Terminal event: `Complete` when anything succeeded, `Error` otherwise.
    pub fn finish(&mut self) -> UploadProgress {
        self.status = if self.succeeded > 0 {
            UploadStatus::Complete
        } else {
            UploadStatus::Error
        };
        let message = self.summary();
        self.progress(self.succeeded + self.failed, message)
    }

    /// Terminal event for a run that failed before any item was processed.
    pub fn abort(&mut self, message: impl Into<String>) -> UploadProgress {
        self.status = UploadStatus::Error;
        self.progress(0, message.into())
    }

    /// `"{ok} of {total} uploaded"` plus failure / slide-limit notes.
    pub fn summary(&self) -> String {
        let mut notes = Vec::new();
        if self.failed > 0 {
            notes.push(format!("{} failed", self.failed));
        }
        if self.planned < self.total {
            notes.push("slide limit".to_owned());
        }

        let head = format!("{} of {} uploaded", self.succeeded, self.total);
        if notes.is_empty() {
            head
        } else {
            format!("{head} ({})", notes.join(", "))
        }
    }

    fn progress(&self, current: usize, message: String) -> UploadProgress {
        UploadProgress {
            upload_id: self.upload_id.clone(),
            current,
            total: self.planned,
            status: self.status,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_pages_with_three_slots_reports_slide_limit() {
        let plan = DocumentPlan::new(5, 3);
        assert_eq!(plan.pages_to_upload, 3);
        assert!(plan.hits_slide_limit());

        let mut tracker = UploadTracker::new(plan);
        for index in 0..plan.pages_to_upload {
            let progress = tracker.processing(index);
            assert_eq!(progress.status, UploadStatus::Processing);
            assert_eq!(progress.current, index + 1);
            tracker.record_success();
        }
        let done = tracker.finish();
        assert_eq!(done.status, UploadStatus::Complete);
        assert_eq!(done.message, "3 of 5 uploaded (slide limit)");
    }

    #[test]
    fn partial_failure_is_summarized() {
        let mut tracker = UploadTracker::new(DocumentPlan::new(3, 20));
        tracker.record_success();
        tracker.record_failure();
        tracker.record_success();
        let done = tracker.finish();
        assert_eq!(done.status, UploadStatus::Complete);
        assert_eq!(done.message, "2 of 3 uploaded (1 failed)");
    }

    #[test]
    fn all_failed_ends_in_error() {
        let mut tracker = UploadTracker::new(DocumentPlan::new(4, 2));
        tracker.record_failure();
        tracker.record_failure();
        let done = tracker.finish();
        assert_eq!(done.status, UploadStatus::Error);
        assert_eq!(done.message, "0 of 4 uploaded (2 failed, slide limit)");
        assert!(done.status.is_terminal());
    }

    #[test]
    fn replan_keeps_the_run_id() {
        let mut tracker = UploadTracker::single();
        let id = tracker.upload_id().to_owned();
        tracker.replan(DocumentPlan::new(7, 2));
        assert_eq!(tracker.upload_id(), id);
        assert_eq!(tracker.processing(1).message, "Processing page 2 of 2");
    }

    #[test]
    fn events_of_one_run_share_an_id() {
        let mut tracker = UploadTracker::single();
        let first = tracker.loading("Reading file");
        let last = tracker.abort("unsupported file");
        assert_eq!(first.upload_id, last.upload_id);
        assert_eq!(last.status, UploadStatus::Error);
    }
}
