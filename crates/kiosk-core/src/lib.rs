//! Slide synchronization and reordering engine for scoreboard kiosk mode.
//!
//! This crate holds the pure, single-collection state: the ordered slide
//! list, change-event batching, request fencing, the reorder state machine,
//! the device-local position cache and upload bookkeeping. Network I/O lives
//! in `kiosk-runtime`.

/// Async command/event channel primitives.
pub mod channel;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Monotonic request ids for discarding superseded fetches.
pub mod fencing;
/// Realtime change-event batching.
pub mod normalization;
/// TTL-bound cache of the last locally written order.
pub mod position_cache;
/// Backoff policy for media reference resolution.
pub mod retry;
/// The ordered slide list (reconciler).
pub mod slide_list;
/// Drag-and-drop reorder state machine.
pub mod state_machine;
/// Data model and session protocol types.
pub mod types;
/// Upload budget and progress bookkeeping.
pub mod upload;

pub use channel::{EventStream, SessionChannelError, SessionChannels, SessionInbox};
pub use error::{KioskError, KioskErrorCategory, classify_http_status};
pub use fencing::{FetchTicket, RequestFence};
pub use normalization::ChangeNormalizer;
pub use position_cache::{CacheStorage, CacheStorageError, CachedOrder, PositionCache};
pub use retry::RetryPolicy;
pub use slide_list::{RemovedSlide, Rollback, SlideList};
pub use state_machine::{ReorderController, ReorderPhase, ReorderPlan, compute_reorder};
pub use types::{
    ChangeEvent, CollectionSnapshot, KioskSettings, MAX_SLIDES, NewSlide, Notice, NoticeLevel,
    NormalizedEvent, SessionCommand, SessionConfig, SessionEvent, SessionStatus, SignedUrls,
    Slide, SlideId, SlideKind, SlidePosition, StoredFile, UploadProgress, UploadStatus,
};
pub use upload::{DocumentPlan, UploadTracker};
