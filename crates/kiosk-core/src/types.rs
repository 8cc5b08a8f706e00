use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::KioskError;

/// Opaque, server-assigned slide identifier.
pub type SlideId = String;

/// Storage path to signed URL mapping returned by the sign endpoint.
pub type SignedUrls = HashMap<String, String>;

/// Hard cap on slides per collection.
pub const MAX_SLIDES: usize = 20;
/// Lower bound for `KioskSettings::slide_duration_seconds`.
pub const MIN_SLIDE_DURATION_SECONDS: u16 = 3;
/// Upper bound for `KioskSettings::slide_duration_seconds`.
pub const MAX_SLIDE_DURATION_SECONDS: u16 = 300;

const DEFAULT_DEBOUNCE_MS: u64 = 150;
const DEFAULT_TRANSITIONAL_THRESHOLD: i64 = 1_000;
const DEFAULT_CACHE_TTL_MS: u64 = 5 * 60 * 1_000;
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1_024 * 1_024;
const PIN_CODE_LEN: std::ops::RangeInclusive<usize> = 4..=8;

/// What a slide renders.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SlideKind {
    /// Uploaded image or a rasterized document page.
    Image,
    /// The live scoreboard. At most one per collection.
    Liveboard,
}

/// One entry of a kiosk collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Slide {
    /// Stable server-assigned identifier.
    pub id: SlideId,
    /// Display order key. Not guaranteed contiguous.
    pub position: i64,
    /// Slide kind.
    pub kind: SlideKind,
    /// Storage path of the full-size image.
    pub image_path: Option<String>,
    /// Storage path of the thumbnail.
    pub thumbnail_path: Option<String>,
    /// Signed, time-limited URL for the full-size image.
    pub image_url: Option<String>,
    /// Signed, time-limited URL for the thumbnail.
    pub thumbnail_url: Option<String>,
    /// Original file name, for display.
    pub file_name: Option<String>,
    /// Original file size in bytes, for display.
    pub file_size: Option<u64>,
    /// Set when signed URL resolution failed and a retry is owed.
    #[serde(default)]
    pub media_pending: bool,
}

impl Slide {
    /// Build a liveboard slide.
    pub fn liveboard(id: impl Into<SlideId>, position: i64) -> Self {
        Self {
            id: id.into(),
            position,
            kind: SlideKind::Liveboard,
            image_path: None,
            thumbnail_path: None,
            image_url: None,
            thumbnail_url: None,
            file_name: None,
            file_size: None,
            media_pending: false,
        }
    }

    /// Build an image slide referencing a storage path.
    pub fn image(id: impl Into<SlideId>, position: i64, image_path: impl Into<String>) -> Self {
        Self {
            image_path: Some(image_path.into()),
            kind: SlideKind::Image,
            ..Self::liveboard(id, position)
        }
    }

    /// Storage paths that still lack a signed URL.
    pub fn unresolved_media_paths(&self) -> Vec<String> {
        if self.kind != SlideKind::Image {
            return Vec::new();
        }

        let mut paths = Vec::new();
        if let Some(path) = &self.image_path
            && self.image_url.is_none()
        {
            paths.push(path.clone());
        }
        if let Some(path) = &self.thumbnail_path
            && self.thumbnail_url.is_none()
        {
            paths.push(path.clone());
        }
        paths
    }

    /// Fill signed URLs from `urls` and recompute `media_pending`.
    ///
    /// Returns `true` when any field changed.
    pub fn apply_signed_urls(&mut self, urls: &SignedUrls) -> bool {
        let before = (
            self.image_url.clone(),
            self.thumbnail_url.clone(),
            self.media_pending,
        );

        if self.image_url.is_none()
            && let Some(url) = self.image_path.as_ref().and_then(|path| urls.get(path))
        {
            self.image_url = Some(url.clone());
        }
        if self.thumbnail_url.is_none()
            && let Some(url) = self.thumbnail_path.as_ref().and_then(|path| urls.get(path))
        {
            self.thumbnail_url = Some(url.clone());
        }
        self.media_pending = !self.unresolved_media_paths().is_empty();

        before
            != (
                self.image_url.clone(),
                self.thumbnail_url.clone(),
                self.media_pending,
            )
    }
}

/// Kiosk configuration row that owns a collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KioskSettings {
    /// Whether kiosk mode is publicly reachable.
    pub enabled: bool,
    /// Seconds each slide stays on screen.
    pub slide_duration_seconds: u16,
    /// Optional numeric PIN guarding the kiosk view.
    pub pin_code: Option<String>,
}

impl Default for KioskSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            slide_duration_seconds: 10,
            pin_code: None,
        }
    }
}

impl KioskSettings {
    /// Check duration bounds and PIN shape.
    pub fn validate(&self) -> Result<(), KioskError> {
        let duration = self.slide_duration_seconds;
        if !(MIN_SLIDE_DURATION_SECONDS..=MAX_SLIDE_DURATION_SECONDS).contains(&duration) {
            return Err(KioskError::validation(
                "invalid_settings",
                format!(
                    "slide duration must be between {MIN_SLIDE_DURATION_SECONDS} and {MAX_SLIDE_DURATION_SECONDS} seconds, got {duration}"
                ),
            ));
        }

        if let Some(pin) = &self.pin_code
            && (!PIN_CODE_LEN.contains(&pin.len()) || !pin.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(KioskError::validation(
                "invalid_settings",
                "PIN must be 4 to 8 digits",
            ));
        }

        Ok(())
    }
}

/// Full collection payload returned by the fetch endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionSnapshot {
    pub settings: KioskSettings,
    pub slides: Vec<Slide>,
}

/// Element of the bulk reorder payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlidePosition {
    pub id: SlideId,
    pub position: i64,
}

/// Slide creation payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NewSlide {
    /// Image slide referencing an already uploaded file.
    Image {
        image_path: String,
        thumbnail_path: Option<String>,
        file_name: Option<String>,
        file_size: Option<u64>,
    },
    /// The live scoreboard slide.
    Liveboard,
}

/// Result of a file upload: where the bytes landed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredFile {
    pub path: String,
    pub thumbnail_path: Option<String>,
}

/// Raw realtime record for one collection. Delivery is at-least-once and
/// unordered across rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    Inserted { slide: Slide },
    PositionUpdated { id: SlideId, position: i64 },
    Deleted { id: SlideId },
    SettingsUpdated { settings: KioskSettings },
}

/// Change event after batching, ready for the slide list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedEvent {
    Inserted(Slide),
    /// Terminal positions of one update burst, applied atomically.
    BatchApplied(HashMap<SlideId, i64>),
    Deleted { id: SlideId },
    SettingsUpdated(KioskSettings),
}

/// Session status exposed to the UI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// First fetch has not completed yet.
    Loading,
    /// List is usable.
    Ready,
    /// A reorder is waiting on the server.
    Persisting,
}

/// Upload pipeline status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Loading,
    Processing,
    Complete,
    Error,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// Progress snapshot for one upload run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadProgress {
    /// Identifier shared by every progress event of one run.
    pub upload_id: String,
    pub current: usize,
    pub total: usize,
    pub status: UploadStatus,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Success,
    Error,
}

/// Toast-style notification for a mutating action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    /// Stable error code for failures.
    pub code: Option<String>,
    pub message: String,
}

impl Notice {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            code: None,
            message: message.into(),
        }
    }

    pub fn error(error: &KioskError) -> Self {
        Self {
            level: NoticeLevel::Error,
            code: Some(error.code.clone()),
            message: error.message.clone(),
        }
    }
}

/// Tuning for one collection session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// Scoreboard that owns the collection; also the realtime scope.
    pub scoreboard_id: String,
    /// Maximum number of slides in the collection.
    pub max_slides: usize,
    /// Quiet period before a position burst is flushed.
    pub debounce_ms: u64,
    /// Positions at or above this value are transitional.
    pub transitional_threshold: i64,
    /// Lifetime of a cached order.
    pub cache_ttl_ms: u64,
    /// Largest accepted image upload.
    pub max_upload_bytes: u64,
    /// Command channel capacity.
    pub command_buffer: usize,
    /// Event broadcast capacity.
    pub event_buffer: usize,
}

impl SessionConfig {
    pub fn new(scoreboard_id: impl Into<String>) -> Self {
        Self {
            scoreboard_id: scoreboard_id.into(),
            max_slides: MAX_SLIDES,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            transitional_threshold: DEFAULT_TRANSITIONAL_THRESHOLD,
            cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            command_buffer: 64,
            event_buffer: 256,
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Position cache key for this collection.
    pub fn cache_key(&self) -> String {
        format!("kiosk-slide-order:{}", self.scoreboard_id)
    }
}

/// Input accepted by a session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SessionCommand {
    /// Fetch the collection. Without `force`, ignored while a fetch is in flight.
    Reload { force: bool },
    /// Begin dragging a slide.
    DragStart { id: SlideId },
    /// Drop the dragged slide onto the slot of `target_id`.
    Drop { target_id: SlideId },
    /// Abandon the current drag.
    CancelDrag,
    /// Create the live scoreboard slide.
    AddLiveboardSlide,
    /// Delete one slide.
    DeleteSlide { id: SlideId },
    /// Upload one image and create a slide for it.
    UploadImage {
        file_name: String,
        content_type: String,
        data: Vec<u8>,
    },
    /// Rasterize a multi-page document and create one slide per page.
    UploadDocument { file_name: String, data: Vec<u8> },
    /// Persist kiosk settings.
    UpdateSettings { settings: KioskSettings },
    /// Tear the session down.
    Shutdown,
}

/// Output emitted by a session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StatusChanged {
        status: SessionStatus,
    },
    /// Ordered slides after a visible change.
    SlidesChanged {
        revision: u64,
        slides: Vec<Slide>,
    },
    SettingsChanged {
        settings: KioskSettings,
    },
    UploadProgress(UploadProgress),
    Notice(Notice),
    /// The session task has exited.
    Closed,
}
