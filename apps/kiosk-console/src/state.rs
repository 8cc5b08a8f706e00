//! Frontend-facing state reducer for `kiosk-console`.

use std::collections::VecDeque;

use kiosk_core::{
    KioskSettings, Notice, NoticeLevel, SessionEvent, SessionStatus, Slide, SlideKind,
    UploadProgress, UploadStatus,
};
use serde::Serialize;
use tracing::{debug, trace};

const MAX_TOASTS: usize = 5;

/// Slide row as rendered by the console.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlideRow {
    pub id: String,
    pub label: String,
    pub position: i64,
    pub has_preview: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToastView {
    pub level: NoticeLevel,
    pub text: String,
}

/// Full UI snapshot emitted after state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsoleSnapshot {
    pub slides: Vec<SlideRow>,
    pub status_text: String,
    pub can_drag: bool,
    pub settings: Option<KioskSettings>,
    pub upload_text: Option<String>,
    pub toasts: Vec<ToastView>,
}

/// Mutable console state fed by session events.
#[derive(Debug, Clone)]
pub struct ConsoleState {
    revision: u64,
    slides: Vec<Slide>,
    status: SessionStatus,
    settings: Option<KioskSettings>,
    upload: Option<UploadProgress>,
    toasts: VecDeque<ToastView>,
    closed: bool,
}

impl Default for ConsoleState {
    fn default() -> Self {
        Self {
            revision: 0,
            slides: Vec::new(),
            status: SessionStatus::Loading,
            settings: None,
            upload: None,
            toasts: VecDeque::new(),
            closed: false,
        }
    }
}

impl ConsoleState {
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Current immutable snapshot for rendering.
    pub fn snapshot(&self) -> ConsoleSnapshot {
        ConsoleSnapshot {
            slides: self.slides.iter().map(slide_row).collect(),
            status_text: self.status_text(),
            can_drag: !self.closed && self.status == SessionStatus::Ready,
            settings: self.settings.clone(),
            upload_text: self.upload.as_ref().map(upload_text),
            toasts: self.toasts.iter().cloned().collect(),
        }
    }

    /// Apply one session event. Returns `true` when the snapshot changed.
    pub fn handle_session_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::StatusChanged { status } => {
                let changed = self.status != status;
                self.status = status;
                changed
            }
            SessionEvent::SlidesChanged { revision, slides } => {
                if revision <= self.revision {
                    trace!(revision, current = self.revision, "ignoring stale slide list");
                    return false;
                }
                debug!(revision, slides = slides.len(), "slide list replaced");
                self.revision = revision;
                self.slides = slides;
                true
            }
            SessionEvent::SettingsChanged { settings } => {
                let changed = self.settings.as_ref() != Some(&settings);
                self.settings = Some(settings);
                changed
            }
            SessionEvent::UploadProgress(progress) => {
                self.upload = Some(progress);
                true
            }
            SessionEvent::Notice(notice) => {
                self.push_toast(notice);
                true
            }
            SessionEvent::Closed => {
                self.closed = true;
                true
            }
        }
    }

    /// Drop the oldest toast, if any.
    pub fn dismiss_toast(&mut self) -> bool {
        self.toasts.pop_front().is_some()
    }

    fn push_toast(&mut self, notice: Notice) {
        let text = match &notice.code {
            Some(code) if notice.level == NoticeLevel::Error => {
                format!("{} ({code})", notice.message)
            }
            _ => notice.message,
        };
        self.toasts.push_back(ToastView {
            level: notice.level,
            text,
        });
        while self.toasts.len() > MAX_TOASTS {
            self.toasts.pop_front();
        }
    }

    fn status_text(&self) -> String {
        if self.closed {
            return "Closed".to_owned();
        }
        match self.status {
            SessionStatus::Loading => "Loading slides".to_owned(),
            SessionStatus::Persisting => "Saving order".to_owned(),
            SessionStatus::Ready => match self.slides.len() {
                1 => "1 slide".to_owned(),
                count => format!("{count} slides"),
            },
        }
    }
}

fn slide_row(slide: &Slide) -> SlideRow {
    let label = match slide.kind {
        SlideKind::Liveboard => "Live scoreboard".to_owned(),
        SlideKind::Image => slide
            .file_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| slide.id.clone()),
    };
    SlideRow {
        id: slide.id.clone(),
        label,
        position: slide.position,
        has_preview: slide.thumbnail_url.is_some() || slide.image_url.is_some(),
    }
}

fn upload_text(progress: &UploadProgress) -> String {
    match progress.status {
        UploadStatus::Loading | UploadStatus::Complete | UploadStatus::Error => {
            progress.message.clone()
        }
        UploadStatus::Processing => format!(
            "{} ({}/{})",
            progress.message, progress.current, progress.total
        ),
    }
}
