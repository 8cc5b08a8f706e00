//! Session runtime for one kiosk collection.
//!
//! [`spawn_session`] starts a task that owns the slide list and drives it
//! from UI commands, the realtime change stream and network completions.
//! Collaborators are injected through the [`KioskApi`] and
//! [`PageRasterizer`] ports; [`HttpKioskApi`] is the production adapter.

pub mod api;
#[cfg(feature = "http")]
pub mod http;
pub mod session;
pub mod upload;

pub use api::{KioskApi, PageImage, PageRasterizer, RasterizedDocument};
#[cfg(feature = "http")]
pub use http::HttpKioskApi;
pub use session::{KioskSessionHandle, SessionPorts, spawn_session};
pub use upload::{UploadOutcome, validate_image};
