//! Ports to the collaborators a session talks to.

use async_trait::async_trait;
use kiosk_core::{
    CollectionSnapshot, KioskError, KioskSettings, NewSlide, SignedUrls, Slide, SlidePosition,
    StoredFile,
};

/// Kiosk HTTP endpoints for one scoreboard.
#[async_trait]
pub trait KioskApi: Send + Sync {
    /// Full collection plus its settings row.
    async fn fetch_collection(&self) -> Result<CollectionSnapshot, KioskError>;

    /// Create a slide. The returned slide carries resolved media when the
    /// server has them.
    async fn create_slide(&self, slide: NewSlide) -> Result<Slide, KioskError>;

    /// Bulk reorder with the full `{id, position}` list.
    async fn reorder_slides(&self, positions: &[SlidePosition]) -> Result<(), KioskError>;

    async fn delete_slide(&self, id: &str) -> Result<(), KioskError>;

    async fn update_settings(&self, settings: &KioskSettings) -> Result<(), KioskError>;

    /// Store raw bytes and return where they landed.
    async fn upload_file(
        &self,
        file_name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<StoredFile, KioskError>;

    /// Signed URLs for the given storage paths. Paths the server could not
    /// sign are absent from the map.
    async fn sign_urls(&self, paths: &[String]) -> Result<SignedUrls, KioskError>;
}

/// One rendered page of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Output of a rasterizer run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterizedDocument {
    /// Page count of the whole source document.
    pub total_pages: usize,
    /// Rendered pages, in order, at most the requested count.
    pub pages: Vec<PageImage>,
}

/// Turns a multi-page document (PDF) into page images.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    async fn rasterize(
        &self,
        data: &[u8],
        max_pages: usize,
    ) -> Result<RasterizedDocument, KioskError>;
}
