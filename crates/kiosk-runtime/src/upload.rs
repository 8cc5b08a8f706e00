//! Upload pipeline: image validation, single-image and multi-page document
//! runs.
//!
//! Runs execute off the session loop. Intermediate progress is broadcast
//! directly; the created slides and the terminal progress event are handed
//! back so the loop can merge the batch before announcing completion.

use image::ImageFormat;
use kiosk_core::{
    DocumentPlan, KioskError, NewSlide, Notice, SessionEvent, Slide, UploadProgress, UploadTracker,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::{KioskApi, PageRasterizer};

/// Result of one upload run.
#[derive(Debug)]
pub struct UploadOutcome {
    /// Slides the server created, to be merged as one batch.
    pub slides: Vec<Slide>,
    /// Terminal progress event.
    pub progress: UploadProgress,
    pub notice: Notice,
}

/// Check declared type, sniffed type and size of an image payload.
///
/// Returns the canonical MIME type.
pub fn validate_image(
    content_type: &str,
    data: &[u8],
    max_bytes: u64,
) -> Result<&'static str, KioskError> {
    if data.len() as u64 > max_bytes {
        return Err(KioskError::validation(
            "file_too_large",
            format!(
                "file is {} bytes; the limit is {max_bytes} bytes",
                data.len()
            ),
        ));
    }

    let declared = declared_format(content_type).ok_or_else(|| {
        KioskError::validation(
            "unsupported_media_type",
            format!("'{content_type}' is not a supported image type"),
        )
    })?;
    let sniffed = image::guess_format(data).map_err(|_| {
        KioskError::validation("unsupported_media_type", "file is not a recognizable image")
    })?;
    if sniffed != declared {
        return Err(KioskError::validation(
            "unsupported_media_type",
            format!(
                "file claims to be {} but contains {}",
                declared.to_mime_type(),
                sniffed.to_mime_type()
            ),
        ));
    }
    Ok(declared.to_mime_type())
}

fn declared_format(content_type: &str) -> Option<ImageFormat> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/png" => Some(ImageFormat::Png),
        "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
        "image/gif" => Some(ImageFormat::Gif),
        "image/webp" => Some(ImageFormat::WebP),
        _ => None,
    }
}

/// `report.pdf`, page 0, `image/png` -> `report-page-1.png`.
fn page_file_name(file_name: &str, index: usize, content_type: &str) -> String {
    let stem = file_name
        .rsplit_once('.')
        .map_or(file_name, |(stem, _)| stem);
    let extension = ImageFormat::from_mime_type(content_type)
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("png");
    format!("{stem}-page-{}.{extension}", index + 1)
}

async fn store_slide(
    api: &dyn KioskApi,
    file_name: &str,
    content_type: &str,
    data: Vec<u8>,
) -> Result<Slide, KioskError> {
    let file_size = data.len() as u64;
    let stored = api.upload_file(file_name, content_type, data).await?;
    api.create_slide(NewSlide::Image {
        image_path: stored.path,
        thumbnail_path: stored.thumbnail_path,
        file_name: Some(file_name.to_owned()),
        file_size: Some(file_size),
    })
    .await
}

fn emit(events: &broadcast::Sender<SessionEvent>, progress: UploadProgress) {
    let _ = events.send(SessionEvent::UploadProgress(progress));
}

/// Upload one already validated image and create its slide.
pub async fn run_image_upload(
    api: &dyn KioskApi,
    events: &broadcast::Sender<SessionEvent>,
    file_name: String,
    content_type: &'static str,
    data: Vec<u8>,
) -> UploadOutcome {
    let mut tracker = UploadTracker::single();
    emit(events, tracker.loading(format!("Uploading {file_name}")));

    match store_slide(api, &file_name, content_type, data).await {
        Ok(slide) => {
            info!(slide_id = %slide.id, file_name, "image slide created");
            tracker.record_success();
            UploadOutcome {
                slides: vec![slide],
                progress: tracker.finish(),
                notice: Notice::success("Slide added"),
            }
        }
        Err(err) => {
            warn!(file_name, code = %err.code, "image upload failed");
            tracker.record_failure();
            UploadOutcome {
                slides: Vec::new(),
                progress: tracker.finish(),
                notice: Notice::error(&err),
            }
        }
    }
}

/// Rasterize a document and upload up to `remaining_capacity` pages, one at
/// a time. A failed page does not stop the run.
pub async fn run_document_upload(
    api: &dyn KioskApi,
    rasterizer: &dyn PageRasterizer,
    events: &broadcast::Sender<SessionEvent>,
    file_name: String,
    data: Vec<u8>,
    remaining_capacity: usize,
    max_page_bytes: u64,
) -> UploadOutcome {
    let mut tracker = UploadTracker::single();
    emit(events, tracker.loading(format!("Reading {file_name}")));

    let document = match rasterizer.rasterize(&data, remaining_capacity).await {
        Ok(document) => document,
        Err(err) => {
            warn!(file_name, code = %err.code, "document could not be rasterized");
            return UploadOutcome {
                slides: Vec::new(),
                progress: tracker.abort(format!("Could not read {file_name}")),
                notice: Notice::error(&err),
            };
        }
    };

    let plan = DocumentPlan::new(document.total_pages, remaining_capacity);
    tracker.replan(plan);
    debug!(
        file_name,
        total_pages = plan.total_pages,
        pages_to_upload = plan.pages_to_upload,
        "document plan"
    );

    let mut slides = Vec::with_capacity(plan.pages_to_upload);
    let mut last_error = None;
    for (index, page) in document
        .pages
        .into_iter()
        .take(plan.pages_to_upload)
        .enumerate()
    {
        emit(events, tracker.processing(index));

        let result = match validate_image(&page.content_type, &page.data, max_page_bytes) {
            Ok(content_type) => {
                let page_name = page_file_name(&file_name, index, content_type);
                store_slide(api, &page_name, content_type, page.data).await
            }
            Err(err) => Err(err),
        };
        match result {
            Ok(slide) => {
                tracker.record_success();
                slides.push(slide);
            }
            Err(err) => {
                warn!(file_name, page = index + 1, code = %err.code, "page upload failed");
                tracker.record_failure();
                last_error = Some(err);
            }
        }
    }

    // Rasterizer returned fewer pages than promised.
    let missing = plan
        .pages_to_upload
        .saturating_sub(tracker.succeeded() + tracker.failed());
    for _ in 0..missing {
        tracker.record_failure();
    }

    let progress = tracker.finish();
    let notice = if slides.is_empty() {
        let err = last_error.unwrap_or_else(|| {
            KioskError::validation("decode_error", format!("{file_name} produced no pages"))
        });
        Notice::error(&err)
    } else {
        Notice::success(progress.message.clone())
    };
    info!(file_name, message = %progress.message, "document upload finished");

    UploadOutcome {
        slides,
        progress,
        notice,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
    const JPEG: &[u8] = b"\xff\xd8\xff\xe0\0\x10JFIF\0";

    #[test]
    fn accepts_matching_type_and_magic() {
        assert_eq!(
            validate_image("image/png", PNG, 1_024).expect("png accepted"),
            "image/png"
        );
        assert_eq!(
            validate_image("Image/JPEG; charset=binary", JPEG, 1_024).expect("jpeg accepted"),
            "image/jpeg"
        );
    }

    #[test]
    fn rejects_mismatched_magic() {
        let err = validate_image("image/png", JPEG, 1_024).expect_err("mismatch");
        assert_eq!(err.code, "unsupported_media_type");
    }

    #[test]
    fn rejects_unknown_types_and_oversized_files() {
        let err = validate_image("application/pdf", PNG, 1_024).expect_err("not an image type");
        assert_eq!(err.code, "unsupported_media_type");

        let err = validate_image("image/png", PNG, 4).expect_err("too large");
        assert_eq!(err.code, "file_too_large");
    }

    #[test]
    fn page_names_follow_the_source_document() {
        assert_eq!(page_file_name("report.pdf", 0, "image/png"), "report-page-1.png");
        assert_eq!(page_file_name("slides", 4, "image/jpeg"), "slides-page-5.jpg");
    }
}
