//! Per-collection session: one task owns the slide list and serializes
//! every command, realtime record, timer tick and network completion.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
    time::Instant,
};

use kiosk_core::{
    CacheStorage, ChangeEvent, ChangeNormalizer, CollectionSnapshot, EventStream, FetchTicket,
    KioskError, KioskSettings, NewSlide, NormalizedEvent, Notice, PositionCache, RemovedSlide,
    ReorderController, RequestFence, RetryPolicy, SessionChannelError, SessionChannels,
    SessionCommand, SessionConfig, SessionEvent, SessionInbox, SessionStatus, SignedUrls, Slide,
    SlideId, SlideKind, SlideList, UploadTracker,
};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    api::{KioskApi, PageRasterizer},
    upload::{UploadOutcome, run_document_upload, run_image_upload, validate_image},
};

/// External collaborators of one session.
#[derive(Clone)]
pub struct SessionPorts {
    pub api: Arc<dyn KioskApi>,
    /// Durable store behind the position cache.
    pub storage: Arc<dyn CacheStorage>,
    /// Document decoder; document uploads are rejected without one.
    pub rasterizer: Option<Arc<dyn PageRasterizer>>,
}

#[derive(Clone, Debug)]
pub struct KioskSessionHandle {
    channels: SessionChannels,
}

impl KioskSessionHandle {
    pub async fn send(&self, command: SessionCommand) -> Result<(), SessionChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    /// Ask the session to tear down. A `Closed` event follows.
    pub async fn shutdown(&self) -> Result<(), SessionChannelError> {
        self.send(SessionCommand::Shutdown).await
    }
}

/// Start a session for one collection and issue its first fetch.
///
/// The session ends on `Shutdown`, or once every handle is dropped.
pub fn spawn_session(
    config: SessionConfig,
    ports: SessionPorts,
    realtime: mpsc::Receiver<ChangeEvent>,
) -> KioskSessionHandle {
    let (channels, inbox) = SessionChannels::open(&config);
    let session = KioskSession::new(config, ports, inbox, realtime);
    tokio::spawn(async move {
        session.run().await;
    });

    KioskSessionHandle { channels }
}

enum Completion {
    Fetched {
        ticket: FetchTicket,
        result: Result<CollectionSnapshot, KioskError>,
    },
    InsertResolved {
        slide: Slide,
        result: Result<SignedUrls, KioskError>,
    },
    MediaResolved {
        ids: Vec<SlideId>,
        attempt: u32,
        result: Result<SignedUrls, KioskError>,
    },
    ReorderPersisted {
        result: Result<(), KioskError>,
    },
    LiveboardCreated {
        result: Result<Slide, KioskError>,
    },
    SlideDeleted {
        id: SlideId,
        result: Result<(), KioskError>,
    },
    SettingsSaved {
        previous: Option<KioskSettings>,
        result: Result<(), KioskError>,
    },
    UploadFinished {
        reserved: usize,
        outcome: UploadOutcome,
    },
}

struct KioskSession {
    config: SessionConfig,
    api: Arc<dyn KioskApi>,
    rasterizer: Option<Arc<dyn PageRasterizer>>,
    cache: PositionCache,
    cache_key: String,
    events: broadcast::Sender<SessionEvent>,
    command_rx: mpsc::Receiver<SessionCommand>,
    realtime_rx: Option<mpsc::Receiver<ChangeEvent>>,
    completion_tx: mpsc::Sender<Completion>,
    completion_rx: mpsc::Receiver<Completion>,
    shutdown: CancellationToken,
    slides: SlideList,
    settings: Option<KioskSettings>,
    normalizer: ChangeNormalizer,
    fence: RequestFence,
    fetch_cancel: Option<CancellationToken>,
    reorder: ReorderController,
    media_retry: RetryPolicy,
    /// Realtime inserts waiting on signed URLs.
    pending_inserts: HashSet<SlideId>,
    /// Optimistic deletes waiting on the server.
    pending_deletes: HashMap<SlideId, RemovedSlide>,
    /// Slots held by in-flight creations and uploads.
    reserved_slots: usize,
    liveboard_pending: bool,
    published_revision: u64,
    published_status: Option<SessionStatus>,
}

impl KioskSession {
    fn new(
        config: SessionConfig,
        ports: SessionPorts,
        inbox: SessionInbox,
        realtime_rx: mpsc::Receiver<ChangeEvent>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::channel(config.command_buffer.max(1));
        let slides = SlideList::new(config.max_slides);
        let published_revision = slides.revision();

        Self {
            cache: PositionCache::new(ports.storage, config.cache_ttl_ms),
            cache_key: config.cache_key(),
            normalizer: ChangeNormalizer::new(config.debounce(), config.transitional_threshold),
            api: ports.api,
            rasterizer: ports.rasterizer,
            events: inbox.events,
            command_rx: inbox.commands,
            realtime_rx: Some(realtime_rx),
            completion_tx,
            completion_rx,
            shutdown: CancellationToken::new(),
            slides,
            settings: None,
            fence: RequestFence::default(),
            fetch_cancel: None,
            reorder: ReorderController::default(),
            media_retry: RetryPolicy::default(),
            pending_inserts: HashSet::new(),
            pending_deletes: HashMap::new(),
            reserved_slots: 0,
            liveboard_pending: false,
            published_revision,
            published_status: None,
            config,
        }
    }

    async fn run(mut self) {
        info!(scoreboard_id = %self.config.scoreboard_id, "kiosk session started");
        self.start_fetch(false);
        self.publish();

        loop {
            let deadline = self.normalizer.deadline();
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(completion) = self.completion_rx.recv() => {
                    self.handle_completion(completion);
                }
                change = next_change(&mut self.realtime_rx) => match change {
                    Some(change) => self.handle_change(change),
                    None => {
                        debug!("realtime stream closed");
                        self.realtime_rx = None;
                    }
                },
                _ = sleep_until(deadline), if deadline.is_some() => self.handle_timer(),
            }
            self.publish();
        }

        self.teardown();
    }

    fn teardown(mut self) {
        self.shutdown.cancel();
        self.normalizer.clear();
        self.fence.reset();
        self.emit(SessionEvent::Closed);
        info!(scoreboard_id = %self.config.scoreboard_id, "kiosk session closed");
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Reload { force } => self.start_fetch(force),
            SessionCommand::DragStart { id } => {
                if let Err(err) = self.reorder.drag_start(&id, &self.slides) {
                    self.notify_error(err);
                }
            }
            SessionCommand::Drop { target_id } => self.handle_drop(&target_id),
            SessionCommand::CancelDrag => self.reorder.cancel_drag(),
            SessionCommand::AddLiveboardSlide => self.handle_add_liveboard(),
            SessionCommand::DeleteSlide { id } => self.handle_delete(id),
            SessionCommand::UploadImage {
                file_name,
                content_type,
                data,
            } => self.handle_upload_image(file_name, content_type, data),
            SessionCommand::UploadDocument { file_name, data } => {
                self.handle_upload_document(file_name, data)
            }
            SessionCommand::UpdateSettings { settings } => self.handle_update_settings(settings),
            SessionCommand::Shutdown => {}
        }
    }

    fn handle_change(&mut self, change: ChangeEvent) {
        if let Some(event) = self.normalizer.ingest(change, Instant::now()) {
            self.apply_normalized(event);
        }
    }

    fn handle_timer(&mut self) {
        if let Some(event) = self.normalizer.on_timer(Instant::now()) {
            self.apply_normalized(event);
        }
    }

    fn apply_normalized(&mut self, event: NormalizedEvent) {
        match event {
            NormalizedEvent::Inserted(slide) => self.handle_remote_insert(slide),
            NormalizedEvent::Deleted { id } => {
                self.pending_inserts.remove(&id);
                self.pending_deletes.remove(&id);
                if self.slides.apply_delete(&id).is_some() {
                    debug!(slide_id = %id, "slide deleted remotely");
                }
            }
            NormalizedEvent::SettingsUpdated(settings) => self.set_settings(settings),
            batch @ NormalizedEvent::BatchApplied(_) => {
                if self.slides.apply_event(batch) {
                    debug!(revision = self.slides.revision(), "position batch applied");
                }
            }
        }
    }

    fn handle_remote_insert(&mut self, slide: Slide) {
        if self.slides.contains(&slide.id) || self.pending_inserts.contains(&slide.id) {
            trace!(slide_id = %slide.id, "ignoring duplicate insert");
            return;
        }

        let paths = slide.unresolved_media_paths();
        if paths.is_empty() {
            self.slides.apply_insert(slide);
            return;
        }

        self.pending_inserts.insert(slide.id.clone());
        let api = Arc::clone(&self.api);
        self.spawn_cancellable(self.shutdown.child_token(), async move {
            let result = api.sign_urls(&paths).await;
            Completion::InsertResolved { slide, result }
        });
    }

    fn start_fetch(&mut self, force: bool) {
        let Some(ticket) = self.fence.begin(force) else {
            debug!("fetch already in flight; reload ignored");
            return;
        };
        if let Some(superseded) = self.fetch_cancel.take() {
            debug!(request_id = ticket.id(), "cancelling superseded fetch");
            superseded.cancel();
        }

        let token = self.shutdown.child_token();
        self.fetch_cancel = Some(token.clone());
        let api = Arc::clone(&self.api);
        debug!(request_id = ticket.id(), force, "fetching collection");
        self.spawn_cancellable(token, async move {
            let result = fetch_with_media(api.as_ref()).await;
            Completion::Fetched { ticket, result }
        });
    }

    fn handle_drop(&mut self, target_id: &str) {
        let plan = match self.reorder.drop_on(target_id, &mut self.slides) {
            Ok(Some(plan)) => plan,
            Ok(None) => return,
            Err(err) => {
                self.notify_error(err);
                return;
            }
        };

        info!(slides = plan.positions.len(), "persisting reorder");
        let api = Arc::clone(&self.api);
        self.spawn_detached(async move {
            let result = api.reorder_slides(&plan.positions).await;
            Completion::ReorderPersisted { result }
        });
    }

    fn handle_add_liveboard(&mut self) {
        if let Err(err) = self.ensure_can_add(SlideKind::Liveboard) {
            self.notify_error(err);
            return;
        }

        self.liveboard_pending = true;
        self.reserved_slots += 1;
        let api = Arc::clone(&self.api);
        self.spawn_detached(async move {
            let result = api.create_slide(NewSlide::Liveboard).await;
            Completion::LiveboardCreated { result }
        });
    }

    fn handle_delete(&mut self, id: SlideId) {
        if self.pending_deletes.contains_key(&id) {
            trace!(slide_id = %id, "delete already in flight");
            return;
        }
        let Some(removed) = self.slides.apply_delete(&id) else {
            self.notify_error(KioskError::slide_not_found(&id));
            return;
        };
        self.pending_deletes.insert(id.clone(), removed);

        let api = Arc::clone(&self.api);
        self.spawn_detached(async move {
            let result = api.delete_slide(&id).await;
            Completion::SlideDeleted { id, result }
        });
    }

    fn handle_update_settings(&mut self, settings: KioskSettings) {
        if let Err(err) = settings.validate() {
            self.notify_error(err);
            return;
        }

        let previous = self.settings.clone();
        self.set_settings(settings.clone());
        let api = Arc::clone(&self.api);
        self.spawn_detached(async move {
            let result = api.update_settings(&settings).await;
            Completion::SettingsSaved { previous, result }
        });
    }

    fn handle_upload_image(&mut self, file_name: String, content_type: String, data: Vec<u8>) {
        let checked = validate_image(&content_type, &data, self.config.max_upload_bytes)
            .and_then(|content_type| {
                self.ensure_can_add(SlideKind::Image)?;
                Ok(content_type)
            });
        let content_type = match checked {
            Ok(content_type) => content_type,
            Err(err) => {
                self.reject_upload(err);
                return;
            }
        };

        self.reserved_slots += 1;
        let api = Arc::clone(&self.api);
        let events = self.events.clone();
        self.spawn_cancellable(self.shutdown.child_token(), async move {
            let outcome =
                run_image_upload(api.as_ref(), &events, file_name, content_type, data).await;
            Completion::UploadFinished {
                reserved: 1,
                outcome,
            }
        });
    }

    fn handle_upload_document(&mut self, file_name: String, data: Vec<u8>) {
        let Some(rasterizer) = self.rasterizer.clone() else {
            self.reject_upload(KioskError::validation(
                "unsupported_media_type",
                "document uploads are not available on this device",
            ));
            return;
        };
        if let Err(err) = self.ensure_can_add(SlideKind::Image) {
            self.reject_upload(err);
            return;
        }

        let budget = self.available_slots();
        self.reserved_slots += budget;
        let max_page_bytes = self.config.max_upload_bytes;
        let api = Arc::clone(&self.api);
        let events = self.events.clone();
        self.spawn_cancellable(self.shutdown.child_token(), async move {
            let outcome = run_document_upload(
                api.as_ref(),
                rasterizer.as_ref(),
                &events,
                file_name,
                data,
                budget,
                max_page_bytes,
            )
            .await;
            Completion::UploadFinished {
                reserved: budget,
                outcome,
            }
        });
    }

    fn reject_upload(&mut self, err: KioskError) {
        let mut tracker = UploadTracker::single();
        self.emit(SessionEvent::UploadProgress(tracker.abort(err.message.clone())));
        self.notify_error(err);
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Fetched { ticket, result } => self.on_fetched(ticket, result),
            Completion::InsertResolved { mut slide, result } => {
                if !self.pending_inserts.remove(&slide.id) {
                    trace!(slide_id = %slide.id, "insert was deleted while resolving media");
                    return;
                }
                let urls = result.unwrap_or_else(|err| {
                    warn!(slide_id = %slide.id, code = %err.code, "media resolution failed");
                    SignedUrls::new()
                });
                slide.apply_signed_urls(&urls);
                let (id, pending) = (slide.id.clone(), slide.media_pending);
                if self.slides.apply_insert(slide) && pending {
                    self.schedule_media_retry(vec![id], 0, None);
                }
            }
            Completion::MediaResolved {
                ids,
                attempt,
                result,
            } => self.on_media_resolved(ids, attempt, result),
            Completion::ReorderPersisted { result } => self.on_reorder_persisted(result),
            Completion::LiveboardCreated { result } => {
                self.liveboard_pending = false;
                self.reserved_slots = self.reserved_slots.saturating_sub(1);
                match result {
                    Ok(slide) => {
                        info!(slide_id = %slide.id, "liveboard slide created");
                        self.slides.apply_insert(slide);
                        self.notify(Notice::success("Live scoreboard slide added"));
                    }
                    Err(err) => self.notify_error(err),
                }
            }
            Completion::SlideDeleted { id, result } => {
                let removed = self.pending_deletes.remove(&id);
                match result {
                    Ok(()) => self.notify(Notice::success("Slide deleted")),
                    Err(err) => {
                        if let Some(removed) = removed {
                            debug!(slide_id = %id, "restoring slide after failed delete");
                            self.slides.restore_deleted(removed);
                        }
                        self.notify_error(err);
                    }
                }
            }
            Completion::SettingsSaved { previous, result } => match result {
                Ok(()) => self.notify(Notice::success("Kiosk settings saved")),
                Err(err) => {
                    if let Some(previous) = previous {
                        self.set_settings(previous);
                    }
                    self.notify_error(err);
                }
            },
            Completion::UploadFinished { reserved, outcome } => {
                self.reserved_slots = self.reserved_slots.saturating_sub(reserved);
                let unresolved: Vec<SlideId> = outcome
                    .slides
                    .iter()
                    .filter(|slide| !slide.unresolved_media_paths().is_empty())
                    .map(|slide| slide.id.clone())
                    .collect();
                let inserted = self.slides.apply_insert_many(outcome.slides);
                debug!(inserted, "upload batch merged");
                if !unresolved.is_empty() {
                    self.schedule_media_retry(unresolved, 0, None);
                }
                // Announce the merged list before the terminal progress event.
                self.publish();
                self.emit(SessionEvent::UploadProgress(outcome.progress));
                self.notify(outcome.notice);
            }
        }
    }

    fn on_fetched(&mut self, ticket: FetchTicket, result: Result<CollectionSnapshot, KioskError>) {
        if !self.fence.complete(ticket) {
            debug!(request_id = ticket.id(), "discarding superseded fetch result");
            return;
        }
        self.fetch_cancel = None;

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(request_id = ticket.id(), code = %err.code, "collection fetch failed");
                self.notify_error(err);
                return;
            }
        };

        // The snapshot supersedes any batch still held back.
        self.normalizer.clear();
        let cached = self.cache.get(&self.cache_key);
        self.slides.load_full(snapshot.slides, cached.as_ref());
        // A lagging read can still list slides we have just deleted.
        for id in self.pending_deletes.keys() {
            let _ = self.slides.apply_delete(id);
        }
        self.set_settings(snapshot.settings);
        info!(
            request_id = ticket.id(),
            slides = self.slides.len(),
            cached_order = cached.is_some(),
            "collection loaded"
        );

        let pending: Vec<SlideId> = self
            .slides
            .iter()
            .filter(|slide| slide.media_pending)
            .map(|slide| slide.id.clone())
            .collect();
        if !pending.is_empty() {
            self.schedule_media_retry(pending, 0, None);
        }
    }

    fn on_reorder_persisted(&mut self, result: Result<(), KioskError>) {
        match self.reorder.on_persist_result(result.is_ok(), &mut self.slides) {
            Ok(Some(plan)) => {
                self.cache.put(&self.cache_key, &plan.ordered_ids());
                self.notify(Notice::success("Slide order saved"));
            }
            Ok(None) => {
                if let Err(err) = result {
                    warn!(code = %err.code, "reorder failed; rolled back");
                    self.notify_error(err);
                }
            }
            Err(err) => warn!(code = %err.code, "reorder result without a pending reorder"),
        }
    }

    fn on_media_resolved(
        &mut self,
        ids: Vec<SlideId>,
        attempt: u32,
        result: Result<SignedUrls, KioskError>,
    ) {
        let urls = match result {
            Ok(urls) => urls,
            Err(err) => {
                warn!(attempt, code = %err.code, "media retry failed");
                self.schedule_media_retry(ids, attempt + 1, err.retry_after_ms);
                return;
            }
        };

        let mut still_pending = Vec::new();
        for id in ids {
            self.slides.apply_media(&id, &urls);
            if self.slides.get(&id).is_some_and(|slide| slide.media_pending) {
                still_pending.push(id);
            }
        }
        if !still_pending.is_empty() {
            self.schedule_media_retry(still_pending, attempt + 1, None);
        }
    }

    fn schedule_media_retry(&mut self, ids: Vec<SlideId>, attempt: u32, hint_ms: Option<u64>) {
        for id in &ids {
            self.slides.mark_media_pending(id);
        }
        let Some(delay) = self.media_retry.delay_for_attempt(attempt, hint_ms) else {
            warn!(slides = ids.len(), attempt, "giving up on media resolution");
            return;
        };
        let paths: Vec<String> = ids
            .iter()
            .filter_map(|id| self.slides.get(id))
            .flat_map(Slide::unresolved_media_paths)
            .collect();
        if paths.is_empty() {
            return;
        }

        debug!(
            slides = ids.len(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling media retry"
        );
        let api = Arc::clone(&self.api);
        self.spawn_cancellable(self.shutdown.child_token(), async move {
            tokio::time::sleep(delay).await;
            let result = api.sign_urls(&paths).await;
            Completion::MediaResolved {
                ids,
                attempt,
                result,
            }
        });
    }

    fn available_slots(&self) -> usize {
        self.slides
            .remaining_capacity()
            .saturating_sub(self.reserved_slots + self.pending_inserts.len())
    }

    fn ensure_can_add(&self, kind: SlideKind) -> Result<(), KioskError> {
        self.slides.ensure_can_add(kind)?;
        if self.available_slots() == 0 {
            return Err(KioskError::validation(
                "slide_limit_reached",
                format!(
                    "a kiosk can hold at most {} slides",
                    self.config.max_slides
                ),
            ));
        }
        if kind == SlideKind::Liveboard && self.liveboard_pending {
            return Err(KioskError::validation(
                "duplicate_liveboard",
                "the live scoreboard slide is already being added",
            ));
        }
        Ok(())
    }

    fn set_settings(&mut self, settings: KioskSettings) {
        if self.settings.as_ref() == Some(&settings) {
            return;
        }
        self.settings = Some(settings.clone());
        self.emit(SessionEvent::SettingsChanged { settings });
    }

    fn status(&self) -> SessionStatus {
        if self.reorder.is_persisting() {
            SessionStatus::Persisting
        } else if !self.slides.is_loaded() && self.fence.is_busy() {
            SessionStatus::Loading
        } else {
            SessionStatus::Ready
        }
    }

    /// Emit status and list changes since the last call.
    fn publish(&mut self) {
        let revision = self.slides.revision();
        if self.published_revision != revision {
            self.published_revision = revision;
            self.emit(SessionEvent::SlidesChanged {
                revision,
                slides: self.slides.to_vec(),
            });
        }

        let status = self.status();
        if self.published_status != Some(status) {
            debug!(?status, "session status changed");
            self.published_status = Some(status);
            self.emit(SessionEvent::StatusChanged { status });
        }
    }

    fn notify(&self, notice: Notice) {
        self.emit(SessionEvent::Notice(notice));
    }

    fn notify_error(&self, err: KioskError) {
        debug!(code = %err.code, category = ?err.category, "action rejected");
        self.notify(Notice::error(&err));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Run `task` and report its completion unless `token` fires first.
    fn spawn_cancellable<F>(&self, token: CancellationToken, task: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                completion = task => {
                    let _ = completions.send(completion).await;
                }
            }
        });
    }

    /// Run `task` to completion even if the session goes away. Used for
    /// writes, which are not cancellable once sent.
    fn spawn_detached<F>(&self, task: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let completion = task.await;
            let _ = completions.send(completion).await;
        });
    }
}

async fn fetch_with_media(api: &dyn KioskApi) -> Result<CollectionSnapshot, KioskError> {
    let mut snapshot = api.fetch_collection().await?;
    let paths: Vec<String> = snapshot
        .slides
        .iter()
        .flat_map(Slide::unresolved_media_paths)
        .collect();
    if paths.is_empty() {
        return Ok(snapshot);
    }

    let urls = match api.sign_urls(&paths).await {
        Ok(urls) => urls,
        Err(err) => {
            warn!(code = %err.code, paths = paths.len(), "media resolution failed; listing without previews");
            SignedUrls::new()
        }
    };
    for slide in &mut snapshot.slides {
        slide.apply_signed_urls(&urls);
    }
    Ok(snapshot)
}

async fn next_change(rx: &mut Option<mpsc::Receiver<ChangeEvent>>) -> Option<ChangeEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
        }
        None => std::future::pending().await,
    }
}
