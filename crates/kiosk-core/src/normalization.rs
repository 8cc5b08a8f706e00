//! Change-event normalization.
//!
//! Inserts, deletes and settings updates pass straight through. Position
//! updates are collected into a pending batch and only released as one
//! `BatchApplied` once the stream has been quiet for the debounce window and
//! no transitional position remains in the batch.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tracing::trace;

use crate::types::{ChangeEvent, NormalizedEvent, SlideId};

/// Batches position bursts from the realtime stream.
///
/// The timer is modelled as an armed deadline; the owner sleeps until
/// `deadline()` and then calls `on_timer`.
#[derive(Debug, Clone)]
pub struct ChangeNormalizer {
    pending: HashMap<SlideId, i64>,
    deadline: Option<Instant>,
    debounce: Duration,
    transitional_threshold: i64,
}

impl ChangeNormalizer {
    pub fn new(debounce: Duration, transitional_threshold: i64) -> Self {
        Self {
            pending: HashMap::new(),
            deadline: None,
            debounce,
            transitional_threshold,
        }
    }

    /// Current pending batch.
    pub fn pending(&self) -> &HashMap<SlideId, i64> {
        &self.pending
    }

    /// When the armed timer fires, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Feed one raw event. Returns whatever can be emitted right away.
    pub fn ingest(&mut self, event: ChangeEvent, now: Instant) -> Option<NormalizedEvent> {
        match event {
            ChangeEvent::Inserted { slide } => Some(NormalizedEvent::Inserted(slide)),
            ChangeEvent::PositionUpdated { id, position } => {
                trace!(slide_id = %id, position, "buffering position update");
                self.pending.insert(id, position);
                self.deadline = Some(now + self.debounce);
                None
            }
            ChangeEvent::Deleted { id } => {
                self.pending.remove(&id);
                if self.pending.is_empty() {
                    self.deadline = None;
                } else if self.deadline.is_none()
                    && flush(&self.pending, self.transitional_threshold).is_some()
                {
                    // The held batch lost its last transitional entry.
                    self.deadline = Some(now + self.debounce);
                }
                Some(NormalizedEvent::Deleted { id })
            }
            ChangeEvent::SettingsUpdated { settings } => {
                Some(NormalizedEvent::SettingsUpdated(settings))
            }
        }
    }

    /// Handle the debounce timer firing at `now`.
    ///
    /// A batch still holding transitional values is kept and the timer is
    /// disarmed; the next position update, or a delete that removes the last
    /// transitional entry, re-arms it.
    pub fn on_timer(&mut self, now: Instant) -> Option<NormalizedEvent> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        self.deadline = None;

        match flush(&self.pending, self.transitional_threshold) {
            Some(batch) => {
                self.pending.clear();
                Some(NormalizedEvent::BatchApplied(batch))
            }
            None => {
                trace!(
                    pending = self.pending.len(),
                    "holding batch with transitional positions"
                );
                None
            }
        }
    }

    /// Drop the pending batch and disarm the timer.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.deadline = None;
    }
}

/// Whether `position` is a server-side placeholder used mid-renumbering.
pub fn is_transitional(position: i64, threshold: i64) -> bool {
    position >= threshold
}

/// Final form of `batch`, or `None` when it is empty or still transitional.
pub fn flush(batch: &HashMap<SlideId, i64>, threshold: i64) -> Option<HashMap<SlideId, i64>> {
    if batch.is_empty()
        || batch
            .values()
            .any(|position| is_transitional(*position, threshold))
    {
        return None;
    }
    Some(batch.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KioskSettings, Slide};

    const DEBOUNCE: Duration = Duration::from_millis(150);

    fn update(id: &str, position: i64) -> ChangeEvent {
        ChangeEvent::PositionUpdated {
            id: id.to_owned(),
            position,
        }
    }

    #[test]
    fn transitional_value_is_overwritten_before_flush() {
        let mut normalizer = ChangeNormalizer::new(DEBOUNCE, 1_000);
        let t0 = Instant::now();

        assert_eq!(normalizer.ingest(update("A", 1_000), t0), None);
        assert_eq!(normalizer.ingest(update("B", 2), t0 + Duration::from_millis(10)), None);
        assert_eq!(normalizer.ingest(update("A", 0), t0 + Duration::from_millis(20)), None);

        assert_eq!(normalizer.on_timer(t0 + Duration::from_millis(100)), None);

        let flushed = normalizer
            .on_timer(t0 + Duration::from_millis(170))
            .expect("batch flushes after quiet window");
        let expected = HashMap::from([("A".to_owned(), 0), ("B".to_owned(), 2)]);
        assert_eq!(flushed, NormalizedEvent::BatchApplied(expected));
        assert!(normalizer.pending().is_empty());
        assert_eq!(normalizer.deadline(), None);
    }

    #[test]
    fn holds_batch_while_transitional_values_remain() {
        let mut normalizer = ChangeNormalizer::new(DEBOUNCE, 1_000);
        let t0 = Instant::now();
        normalizer.ingest(update("A", 1_003), t0);
        normalizer.ingest(update("B", 1), t0);

        assert_eq!(normalizer.on_timer(t0 + DEBOUNCE), None);
        assert_eq!(normalizer.pending().len(), 2);
        assert_eq!(normalizer.deadline(), None);

        let t1 = t0 + Duration::from_millis(400);
        normalizer.ingest(update("A", 0), t1);
        let flushed = normalizer.on_timer(t1 + DEBOUNCE).expect("final batch");
        assert_eq!(
            flushed,
            NormalizedEvent::BatchApplied(HashMap::from([
                ("A".to_owned(), 0),
                ("B".to_owned(), 1)
            ]))
        );
    }

    #[test]
    fn each_update_restarts_the_debounce_window() {
        let mut normalizer = ChangeNormalizer::new(DEBOUNCE, 1_000);
        let t0 = Instant::now();
        normalizer.ingest(update("A", 1), t0);
        normalizer.ingest(update("B", 2), t0 + Duration::from_millis(100));
        assert_eq!(
            normalizer.deadline(),
            Some(t0 + Duration::from_millis(100) + DEBOUNCE)
        );
        assert_eq!(normalizer.on_timer(t0 + DEBOUNCE), None);
    }

    #[test]
    fn threshold_is_configurable() {
        let mut normalizer = ChangeNormalizer::new(DEBOUNCE, 50_000);
        let t0 = Instant::now();
        normalizer.ingest(update("A", 1_200), t0);
        assert!(matches!(
            normalizer.on_timer(t0 + DEBOUNCE),
            Some(NormalizedEvent::BatchApplied(_))
        ));
    }

    #[test]
    fn inserts_deletes_and_settings_pass_through_immediately() {
        let mut normalizer = ChangeNormalizer::new(DEBOUNCE, 1_000);
        let now = Instant::now();
        let slide = Slide::liveboard("live", 0);

        assert_eq!(
            normalizer.ingest(ChangeEvent::Inserted { slide: slide.clone() }, now),
            Some(NormalizedEvent::Inserted(slide))
        );
        assert_eq!(
            normalizer.ingest(ChangeEvent::Deleted { id: "x".into() }, now),
            Some(NormalizedEvent::Deleted { id: "x".into() })
        );
        let settings = KioskSettings::default();
        assert_eq!(
            normalizer.ingest(
                ChangeEvent::SettingsUpdated {
                    settings: settings.clone()
                },
                now
            ),
            Some(NormalizedEvent::SettingsUpdated(settings))
        );
    }

    #[test]
    fn delete_drops_pending_position_for_that_slide() {
        let mut normalizer = ChangeNormalizer::new(DEBOUNCE, 1_000);
        let t0 = Instant::now();
        normalizer.ingest(update("A", 1_500), t0);
        normalizer.ingest(update("B", 0), t0);
        normalizer.ingest(ChangeEvent::Deleted { id: "A".into() }, t0);

        let flushed = normalizer.on_timer(t0 + DEBOUNCE).expect("A no longer blocks");
        assert_eq!(
            flushed,
            NormalizedEvent::BatchApplied(HashMap::from([("B".to_owned(), 0)]))
        );
    }

    #[test]
    fn deleting_the_last_transitional_entry_rearms_the_timer() {
        let mut normalizer = ChangeNormalizer::new(DEBOUNCE, 1_000);
        let t0 = Instant::now();
        normalizer.ingest(update("A", 1_500), t0);
        normalizer.ingest(update("B", 0), t0);
        assert_eq!(normalizer.on_timer(t0 + DEBOUNCE), None);
        assert_eq!(normalizer.deadline(), None);

        let t1 = t0 + Duration::from_millis(400);
        normalizer.ingest(ChangeEvent::Deleted { id: "A".into() }, t1);
        assert_eq!(normalizer.deadline(), Some(t1 + DEBOUNCE));

        let flushed = normalizer.on_timer(t1 + DEBOUNCE).expect("B is final");
        assert_eq!(
            flushed,
            NormalizedEvent::BatchApplied(HashMap::from([("B".to_owned(), 0)]))
        );
    }

    #[test]
    fn deleting_from_a_still_transitional_batch_keeps_it_held() {
        let mut normalizer = ChangeNormalizer::new(DEBOUNCE, 1_000);
        let t0 = Instant::now();
        normalizer.ingest(update("A", 1_500), t0);
        normalizer.ingest(update("B", 0), t0);
        normalizer.ingest(update("C", 1_200), t0);
        assert_eq!(normalizer.on_timer(t0 + DEBOUNCE), None);

        normalizer.ingest(ChangeEvent::Deleted { id: "A".into() }, t0 + DEBOUNCE);
        assert_eq!(normalizer.deadline(), None);
        assert_eq!(normalizer.pending().len(), 2);
    }

    #[test]
    fn flush_is_pure_over_the_batch() {
        let final_batch = HashMap::from([("A".to_owned(), 0), ("B".to_owned(), 999)]);
        assert_eq!(flush(&final_batch, 1_000), Some(final_batch.clone()));

        let transitional = HashMap::from([("A".to_owned(), 1_000)]);
        assert_eq!(flush(&transitional, 1_000), None);
        assert_eq!(flush(&HashMap::new(), 1_000), None);
    }
}
