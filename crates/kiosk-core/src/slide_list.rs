use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::{
    error::KioskError,
    position_cache::CachedOrder,
    types::{NormalizedEvent, SignedUrls, Slide, SlideId, SlideKind},
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    slide: Slide,
    /// Receipt rank; breaks position ties.
    arrival: u64,
}

/// Snapshot taken before an optimistic mutation.
#[derive(Debug, Clone)]
#[must_use = "dropping a rollback handle makes the optimistic change permanent"]
pub struct Rollback {
    entries: Vec<Entry>,
    /// Ids present right after the mutation.
    applied: HashSet<SlideId>,
}

/// A slide removed by `apply_delete`, kept so the removal can be undone.
#[derive(Debug, Clone)]
pub struct RemovedSlide {
    slide: Slide,
    arrival: u64,
}

impl RemovedSlide {
    pub fn slide(&self) -> &Slide {
        &self.slide
    }
}

/// Authoritative in-memory ordering of one collection.
///
/// Ordered by `(position, arrival)`; ids are unique. `revision` only moves
/// when the visible list changes, so a no-op never triggers a re-render.
#[derive(Debug, Clone)]
pub struct SlideList {
    entries: Vec<Entry>,
    next_arrival: u64,
    revision: u64,
    max_slides: usize,
    loaded: bool,
}

impl SlideList {
    pub fn new(max_slides: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_arrival: 0,
            revision: 0,
            max_slides: max_slides.max(1),
            loaded: false,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether a full load has completed at least once.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slide> {
        self.entries.iter().map(|entry| &entry.slide)
    }

    /// Slides in display order.
    pub fn to_vec(&self) -> Vec<Slide> {
        self.iter().cloned().collect()
    }

    pub fn ids(&self) -> Vec<SlideId> {
        self.iter().map(|slide| slide.id.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Slide> {
        self.iter().find(|slide| slide.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.slide.id == id)
    }

    /// Slots left before the collection is full.
    pub fn remaining_capacity(&self) -> usize {
        self.max_slides.saturating_sub(self.entries.len())
    }

    /// Reject additions that would break the count cap or the single
    /// liveboard rule.
    pub fn ensure_can_add(&self, kind: SlideKind) -> Result<(), KioskError> {
        if self.remaining_capacity() == 0 {
            return Err(KioskError::validation(
                "slide_limit_reached",
                format!("a kiosk can hold at most {} slides", self.max_slides),
            ));
        }
        if kind == SlideKind::Liveboard && self.iter().any(|s| s.kind == SlideKind::Liveboard) {
            return Err(KioskError::validation(
                "duplicate_liveboard",
                "the live scoreboard slide is already in the kiosk",
            ));
        }
        Ok(())
    }

    /// Apply a normalized event. Returns `true` when the list changed.
    pub fn apply_event(&mut self, event: NormalizedEvent) -> bool {
        match event {
            NormalizedEvent::Inserted(slide) => self.apply_insert(slide),
            NormalizedEvent::BatchApplied(batch) => self.apply_batch_positions(&batch),
            NormalizedEvent::Deleted { id } => self.apply_delete(&id).is_some(),
            NormalizedEvent::SettingsUpdated(_) => false,
        }
    }

    /// Insert one slide; ignored when the id is already present.
    pub fn apply_insert(&mut self, slide: Slide) -> bool {
        if !self.push_new(slide) {
            return false;
        }
        self.sort();
        self.bump();
        true
    }

    /// Insert several slides with a single revision bump. Returns how many
    /// were new.
    pub fn apply_insert_many(&mut self, slides: Vec<Slide>) -> usize {
        let mut inserted = 0;
        for slide in slides {
            if self.push_new(slide) {
                inserted += 1;
            }
        }
        if inserted > 0 {
            self.sort();
            self.bump();
        }
        inserted
    }

    /// Apply one flushed position batch atomically. Unknown ids are skipped;
    /// an unchanged batch is a no-op.
    pub fn apply_batch_positions(&mut self, batch: &HashMap<SlideId, i64>) -> bool {
        let differs = self.entries.iter().any(|entry| {
            batch
                .get(&entry.slide.id)
                .is_some_and(|position| *position != entry.slide.position)
        });
        if !differs {
            trace!(size = batch.len(), "position batch is a no-op");
            return false;
        }

        for entry in &mut self.entries {
            if let Some(position) = batch.get(&entry.slide.id) {
                entry.slide.position = *position;
            }
        }
        self.sort();
        self.bump();
        true
    }

    /// Remove a slide by id.
    pub fn apply_delete(&mut self, id: &str) -> Option<RemovedSlide> {
        let index = self.index_of(id)?;
        let entry = self.entries.remove(index);
        self.bump();
        Some(RemovedSlide {
            slide: entry.slide,
            arrival: entry.arrival,
        })
    }

    /// Undo `apply_delete`, keeping the slide's original tie-break rank.
    pub fn restore_deleted(&mut self, removed: RemovedSlide) -> bool {
        if self.contains(&removed.slide.id) {
            return false;
        }
        self.entries.push(Entry {
            slide: removed.slide,
            arrival: removed.arrival,
        });
        self.sort();
        self.bump();
        true
    }

    /// Fill signed URLs for one slide.
    pub fn apply_media(&mut self, id: &str, urls: &SignedUrls) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|entry| entry.slide.id == id) else {
            return false;
        };
        if !entry.slide.apply_signed_urls(urls) {
            return false;
        }
        self.bump();
        true
    }

    /// Mark a slide's media as still owed.
    pub fn mark_media_pending(&mut self, id: &str) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|entry| entry.slide.id == id) else {
            return false;
        };
        if entry.slide.media_pending {
            return false;
        }
        entry.slide.media_pending = true;
        self.bump();
        true
    }

    /// Snapshot, run `mutation` over the ordered slides, and re-sort.
    ///
    /// Surviving ids keep their arrival rank; new ids get fresh ranks;
    /// duplicate ids produced by `mutation` are dropped.
    pub fn apply_optimistic<F>(&mut self, mutation: F) -> Rollback
    where
        F: FnOnce(&mut Vec<Slide>),
    {
        let snapshot = self.entries.clone();
        let mut slides = self.to_vec();
        mutation(&mut slides);

        let arrivals: HashMap<SlideId, u64> = snapshot
            .iter()
            .map(|entry| (entry.slide.id.clone(), entry.arrival))
            .collect();
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(slides.len());
        for slide in slides {
            if !seen.insert(slide.id.clone()) {
                continue;
            }
            let arrival = match arrivals.get(&slide.id) {
                Some(arrival) => *arrival,
                None => self.take_arrival(),
            };
            entries.push(Entry { slide, arrival });
        }

        self.entries = entries;
        self.sort();
        if self.entries != snapshot {
            self.bump();
        }
        Rollback {
            entries: snapshot,
            applied: self.entries.iter().map(|e| e.slide.id.clone()).collect(),
        }
    }

    /// Undo the change made by `apply_optimistic`.
    ///
    /// Slides restore their snapshot position. Inserts and deletes applied
    /// after the mutation are kept, as is newer slide data such as resolved
    /// media.
    pub fn rollback(&mut self, rollback: Rollback) -> bool {
        let Rollback { entries, applied } = rollback;
        let mut current: HashMap<SlideId, Entry> = self
            .entries
            .iter()
            .map(|entry| (entry.slide.id.clone(), entry.clone()))
            .collect();

        let mut restored = Vec::with_capacity(entries.len().max(current.len()));
        for mut entry in entries {
            match current.remove(&entry.slide.id) {
                Some(now) => {
                    let position = entry.slide.position;
                    entry.slide = now.slide;
                    entry.slide.position = position;
                    restored.push(entry);
                }
                // Removed by the mutation itself.
                None if !applied.contains(&entry.slide.id) => restored.push(entry),
                // Deleted since.
                None => {}
            }
        }
        // Whatever is left arrived after the mutation, unless the mutation
        // itself added it.
        restored.extend(
            current
                .into_values()
                .filter(|entry| !applied.contains(&entry.slide.id)),
        );
        restored.sort_by_key(|entry| (entry.slide.position, entry.arrival));

        if self.entries == restored {
            return false;
        }
        debug!(slides = restored.len(), "rolling back optimistic change");
        self.entries = restored;
        self.bump();
        true
    }

    /// Replace the list wholesale after a fetch, re-applying `cached` first.
    pub fn load_full(&mut self, mut slides: Vec<Slide>, cached: Option<&CachedOrder>) -> bool {
        if let Some(cached) = cached {
            cached.apply(&mut slides);
        }

        let mut seen = HashSet::new();
        let entries: Vec<Entry> = slides
            .into_iter()
            .filter(|slide| seen.insert(slide.id.clone()))
            .enumerate()
            .map(|(index, slide)| Entry {
                slide,
                arrival: index as u64,
            })
            .collect();

        let unchanged = self.loaded
            && entries.len() == self.entries.len()
            && entries
                .iter()
                .zip(&self.entries)
                .all(|(a, b)| a.slide == b.slide);

        self.next_arrival = entries.len() as u64;
        self.entries = entries;
        self.sort();
        self.loaded = true;

        if unchanged {
            return false;
        }
        self.bump();
        true
    }

    fn push_new(&mut self, slide: Slide) -> bool {
        if self.contains(&slide.id) {
            trace!(slide_id = %slide.id, "skipping duplicate insert");
            return false;
        }
        let arrival = self.take_arrival();
        self.entries.push(Entry { slide, arrival });
        true
    }

    fn take_arrival(&mut self) -> u64 {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        arrival
    }

    fn sort(&mut self) {
        self.entries
            .sort_by_key(|entry| (entry.slide.position, entry.arrival));
    }

    fn bump(&mut self) {
        self.revision += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slide(id: &str, position: i64) -> Slide {
        Slide::image(id, position, format!("boards/{id}.png"))
    }

    fn order(list: &SlideList) -> Vec<String> {
        list.ids()
    }

    fn loaded(slides: &[(&str, i64)]) -> SlideList {
        let mut list = SlideList::new(20);
        list.load_full(
            slides.iter().map(|(id, pos)| slide(id, *pos)).collect(),
            None,
        );
        list
    }

    #[test]
    fn insert_skips_duplicate_ids_and_sorts() {
        let mut list = loaded(&[("a", 0), ("c", 2)]);
        assert!(list.apply_insert(slide("b", 1)));
        assert!(!list.apply_insert(slide("b", 7)));
        assert_eq!(order(&list), ["a", "b", "c"]);
        assert_eq!(list.get("b").map(|s| s.position), Some(1));
    }

    #[test]
    fn ties_are_broken_by_arrival_not_id() {
        let mut list = SlideList::new(20);
        list.apply_insert(slide("z", 1));
        list.apply_insert(slide("a", 1));
        list.apply_insert(slide("m", 0));
        assert_eq!(order(&list), ["m", "z", "a"]);
    }

    #[test]
    fn unchanged_batch_is_reference_stable() {
        let mut list = loaded(&[("a", 0), ("b", 1)]);
        let batch = HashMap::from([("a".to_owned(), 1), ("b".to_owned(), 0)]);

        assert!(list.apply_batch_positions(&batch));
        let revision = list.revision();
        assert!(!list.apply_batch_positions(&batch));
        assert_eq!(list.revision(), revision);
        assert_eq!(order(&list), ["b", "a"]);
    }

    #[test]
    fn batch_ignores_unknown_ids() {
        let mut list = loaded(&[("a", 0)]);
        let batch = HashMap::from([("ghost".to_owned(), 4)]);
        assert!(!list.apply_batch_positions(&batch));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn delete_and_restore_keeps_tie_rank() {
        let mut list = loaded(&[("a", 0), ("b", 0), ("c", 0)]);
        let removed = list.apply_delete("a").expect("a exists");
        assert_eq!(order(&list), ["b", "c"]);
        assert!(list.apply_delete("a").is_none());

        assert!(list.restore_deleted(removed));
        assert_eq!(order(&list), ["a", "b", "c"]);
    }

    #[test]
    fn optimistic_mutation_rolls_back_exactly() {
        let mut list = loaded(&[("x", 0), ("y", 1), ("z", 2)]);
        let rollback = list.apply_optimistic(|slides| {
            let moved = slides.remove(2);
            slides.insert(0, moved);
            for (index, slide) in slides.iter_mut().enumerate() {
                slide.position = index as i64;
            }
        });
        assert_eq!(order(&list), ["z", "x", "y"]);

        assert!(list.rollback(rollback));
        assert_eq!(order(&list), ["x", "y", "z"]);
        assert_eq!(list.get("z").map(|s| s.position), Some(2));
    }

    fn move_last_to_front(slides: &mut Vec<Slide>) {
        let moved = slides.remove(slides.len() - 1);
        slides.insert(0, moved);
        for (index, slide) in slides.iter_mut().enumerate() {
            slide.position = index as i64;
        }
    }

    #[test]
    fn rollback_keeps_slides_inserted_after_the_mutation() {
        let mut list = loaded(&[("x", 0), ("y", 1), ("z", 2)]);
        let rollback = list.apply_optimistic(move_last_to_front);
        assert!(list.apply_insert(slide("w", 3)));

        assert!(list.rollback(rollback));
        assert_eq!(order(&list), ["x", "y", "z", "w"]);
    }

    #[test]
    fn rollback_does_not_resurrect_slides_deleted_after_the_mutation() {
        let mut list = loaded(&[("x", 0), ("y", 1), ("z", 2)]);
        let rollback = list.apply_optimistic(move_last_to_front);
        list.apply_delete("y").expect("y exists");

        assert!(list.rollback(rollback));
        assert_eq!(order(&list), ["x", "z"]);
        assert_eq!(list.get("z").map(|s| s.position), Some(2));
    }

    #[test]
    fn rollback_undoes_membership_changes_made_by_the_mutation() {
        let mut list = loaded(&[("x", 0), ("y", 1)]);
        let rollback = list.apply_optimistic(|slides| {
            slides.retain(|s| s.id != "x");
            slides.push(slide("tmp", 5));
        });
        assert_eq!(order(&list), ["y", "tmp"]);

        assert!(list.rollback(rollback));
        assert_eq!(order(&list), ["x", "y"]);
    }

    #[test]
    fn rollback_keeps_media_resolved_after_the_mutation() {
        let mut list = loaded(&[("x", 0), ("y", 1)]);
        let rollback = list.apply_optimistic(|slides| slides.reverse());
        let urls = SignedUrls::from([(
            "boards/x.png".to_owned(),
            "https://cdn.test/x.png?sig=1".to_owned(),
        )]);
        assert!(list.apply_media("x", &urls));

        list.rollback(rollback);
        assert_eq!(
            list.get("x").and_then(|s| s.image_url.as_deref()),
            Some("https://cdn.test/x.png?sig=1")
        );
    }

    #[test]
    fn load_full_applies_cached_order_first() {
        let cached = CachedOrder::from_ordered_ids(&["b".to_owned(), "a".to_owned()], 0);
        let mut list = SlideList::new(20);
        list.load_full(vec![slide("a", 0), slide("b", 1)], Some(&cached));
        assert_eq!(order(&list), ["b", "a"]);
        assert!(list.is_loaded());
    }

    #[test]
    fn identical_reload_does_not_bump_revision() {
        let mut list = loaded(&[("a", 0), ("b", 1)]);
        let revision = list.revision();
        assert!(!list.load_full(vec![slide("a", 0), slide("b", 1)], None));
        assert_eq!(list.revision(), revision);
    }

    #[test]
    fn insert_many_bumps_revision_once() {
        let mut list = loaded(&[("a", 0)]);
        let revision = list.revision();
        let inserted = list.apply_insert_many(vec![slide("b", 1), slide("a", 9), slide("c", 2)]);
        assert_eq!(inserted, 2);
        assert_eq!(list.revision(), revision + 1);
        assert_eq!(order(&list), ["a", "b", "c"]);
    }

    #[test]
    fn enforces_slide_limit_and_single_liveboard() {
        let mut list = SlideList::new(2);
        list.apply_insert(Slide::liveboard("live", 0));
        let err = list
            .ensure_can_add(SlideKind::Liveboard)
            .expect_err("second liveboard must be rejected");
        assert_eq!(err.code, "duplicate_liveboard");

        list.apply_insert(slide("a", 1));
        let err = list
            .ensure_can_add(SlideKind::Image)
            .expect_err("full collection must be rejected");
        assert_eq!(err.code, "slide_limit_reached");
        assert_eq!(list.remaining_capacity(), 0);
    }

    #[test]
    fn media_resolution_updates_slide_once() {
        let mut list = loaded(&[("a", 0)]);
        let urls = SignedUrls::from([("boards/a.png".to_owned(), "https://cdn/a".to_owned())]);
        assert!(list.mark_media_pending("a"));
        assert!(list.apply_media("a", &urls));
        assert!(!list.apply_media("a", &urls));
        let slide = list.get("a").expect("present");
        assert_eq!(slide.image_url.as_deref(), Some("https://cdn/a"));
        assert!(!slide.media_pending);
    }

    #[test]
    fn random_operation_sequences_stay_sorted_and_unique() {
        let mut seed: u64 = 0x5eed;
        let mut next = move |bound: u64| {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) % bound
        };

        let mut list = SlideList::new(20);
        for _ in 0..2_000 {
            let id = format!("s{}", next(12));
            match next(3) {
                0 => {
                    list.apply_insert(slide(&id, next(6) as i64));
                }
                1 => {
                    let batch = (0..next(4))
                        .map(|_| (format!("s{}", next(12)), next(6) as i64))
                        .collect::<HashMap<_, _>>();
                    list.apply_batch_positions(&batch);
                }
                _ => {
                    list.apply_delete(&id);
                }
            }

            let positions: Vec<_> = list
                .entries
                .iter()
                .map(|e| (e.slide.position, e.arrival))
                .collect();
            assert!(positions.windows(2).all(|w| w[0] <= w[1]));
            let unique: HashSet<_> = list.iter().map(|s| s.id.clone()).collect();
            assert_eq!(unique.len(), list.len());
        }
    }
}
