use tracing::debug;

use crate::{
    error::{KioskError, KioskErrorCategory},
    slide_list::{Rollback, SlideList},
    types::{SlideId, SlidePosition},
};

/// Reorder interaction phase.
#[derive(Debug, Clone, Default)]
pub enum ReorderPhase {
    #[default]
    Idle,
    Dragging {
        source_id: SlideId,
    },
    /// Optimistic order applied; waiting on the server.
    Persisting {
        positions: Vec<SlidePosition>,
        rollback: Rollback,
    },
}

impl ReorderPhase {
    fn label(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Dragging { .. } => "Dragging",
            Self::Persisting { .. } => "Persisting",
        }
    }
}

/// What the runtime must persist after a successful drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorderPlan {
    /// Full `{id, position}` list in the new order.
    pub positions: Vec<SlidePosition>,
}

impl ReorderPlan {
    pub fn ordered_ids(&self) -> Vec<SlideId> {
        self.positions.iter().map(|p| p.id.clone()).collect()
    }
}

/// Drag-and-drop reorder state machine:
/// `Idle -> Dragging -> (Dropped) -> Persisting -> Idle`.
#[derive(Debug, Clone, Default)]
pub struct ReorderController {
    phase: ReorderPhase,
}

impl ReorderController {
    pub fn phase(&self) -> &ReorderPhase {
        &self.phase
    }

    pub fn is_persisting(&self) -> bool {
        matches!(self.phase, ReorderPhase::Persisting { .. })
    }

    /// Begin dragging `source_id`. Rejected while a reorder is persisting.
    pub fn drag_start(&mut self, source_id: &str, list: &SlideList) -> Result<(), KioskError> {
        if self.is_persisting() {
            return Err(KioskError::new(
                KioskErrorCategory::Validation,
                "reorder_in_flight",
                "wait for the previous reorder to finish",
            ));
        }
        if !list.contains(source_id) {
            return Err(KioskError::slide_not_found(source_id));
        }
        debug!(source_id, "drag started");
        self.phase = ReorderPhase::Dragging {
            source_id: source_id.to_owned(),
        };
        Ok(())
    }

    /// Abandon the current drag.
    pub fn cancel_drag(&mut self) {
        if matches!(self.phase, ReorderPhase::Dragging { .. }) {
            self.phase = ReorderPhase::Idle;
        }
    }

    /// Drop onto `target_id`'s slot.
    ///
    /// Applies the new order optimistically and moves to `Persisting`.
    /// Dropping onto itself or onto a vanished slide returns to `Idle` and
    /// yields no plan.
    pub fn drop_on(
        &mut self,
        target_id: &str,
        list: &mut SlideList,
    ) -> Result<Option<ReorderPlan>, KioskError> {
        let ReorderPhase::Dragging { source_id } = &self.phase else {
            return Err(KioskError::invalid_state(self.phase.label(), "drop"));
        };
        let source_id = source_id.clone();

        let Some(positions) = compute_reorder(&list.ids(), &source_id, target_id) else {
            debug!(%source_id, target_id, "drop produced no change");
            self.phase = ReorderPhase::Idle;
            return Ok(None);
        };

        let rollback = list.apply_optimistic(|slides| {
            let by_id: std::collections::HashMap<&str, i64> = positions
                .iter()
                .map(|p| (p.id.as_str(), p.position))
                .collect();
            for slide in slides.iter_mut() {
                if let Some(position) = by_id.get(slide.id.as_str()) {
                    slide.position = *position;
                }
            }
        });

        debug!(%source_id, target_id, "reorder applied optimistically");
        self.phase = ReorderPhase::Persisting {
            positions: positions.clone(),
            rollback,
        };
        Ok(Some(ReorderPlan { positions }))
    }

    /// Resolve the in-flight persist.
    ///
    /// On failure the optimistic order is rolled back. Returns the plan that
    /// was persisted when successful.
    pub fn on_persist_result(
        &mut self,
        success: bool,
        list: &mut SlideList,
    ) -> Result<Option<ReorderPlan>, KioskError> {
        let phase = std::mem::take(&mut self.phase);
        let ReorderPhase::Persisting {
            positions,
            rollback,
        } = phase
        else {
            let label = phase.label();
            self.phase = phase;
            return Err(KioskError::invalid_state(label, "on_persist_result"));
        };

        if success {
            Ok(Some(ReorderPlan { positions }))
        } else {
            list.rollback(rollback);
            Ok(None)
        }
    }
}

/// New sequential positions after moving `source_id` into `target_id`'s
/// index. `None` when either id is missing or they are the same.
pub fn compute_reorder(
    ordered_ids: &[SlideId],
    source_id: &str,
    target_id: &str,
) -> Option<Vec<SlidePosition>> {
    if source_id == target_id {
        return None;
    }
    let from = ordered_ids.iter().position(|id| id == source_id)?;
    let to = ordered_ids.iter().position(|id| id == target_id)?;

    let mut ids = ordered_ids.to_vec();
    let moved = ids.remove(from);
    ids.insert(to, moved);

    Some(
        ids.into_iter()
            .enumerate()
            .map(|(index, id)| SlidePosition {
                id,
                position: index as i64,
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Slide;

    fn xyz() -> SlideList {
        let mut list = SlideList::new(20);
        list.load_full(
            vec![
                Slide::image("X", 0, "x.png"),
                Slide::image("Y", 1, "y.png"),
                Slide::image("Z", 2, "z.png"),
            ],
            None,
        );
        list
    }

    #[test]
    fn drag_last_before_first_then_fail_rolls_back() {
        let mut list = xyz();
        let mut controller = ReorderController::default();

        controller.drag_start("Z", &list).expect("drag should start");
        let plan = controller
            .drop_on("X", &mut list)
            .expect("drop should work")
            .expect("order changed");
        assert_eq!(plan.ordered_ids(), ["Z", "X", "Y"]);
        assert_eq!(list.ids(), ["Z", "X", "Y"]);
        assert!(controller.is_persisting());

        let outcome = controller
            .on_persist_result(false, &mut list)
            .expect("persist result should resolve");
        assert_eq!(outcome, None);
        assert_eq!(list.ids(), ["X", "Y", "Z"]);
        assert!(matches!(controller.phase(), ReorderPhase::Idle));
    }

    #[test]
    fn successful_persist_keeps_optimistic_order() {
        let mut list = xyz();
        let mut controller = ReorderController::default();
        controller.drag_start("X", &list).expect("drag");
        controller.drop_on("Z", &mut list).expect("drop");

        let plan = controller
            .on_persist_result(true, &mut list)
            .expect("resolve")
            .expect("plan returned on success");
        assert_eq!(plan.ordered_ids(), ["Y", "Z", "X"]);
        assert_eq!(list.ids(), ["Y", "Z", "X"]);
        assert_eq!(
            list.iter().map(|s| s.position).collect::<Vec<_>>(),
            [0, 1, 2]
        );
    }

    #[test]
    fn rejects_new_drag_while_persisting() {
        let mut list = xyz();
        let mut controller = ReorderController::default();
        controller.drag_start("Y", &list).expect("drag");
        controller.drop_on("X", &mut list).expect("drop");

        let err = controller
            .drag_start("Z", &list)
            .expect_err("second drag must be rejected");
        assert_eq!(err.code, "reorder_in_flight");
    }

    #[test]
    fn drop_on_self_returns_to_idle_without_plan() {
        let mut list = xyz();
        let mut controller = ReorderController::default();
        controller.drag_start("Y", &list).expect("drag");
        let revision = list.revision();

        assert_eq!(controller.drop_on("Y", &mut list).expect("drop"), None);
        assert!(matches!(controller.phase(), ReorderPhase::Idle));
        assert_eq!(list.revision(), revision);
    }

    #[test]
    fn drop_without_drag_is_invalid() {
        let mut list = xyz();
        let mut controller = ReorderController::default();
        let err = controller
            .drop_on("X", &mut list)
            .expect_err("drop needs a drag");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn unknown_source_is_rejected() {
        let list = xyz();
        let mut controller = ReorderController::default();
        let err = controller
            .drag_start("nope", &list)
            .expect_err("unknown slide");
        assert_eq!(err.code, "slide_not_found");
    }

    #[test]
    fn compute_reorder_matches_array_move() {
        let ids: Vec<SlideId> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let moved = compute_reorder(&ids, "b", "d").expect("valid move");
        let order: Vec<_> = moved.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(order, ["a", "c", "d", "b"]);
        assert!(compute_reorder(&ids, "a", "missing").is_none());
    }
}
