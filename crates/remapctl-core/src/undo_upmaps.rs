//! Incrementally remove upmap entries so that the given OSDs become backfill
//! sources (or targets), spreading the work fairly across them.

use crate::mapping::{with_from, with_to, MappingState};
use crate::planner::{remap_least_busy_pg, PlannerError};
use crate::Osd;

/// Undo upmap entries whose `to` (or, with `osds_are_targets`, whose `from`)
/// is one of the given OSDs.
///
/// For fairness the OSD list is walked round-robin, adding at most one
/// backfill per OSD per pass, until a full pass changes nothing. Within an
/// OSD's turn the least busy undo wins. Callers shuffle the OSD list for
/// fairness across repeated runs.
pub fn undo_upmaps(
    state: &MappingState,
    osds: &[Osd],
    osds_are_targets: bool,
) -> Result<(), PlannerError> {
    let mut something_changed = true;
    while something_changed {
        something_changed = false;

        for &osd in osds {
            let filter = if osds_are_targets {
                with_from(osd)
            } else {
                with_to(osd)
            };
            let mut candidates = state.mappings_matching(&filter);
            // Undoing a mapping means scheduling the opposite movement.
            for candidate in &mut candidates {
                let m = &mut candidate.mapping;
                std::mem::swap(&mut m.from, &mut m.to);
            }

            if remap_least_busy_pg(state, &candidates)?.is_some() {
                something_changed = true;
            }
        }
    }
    Ok(())
}
