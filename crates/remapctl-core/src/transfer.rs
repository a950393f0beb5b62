//! Export mappings for later replay, and import them back, composing each
//! entry with whatever the upmap table looks like now.

use crate::mapping::{any_of, with_from, with_pgid, with_to, MappingState, PgMapping};
use crate::planner::PlannerError;
use crate::Osd;

/// The live mappings in which any of the given OSDs participates (as either
/// side). With `whole_pg`, widen to every mapping of each touched PG.
pub fn export_mappings(state: &MappingState, osds: &[Osd], whole_pg: bool) -> Vec<PgMapping> {
    let mut filters = Vec::new();
    for &osd in osds {
        filters.push(with_from(osd));
        filters.push(with_to(osd));
    }
    let mut mappings = state.mappings_matching(&any_of(filters));

    if whole_pg {
        let pg_filters = mappings
            .iter()
            .map(|pm| with_pgid(pm.pgid.clone()))
            .collect();
        mappings = state.mappings_matching(&any_of(pg_filters));
    }

    mappings
}

/// Apply previously exported mappings.
///
/// Two cases per entry: the mapping is simply gone from the table and can be
/// re-issued as exported, or the table now holds a different mapping from
/// the same source OSD, in which case that live chain is what gets
/// retargeted.
pub fn import_mappings(state: &MappingState, mappings: &[PgMapping]) -> Result<(), PlannerError> {
    for pm in mappings {
        let existing = state.mappings_matching(&with_pgid(pm.pgid.clone()));
        match existing
            .iter()
            .find(|e| e.mapping.from == pm.mapping.from)
        {
            Some(e) if e.mapping.to == pm.mapping.to => {
                // Already in place.
            }
            Some(e) => {
                state.must_remap(&pm.pgid, e.mapping.to, pm.mapping.to)?;
            }
            None => {
                state.must_remap(&pm.pgid, pm.mapping.from, pm.mapping.to)?;
            }
        }
    }
    Ok(())
}
