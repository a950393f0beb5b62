//! Shared planner plumbing: the umbrella error type and the least-busy
//! candidate selection used by drain and undo-upmaps.

use thiserror::Error;

use crate::cluster::ClusterError;
use crate::crush_change::CrushDiffError;
use crate::mapping::{MappingState, PgMapping, RemapError};
use crate::placement::PlacementError;
use crate::snapshot::SnapshotError;
use crate::topology::TopologyError;
use crate::Osd;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error(transparent)]
    Remap(#[from] RemapError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    CrushDiff(#[from] CrushDiffError),
    #[error("osd {0} does not exist")]
    NoSuchOsd(Osd),
    #[error("osd {0} is 'out' but has PGs in its up set")]
    OutOsdWithUpPgs(Osd),
}

/// Apply the candidate whose target OSD has the lowest busyness score and
/// room for the reservation, returning the chosen PG. Candidates rejected by
/// budget record `NoReservationAvailable`; `Ok(None)` means nothing fit.
pub(crate) fn remap_least_busy_pg(
    state: &MappingState,
    candidates: &[PgMapping],
) -> Result<Option<String>, PlannerError> {
    let mut best: Option<(usize, &PgMapping)> = None;

    for candidate in candidates {
        let m = &candidate.mapping;
        if !state.has_room_for(&candidate.pgid, m.from, m.to)? {
            state.note_no_reservation();
            continue;
        }
        let score = state.busyness_score(m.to);
        if best.map_or(true, |(best_score, _)| score < best_score) {
            best = Some((score, candidate));
        }
    }

    let Some((_, candidate)) = best else {
        return Ok(None);
    };
    state.must_remap(&candidate.pgid, candidate.mapping.from, candidate.mapping.to)?;
    Ok(Some(candidate.pgid.clone()))
}
