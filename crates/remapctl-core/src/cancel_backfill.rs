//! Drive the up set of every PG in backfill back onto its acting set,
//! cancelling the data movement the current upmap/CRUSH state implies.

use std::collections::{HashMap, HashSet};

use futures::stream::{self, TryStreamExt};

use crate::mapping::MappingState;
use crate::placement::{complete_acting_from_peers, reorder_up_to_match_acting, PgBrief};
use crate::planner::PlannerError;
use crate::snapshot::ClusterView;
use crate::{Osd, OSD_NONE};

#[derive(Debug, Clone)]
pub struct CancelBackfillOptions {
    /// Leave already-started backfills alone.
    pub exclude_backfilling: bool,
    /// Narrow the include/exclude tests to the acting side of each slot
    /// (the backfill sources).
    pub source: bool,
    /// Narrow the include/exclude tests to the up side of each slot (the
    /// backfill targets).
    pub target: bool,
    pub excluded_osds: HashSet<Osd>,
    pub included_osds: HashSet<Osd>,
    /// When non-empty, only PGs whose up or acting set touches one of these
    /// OSDs are considered, and every backfill slot of a matching PG is
    /// cancelled.
    pub pgs_including_osds: HashSet<Osd>,
    pub concurrency: usize,
}

impl Default for CancelBackfillOptions {
    fn default() -> Self {
        Self {
            exclude_backfilling: false,
            source: false,
            target: false,
            excluded_osds: HashSet::new(),
            included_osds: HashSet::new(),
            pgs_including_osds: HashSet::new(),
            concurrency: 5,
        }
    }
}

/// Cancel pending backfill by pointing each PG's up set back at its acting
/// set. Degraded PGs get their acting set reconstructed via a PG query
/// first; PGs that cannot be reconstructed are skipped with a warning, as
/// are slots whose remap conflicts with existing mappings.
///
/// The per-PG work fans out over a bounded worker pool because degraded-PG
/// queries are slow.
pub async fn cancel_backfill(
    view: &ClusterView,
    state: &MappingState,
    opts: &CancelBackfillOptions,
) -> Result<(), PlannerError> {
    let briefs: Vec<PgBrief> = view.pg_briefs().await?.to_vec();
    // The raw upmap items (stale entries included) feed the reorder
    // indirection when realigning against a reconstructed acting set.
    let upmaps: HashMap<String, HashMap<Osd, Osd>> = view
        .osd_dump()
        .await?
        .pg_upmap_items
        .iter()
        .map(|item| {
            let to_from = item.mappings.iter().map(|m| (m.to, m.from)).collect();
            (item.pgid.clone(), to_from)
        })
        .collect();

    let concurrency = opts.concurrency.max(1);
    stream::iter(briefs.into_iter().map(Ok::<_, PlannerError>))
        .try_for_each_concurrent(Some(concurrency), |pgb| {
            let upmaps = &upmaps;
            async move { cancel_one(view, state, opts, upmaps, pgb).await }
        })
        .await
}

async fn cancel_one(
    view: &ClusterView,
    state: &MappingState,
    opts: &CancelBackfillOptions,
    upmaps: &HashMap<String, HashMap<Osd, Osd>>,
    pgb: PgBrief,
) -> Result<(), PlannerError> {
    if !pgb.in_backfill() {
        return Ok(());
    }
    if opts.exclude_backfilling && pgb.state.contains("backfilling") {
        return Ok(());
    }

    let mut up = pgb.up.clone();
    let mut acting = pgb.acting.clone();

    if acting.contains(&OSD_NONE) {
        let query = view.pg_query(&pgb.pgid).await?;
        match complete_acting_from_peers(&query) {
            Ok(reconstructed) => {
                acting = reconstructed;
                let pools = view.pools().await?;
                reorder_up_to_match_acting(
                    pools,
                    &pgb.pgid,
                    &mut up,
                    &acting,
                    upmaps.get(&pgb.pgid),
                )?;
            }
            Err(err) => {
                tracing::warn!(pgid = %pgb.pgid, error = %err, "cannot reconstruct acting set; skipping");
                return Ok(());
            }
        }
    }
    if up.len() != acting.len() {
        return Ok(());
    }

    if !opts.pgs_including_osds.is_empty() {
        let touches = acting
            .iter()
            .chain(up.iter())
            .any(|osd| opts.pgs_including_osds.contains(osd));
        if !touches {
            return Ok(());
        }
    }

    let excluded = |osd: Osd| opts.excluded_osds.contains(&osd);
    // An empty include list includes everything.
    let included = |osd: Osd| opts.included_osds.is_empty() || opts.included_osds.contains(&osd);

    for (&u, &a) in up.iter().zip(acting.iter()) {
        if u == a || u == OSD_NONE || a == OSD_NONE {
            continue;
        }

        if opts.source == opts.target {
            // Neither (or both) side flags: either side of the slot counts.
            if excluded(u) || excluded(a) {
                continue;
            }
            if !(included(u) || included(a)) {
                continue;
            }
        } else {
            if opts.source && excluded(a) || opts.target && excluded(u) {
                continue;
            }
            if !(opts.source && included(a) || opts.target && included(u)) {
                continue;
            }
        }

        // Remaps can fail here in complex cases: an upmap item already
        // exists for one of the OSDs, or an OSD appears in both the up and
        // acting sets. Common on EC pools after a CRUSH change, and often
        // not cancellable through the exception table at all.
        if let Err(err) = state.try_remap(&pgb.pgid, u, a) {
            tracing::warn!(error = %err, "unable to cancel backfill slot");
        }
    }
    Ok(())
}
