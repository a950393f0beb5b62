//! Move PGs off one source OSD onto a set of target OSDs, constrained by
//! CRUSH locality and reservation budgets. No attempt is made to balance
//! target fullness; the least busy target and PG win.

use crate::mapping::{Mapping, MappingState, PgMapping};
use crate::placement::PgBrief;
use crate::planner::{remap_least_busy_pg, PlannerError};
use crate::snapshot::ClusterView;
use crate::topology::CrushTree;
use crate::Osd;

#[derive(Debug, Clone)]
pub struct DrainOptions {
    pub source_osd: Osd,
    pub target_osds: Vec<Osd>,
    /// The lowest CRUSH bucket type across which shards/replicas may move.
    /// `None` keeps every movement within the source's direct bucket. This
    /// is not validated against CRUSH rules; the cluster rejects edits that
    /// violate them.
    pub allow_movement_across: Option<String>,
}

pub async fn drain(
    view: &ClusterView,
    state: &MappingState,
    opts: &DrainOptions,
) -> Result<(), PlannerError> {
    let tree = view.crush_tree().await?;

    for osd in std::iter::once(opts.source_osd).chain(opts.target_osds.iter().copied()) {
        match tree.node_by_id(osd) {
            Some(node) if node.is_osd() => {}
            _ => return Err(PlannerError::NoSuchOsd(osd)),
        }
    }

    let mut candidates = candidate_mappings(tree, state, opts)?;
    while !candidates.is_empty() {
        let Some(pgid) = remap_least_busy_pg(state, &candidates)? else {
            break;
        };
        // One move per PG.
        candidates.retain(|c| c.pgid != pgid);
    }
    Ok(())
}

fn candidate_mappings(
    tree: &CrushTree,
    state: &MappingState,
    opts: &DrainOptions,
) -> Result<Vec<PgMapping>, PlannerError> {
    let crush_type = opts.allow_movement_across.as_deref();
    let mut candidates = Vec::new();
    for pgb in state.pgs_with_up_osd(opts.source_osd) {
        for &target in &opts.target_osds {
            if is_candidate(tree, crush_type, opts.source_osd, target, &pgb)? {
                candidates.push(PgMapping {
                    pgid: pgb.pgid.clone(),
                    mapping: Mapping::new(opts.source_osd, target),
                });
            }
        }
    }
    Ok(candidates)
}

fn is_candidate(
    tree: &CrushTree,
    crush_type: Option<&str>,
    source: Osd,
    target: Osd,
    pgb: &PgBrief,
) -> Result<bool, PlannerError> {
    if target == source {
        return Ok(false);
    }

    let source_node = tree
        .node_by_id(source)
        .ok_or(PlannerError::NoSuchOsd(source))?;
    let target_node = tree
        .node_by_id(target)
        .ok_or(PlannerError::NoSuchOsd(target))?;

    let Some(crush_type) = crush_type else {
        // Movement must stay within the source's direct CRUSH bucket.
        return Ok(tree.parent_id(target_node) == tree.parent_id(source_node));
    };

    // Movement is allowed between buckets of the given type that share the
    // next level up, as long as no other shard/replica of the PG already
    // lives in the target's bucket.
    let source_bucket = tree.require_ancestor_of_type(source_node, crush_type)?;
    let target_bucket = tree.require_ancestor_of_type(target_node, crush_type)?;
    if tree.parent_id(source_bucket) != tree.parent_id(target_bucket) {
        return Ok(false);
    }
    for &up_osd in &pgb.up {
        if up_osd == source {
            continue;
        }
        let node = tree
            .node_by_id(up_osd)
            .ok_or(PlannerError::NoSuchOsd(up_osd))?;
        if tree.require_ancestor_of_type(node, crush_type)?.id == target_bucket.id {
            return Ok(false);
        }
    }
    Ok(true)
}
