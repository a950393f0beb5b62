//! The editable in-memory upmap exception table.
//!
//! [`MappingState`] holds every PG's upmap item plus the derived
//! [`BackfillState`], guarded by one mutex so that remaps are atomic under
//! concurrent planner workers. Edits go through the remap algebra
//! ([`MappingState::try_remap`]), which composes a requested `(from, to)`
//! move with the PG's existing mappings while keeping the table invariants:
//! no two mappings share a `from`, no two share a `to`, and none maps an OSD
//! to itself.

use std::cmp;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use futures::stream::{self, TryStreamExt};
use nu_ansi_term::Color;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backfill::{BackfillState, OsdBackfill};
use crate::cluster::{ClusterCli, ClusterError};
use crate::placement::{PgBrief, PlacementError};
use crate::snapshot::{ClusterView, SnapshotError};
use crate::Osd;

#[derive(Debug, Error)]
pub enum RemapError {
    #[error("pg {pgid}: conflicting mapping found when trying to map {from} -> {to}")]
    Conflict { pgid: String, from: Osd, to: Osd },
    #[error("pg {pgid}: not in the placement snapshot")]
    UnknownPg { pgid: String },
    #[error("pg {pgid}: mapping from and to are both {osd}")]
    SelfMapping { pgid: String, osd: Osd },
    #[error(transparent)]
    Placement(#[from] PlacementError),
}

/// How a requested `(from, to)` edit combined with the PG's existing
/// mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapOutcome {
    /// The exact mapping already existed; nothing changed.
    Duplicate,
    /// The exact opposite mapping existed and was removed, reverting the up
    /// set.
    Inverse,
    /// An existing mapping ended at `from` and was retargeted to `to`.
    Chain,
    /// No related mapping existed; a new one was appended.
    Fresh,
}

/// Whether the planner found anything to do, in escalating order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeState {
    NoChange,
    /// An edit was wanted but every candidate was rejected by reservation
    /// budgets; trying again later may succeed.
    NoReservationAvailable,
    ChangesPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub from: Osd,
    pub to: Osd,
    #[serde(skip)]
    pub dirty: bool,
}

impl Mapping {
    pub fn new(from: Osd, to: Osd) -> Self {
        Self {
            from,
            to,
            dirty: false,
        }
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

/// One `(pgid, mapping)` pair, the unit of the import/export format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgMapping {
    pub pgid: String,
    pub mapping: Mapping,
}

/// A PG's entry in the upmap exception table, plus the ephemeral bookkeeping
/// used for diff rendering: mappings removed this session, stale mappings
/// stripped at load, and the dirty flag that marks the item for apply.
#[derive(Debug, Clone, Deserialize)]
pub struct UpmapItem {
    pub pgid: String,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
    #[serde(skip)]
    pub removed: Vec<Mapping>,
    #[serde(skip)]
    pub stale: Vec<Mapping>,
    #[serde(skip)]
    pub dirty: bool,
}

impl UpmapItem {
    fn empty(pgid: &str) -> Self {
        Self {
            pgid: pgid.to_string(),
            mappings: Vec::new(),
            removed: Vec::new(),
            stale: Vec::new(),
            dirty: false,
        }
    }

    fn recompute_dirty(&mut self) {
        self.dirty = !self.removed.is_empty() || self.mappings.iter().any(|m| m.dirty);
    }

    fn render(&self) -> String {
        let mut parts = Vec::new();
        for m in &self.mappings {
            if m.dirty {
                parts.push(Color::Green.paint(format!("+{m}")).to_string());
            } else {
                parts.push(m.to_string());
            }
        }
        for m in &self.removed {
            parts.push(Color::Red.paint(format!("-{m}")).to_string());
        }
        for m in &self.stale {
            parts.push(Color::Yellow.paint(format!("!{m}")).to_string());
        }
        format!("pg {}: [{}]", self.pgid, parts.join(","))
    }
}

/// Composable predicate over `(pgid, mapping)` pairs.
pub type MappingFilter = Box<dyn Fn(&str, &Mapping) -> bool + Send + Sync>;

pub fn with_pgid(pgid: impl Into<String>) -> MappingFilter {
    let pgid = pgid.into();
    Box::new(move |item_pgid, _| item_pgid == pgid)
}

pub fn with_from(from: Osd) -> MappingFilter {
    Box::new(move |_, m| m.from == from)
}

pub fn with_to(to: Osd) -> MappingFilter {
    Box::new(move |_, m| m.to == to)
}

pub fn all_of(filters: Vec<MappingFilter>) -> MappingFilter {
    Box::new(move |pgid, m| filters.iter().all(|f| f(pgid, m)))
}

pub fn any_of(filters: Vec<MappingFilter>) -> MappingFilter {
    Box::new(move |pgid, m| filters.iter().any(|f| f(pgid, m)))
}

struct MappingInner {
    // Sorted by pgid for predictable iteration and diff output.
    items: Vec<UpmapItem>,
    backfill: BackfillState,
    change_state: ChangeState,
}

pub struct MappingState {
    inner: Mutex<MappingInner>,
}

enum Decision {
    Inverse(usize),
    Chain(usize),
    Fresh,
}

impl MappingState {
    /// Seed the table from the current cluster snapshot.
    pub async fn load(view: &ClusterView) -> Result<Self, SnapshotError> {
        let briefs = view.pg_briefs().await?.to_vec();
        let pools = view.pools().await?.clone();
        let items = view.osd_dump().await?.pg_upmap_items.clone();
        Ok(Self::new(items, BackfillState::new(briefs, pools)))
    }

    /// Build the state from parsed upmap items and a seeded backfill state.
    ///
    /// Mappings with no observable placement effect (their `from` is back in
    /// the PG's up set, or their `to` is not in it) are stripped to the
    /// item's stale list. The item is not dirtied by this alone: the cluster
    /// only sees stale entries dropped if something else dirties the item.
    pub fn new(mut items: Vec<UpmapItem>, backfill: BackfillState) -> Self {
        items.sort_by(|a, b| a.pgid.cmp(&b.pgid));
        for item in &mut items {
            let Some(pgb) = backfill.pg(&item.pgid) else {
                continue;
            };
            let up = pgb.up.clone();
            let (stale, live): (Vec<Mapping>, Vec<Mapping>) = item
                .mappings
                .drain(..)
                .partition(|m| up.contains(&m.from) || !up.contains(&m.to));
            item.mappings = live;
            item.stale = stale;
        }

        Self {
            inner: Mutex::new(MappingInner {
                items,
                backfill,
                change_state: ChangeState::NoChange,
            }),
        }
    }

    /// Record the intent that the up-set member `from` of `pg` becomes `to`,
    /// folding the edit into any existing mappings.
    ///
    /// Overlaps the algebra cannot resolve return a [`RemapError::Conflict`]
    /// and leave the state untouched; callers iterating many PGs skip and
    /// continue.
    pub fn try_remap(&self, pgid: &str, from: Osd, to: Osd) -> Result<RemapOutcome, RemapError> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        if from == to {
            return Err(RemapError::SelfMapping {
                pgid: pgid.to_string(),
                osd: from,
            });
        }
        if inner.backfill.pg(pgid).is_none() {
            return Err(RemapError::UnknownPg {
                pgid: pgid.to_string(),
            });
        }

        let idx = Self::find_or_make(&mut inner.items, pgid);
        let item = &mut inner.items[idx];

        if item.mappings.iter().any(|m| m.from == from && m.to == to) {
            return Ok(RemapOutcome::Duplicate);
        }

        let mut decision = Decision::Fresh;
        for (i, m) in item.mappings.iter().enumerate() {
            if m.from == to && m.to == from {
                decision = Decision::Inverse(i);
                break;
            }
            if m.to == from {
                decision = Decision::Chain(i);
                break;
            }
            if m.from == to || m.from == from || m.to == to {
                return Err(RemapError::Conflict {
                    pgid: pgid.to_string(),
                    from,
                    to,
                });
            }
        }

        inner.backfill.account_for_remap(pgid, from, to)?;

        let item = &mut inner.items[idx];
        let outcome = match decision {
            Decision::Inverse(i) => {
                let mut m = item.mappings.remove(i);
                // A mapping created within this session just vanishes; only
                // mappings the cluster knows about show up as removed.
                if !m.dirty {
                    m.dirty = true;
                    item.removed.push(m);
                }
                RemapOutcome::Inverse
            }
            Decision::Chain(i) => {
                let old = item.mappings[i];
                let restores = item
                    .removed
                    .iter()
                    .position(|r| r.from == old.from && r.to == to);
                if let Some(pos) = restores {
                    item.removed.remove(pos);
                    item.mappings[i] = Mapping::new(old.from, to);
                } else {
                    if !old.dirty {
                        item.removed.push(Mapping { dirty: true, ..old });
                    }
                    item.mappings[i] = Mapping {
                        from: old.from,
                        to,
                        dirty: true,
                    };
                }
                RemapOutcome::Chain
            }
            Decision::Fresh => {
                let restores = item
                    .removed
                    .iter()
                    .position(|r| r.from == from && r.to == to);
                if let Some(pos) = restores {
                    item.removed.remove(pos);
                    item.mappings.push(Mapping::new(from, to));
                } else {
                    item.mappings.push(Mapping {
                        from,
                        to,
                        dirty: true,
                    });
                }
                RemapOutcome::Fresh
            }
        };

        item.recompute_dirty();
        inner.change_state = cmp::max(inner.change_state, ChangeState::ChangesPending);
        Ok(outcome)
    }

    /// [`try_remap`] for callers that cannot tolerate a conflict; the caller
    /// is expected to treat the error as fatal.
    ///
    /// [`try_remap`]: MappingState::try_remap
    pub fn must_remap(&self, pgid: &str, from: Osd, to: Osd) -> Result<RemapOutcome, RemapError> {
        self.try_remap(pgid, from, to)
    }

    fn find_or_make(items: &mut Vec<UpmapItem>, pgid: &str) -> usize {
        match items.binary_search_by(|item| item.pgid.as_str().cmp(pgid)) {
            Ok(i) => i,
            Err(i) => {
                items.insert(i, UpmapItem::empty(pgid));
                i
            }
        }
    }

    pub fn change_state(&self) -> ChangeState {
        self.inner.lock().unwrap().change_state
    }

    /// Record that an edit was considered but rejected for lack of a
    /// reservation.
    pub fn note_no_reservation(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.change_state = cmp::max(inner.change_state, ChangeState::NoReservationAvailable);
    }

    pub fn has_room_for(&self, pgid: &str, from: Osd, to: Osd) -> Result<bool, RemapError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.backfill.has_room_for(pgid, from, to)?)
    }

    pub fn osd_backfill(&self, osd: Osd) -> OsdBackfill {
        self.inner.lock().unwrap().backfill.osd_state(osd)
    }

    /// Busyness of an OSD as a remap target. Remote reservations dominate:
    /// they represent data this OSD is actively receiving.
    pub fn busyness_score(&self, osd: Osd) -> usize {
        let state = self.osd_backfill(osd);
        state.remote_reservations * 10 + state.local_reservations
    }

    pub fn set_max_backfills_from(&self, max: usize) {
        self.inner.lock().unwrap().backfill.set_max_backfills_from(max);
    }

    pub fn set_max_backfill_reservations(&self, max: usize) {
        self.inner
            .lock()
            .unwrap()
            .backfill
            .set_max_backfill_reservations(max);
    }

    pub fn set_osd_max_backfill_reservations(&self, osd: Osd, max: usize) {
        self.inner
            .lock()
            .unwrap()
            .backfill
            .set_osd_max_backfill_reservations(osd, max);
    }

    pub fn max_backfill_reservations_for(&self, osd: Osd) -> usize {
        self.inner
            .lock()
            .unwrap()
            .backfill
            .max_backfill_reservations_for(osd)
    }

    /// Live mappings matching the filter, in item order.
    pub fn mappings_matching(&self, filter: &MappingFilter) -> Vec<PgMapping> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for item in &inner.items {
            for m in &item.mappings {
                if filter(&item.pgid, m) {
                    out.push(PgMapping {
                        pgid: item.pgid.clone(),
                        mapping: *m,
                    });
                }
            }
        }
        out
    }

    pub fn dirty_items(&self) -> Vec<UpmapItem> {
        let inner = self.inner.lock().unwrap();
        inner
            .items
            .iter()
            .filter(|item| item.dirty)
            .cloned()
            .collect()
    }

    /// The PG's current (possibly edited) brief, if it survived
    /// sanitization.
    pub fn pg_brief(&self, pgid: &str) -> Option<PgBrief> {
        self.inner.lock().unwrap().backfill.pg(pgid).cloned()
    }

    /// Briefs of every PG whose up set contains the OSD, in pgid order.
    pub fn pgs_with_up_osd(&self, osd: Osd) -> Vec<PgBrief> {
        let inner = self.inner.lock().unwrap();
        inner
            .backfill
            .pgs()
            .filter(|pgb| pgb.up.contains(&osd))
            .cloned()
            .collect()
    }

    pub fn up_pgs_for_osds(&self, osds: &[Osd]) -> HashMap<Osd, Vec<String>> {
        self.inner.lock().unwrap().backfill.up_pgs_for_osds(osds)
    }

    /// Render the pending edits, one line per dirty PG, with a color legend.
    pub fn render_diff(&self) -> String {
        let items = self.dirty_items();
        let mut lines: Vec<String> = items.iter().map(UpmapItem::render).collect();
        if !lines.is_empty() {
            lines.push(format!(
                "Color legend (for terminals that support it): {} - {} - {} - kept mapping",
                Color::Green.paint("new mapping"),
                Color::Red.paint("removed mapping"),
                Color::Yellow.paint("stale mapping"),
            ));
        }
        lines.join("\n")
    }

    /// Write every dirty item back to the cluster, fanning out over a
    /// bounded worker pool. Item order is unspecified; any single failure
    /// fails the whole apply.
    pub async fn apply(
        &self,
        cluster: &dyn ClusterCli,
        concurrency: usize,
    ) -> Result<(), ClusterError> {
        let dirty: Vec<(String, Vec<Mapping>)> = self
            .dirty_items()
            .into_iter()
            .map(|item| (item.pgid, item.mappings))
            .collect();

        stream::iter(dirty.into_iter().map(Ok::<_, ClusterError>))
            .try_for_each_concurrent(Some(concurrency), |(pgid, mappings)| async move {
                if mappings.is_empty() {
                    cluster.remove_upmap(&pgid).await
                } else {
                    cluster.set_upmap(&pgid, &mappings).await
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::BackfillState;
    use crate::placement::{PgBrief, PoolDetail, PoolMap};
    use crate::testutil::StubCluster;
    use std::sync::Arc;

    fn pools() -> Arc<PoolMap> {
        Arc::new(PoolMap::from_details(vec![PoolDetail {
            pool_id: 1,
            pool_name: "data".to_string(),
            erasure_code_profile: "replicated_rule".to_string(),
        }]))
    }

    fn brief(pgid: &str, up: &[Osd], acting: &[Osd]) -> PgBrief {
        PgBrief {
            pgid: pgid.to_string(),
            state: String::new(),
            up: up.to_vec(),
            acting: acting.to_vec(),
        }
    }

    fn items(json: &str) -> Vec<UpmapItem> {
        serde_json::from_str(json).unwrap()
    }

    // Briefs here are already normalized (up aligned to acting).
    fn state() -> MappingState {
        let briefs = vec![
            brief("1.1", &[1, 2, 4], &[1, 2, 3]),
            brief("1.2", &[4, 5, 3], &[1, 2, 3]),
            brief("1.3", &[7, 8, 9], &[7, 8, 9]),
        ];
        let upmap = items(
            r#"[
              { "pgid": "1.1", "mappings": [ { "from": 3, "to": 4 } ] },
              { "pgid": "1.2", "mappings": [ { "from": 1, "to": 4 }, { "from": 2, "to": 5 } ] }
            ]"#,
        );
        MappingState::new(upmap, BackfillState::new(briefs, pools()))
    }

    fn pairs(state: &MappingState, filter: &MappingFilter) -> Vec<(String, Osd, Osd)> {
        state
            .mappings_matching(filter)
            .into_iter()
            .map(|pm| (pm.pgid, pm.mapping.from, pm.mapping.to))
            .collect()
    }

    #[test]
    fn test_mappings_matching_by_pgid() {
        let state = state();
        assert_eq!(
            pairs(&state, &with_pgid("1.2")),
            vec![("1.2".to_string(), 1, 4), ("1.2".to_string(), 2, 5)]
        );
    }

    #[test]
    fn test_mappings_matching_by_from_and_to() {
        let state = state();
        assert_eq!(pairs(&state, &with_from(1)), vec![("1.2".to_string(), 1, 4)]);
        assert_eq!(
            pairs(&state, &with_to(4)),
            vec![("1.1".to_string(), 3, 4), ("1.2".to_string(), 1, 4)]
        );
    }

    #[test]
    fn test_mappings_matching_combinators() {
        let state = state();
        assert_eq!(
            pairs(&state, &all_of(vec![with_from(1), with_to(4)])),
            vec![("1.2".to_string(), 1, 4)]
        );
        assert!(pairs(&state, &all_of(vec![with_from(2), with_to(4)])).is_empty());
        assert_eq!(
            pairs(&state, &any_of(vec![with_from(3), with_to(5)])),
            vec![("1.1".to_string(), 3, 4), ("1.2".to_string(), 2, 5)]
        );
    }

    #[test]
    fn test_remap_duplicate_is_a_noop() {
        let state = state();
        let outcome = state.try_remap("1.1", 3, 4).unwrap();
        assert_eq!(outcome, RemapOutcome::Duplicate);
        assert!(state.dirty_items().is_empty());
        assert_eq!(state.change_state(), ChangeState::NoChange);
    }

    #[test]
    fn test_remap_fresh_appends() {
        let state = state();
        let outcome = state.try_remap("1.1", 2, 6).unwrap();
        assert_eq!(outcome, RemapOutcome::Fresh);

        let dirty = state.dirty_items();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].pgid, "1.1");
        assert_eq!(
            dirty[0].mappings,
            vec![
                Mapping::new(3, 4),
                Mapping {
                    from: 2,
                    to: 6,
                    dirty: true
                }
            ]
        );
        assert_eq!(state.pg_brief("1.1").unwrap().up, vec![1, 6, 4]);
        assert_eq!(state.change_state(), ChangeState::ChangesPending);
    }

    #[test]
    fn test_remap_chain_retargets() {
        let state = state();
        let outcome = state.try_remap("1.1", 4, 6).unwrap();
        assert_eq!(outcome, RemapOutcome::Chain);

        let dirty = state.dirty_items();
        assert_eq!(dirty.len(), 1);
        assert_eq!(
            dirty[0].mappings,
            vec![Mapping {
                from: 3,
                to: 6,
                dirty: true
            }]
        );
        assert_eq!(
            dirty[0].removed,
            vec![Mapping {
                from: 3,
                to: 4,
                dirty: true
            }]
        );
    }

    #[test]
    fn test_remap_inverse_removes() {
        let state = state();
        let outcome = state.try_remap("1.2", 4, 1).unwrap();
        assert_eq!(outcome, RemapOutcome::Inverse);

        let dirty = state.dirty_items();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].mappings, vec![Mapping::new(2, 5)]);
        assert_eq!(
            dirty[0].removed,
            vec![Mapping {
                from: 1,
                to: 4,
                dirty: true
            }]
        );
        // The up set reverted toward acting.
        assert_eq!(state.pg_brief("1.2").unwrap().up, vec![1, 5, 3]);
    }

    #[test]
    fn test_remap_conflict_leaves_state_untouched() {
        let state = state();
        let err = state.try_remap("1.2", 5, 4).unwrap_err();
        assert!(matches!(err, RemapError::Conflict { .. }));
        assert!(state.dirty_items().is_empty());
        assert_eq!(state.pg_brief("1.2").unwrap().up, vec![4, 5, 3]);
        assert_eq!(state.change_state(), ChangeState::NoChange);
    }

    #[test]
    fn test_remap_unknown_pg() {
        let state = state();
        let err = state.try_remap("9.9", 1, 2).unwrap_err();
        assert!(matches!(err, RemapError::UnknownPg { .. }));
    }

    #[test]
    fn test_remap_rejects_self_mapping() {
        let state = state();
        let err = state.try_remap("1.1", 4, 4).unwrap_err();
        assert!(matches!(err, RemapError::SelfMapping { osd: 4, .. }));
        assert!(state.dirty_items().is_empty());
    }

    #[test]
    fn test_remap_followed_by_inverse_restores_everything() {
        let state = state();
        state.try_remap("1.3", 8, 5).unwrap();
        assert_eq!(state.pg_brief("1.3").unwrap().up, vec![7, 5, 9]);
        assert_eq!(state.osd_backfill(5).remote_reservations, 1);
        assert_eq!(state.osd_backfill(8).backfills_from, 1);
        assert_eq!(state.osd_backfill(7).local_reservations, 1);

        state.try_remap("1.3", 5, 8).unwrap();
        assert!(state.dirty_items().is_empty());
        assert_eq!(state.pg_brief("1.3").unwrap().up, vec![7, 8, 9]);
        assert_eq!(state.osd_backfill(5).remote_reservations, 0);
        assert_eq!(state.osd_backfill(8).backfills_from, 0);
        assert_eq!(state.osd_backfill(7).local_reservations, 0);
        assert!(pairs(&state, &with_pgid("1.3")).is_empty());
    }

    #[test]
    fn test_chain_then_inverse_restores_everything() {
        let state = state();
        // Chain 1.1's 3->4 out to 3->6, then walk it back.
        state.try_remap("1.1", 4, 6).unwrap();
        state.try_remap("1.1", 6, 4).unwrap();

        assert!(state.dirty_items().is_empty());
        assert_eq!(pairs(&state, &with_pgid("1.1")), vec![("1.1".to_string(), 3, 4)]);
        assert_eq!(state.pg_brief("1.1").unwrap().up, vec![1, 2, 4]);
    }

    #[test]
    fn test_stale_mappings_are_stripped_without_dirtying() {
        // The upmap entry's from is back in the up set: the mapping has no
        // placement effect any more.
        let briefs = vec![brief("1.33", &[6, 10, 0], &[6, 10, 2])];
        let upmap = items(r#"[{ "pgid": "1.33", "mappings": [ { "from": 0, "to": 10 } ] }]"#);
        let state = MappingState::new(upmap, BackfillState::new(briefs, pools()));

        assert!(state.dirty_items().is_empty());
        assert!(pairs(&state, &with_pgid("1.33")).is_empty());

        // A later edit dirties the item; the stale entry stays visible in the
        // diff but never returns to the mapping list.
        state.try_remap("1.33", 0, 2).unwrap();
        let dirty = state.dirty_items();
        assert_eq!(dirty.len(), 1);
        assert_eq!(
            dirty[0].mappings,
            vec![Mapping {
                from: 0,
                to: 2,
                dirty: true
            }]
        );
        assert_eq!(dirty[0].stale, vec![Mapping::new(0, 10)]);

        let diff = state.render_diff();
        assert!(diff.contains("pg 1.33: ["));
        assert!(diff.contains("+0->2"));
        assert!(diff.contains("!0->10"));
        assert!(diff.contains("Color legend"));
    }

    #[test]
    fn test_stale_to_missing_from_up() {
        // A mapping whose to is no longer in the up set is just as stale.
        let briefs = vec![brief("1.5", &[1, 2, 3], &[1, 2, 3])];
        let upmap = items(r#"[{ "pgid": "1.5", "mappings": [ { "from": 9, "to": 8 } ] }]"#);
        let state = MappingState::new(upmap, BackfillState::new(briefs, pools()));
        assert!(pairs(&state, &with_pgid("1.5")).is_empty());
        assert!(state.dirty_items().is_empty());
    }

    #[test]
    fn test_change_state_is_monotonic() {
        let state = state();
        assert_eq!(state.change_state(), ChangeState::NoChange);
        state.note_no_reservation();
        assert_eq!(state.change_state(), ChangeState::NoReservationAvailable);
        state.try_remap("1.1", 2, 6).unwrap();
        assert_eq!(state.change_state(), ChangeState::ChangesPending);
        state.note_no_reservation();
        assert_eq!(state.change_state(), ChangeState::ChangesPending);
    }

    #[test]
    fn test_dirty_items_stay_sorted() {
        let state = state();
        state.try_remap("1.3", 8, 5).unwrap();
        state.try_remap("1.1", 2, 6).unwrap();
        let dirty = state.dirty_items();
        let pgids: Vec<&str> = dirty.iter().map(|i| i.pgid.as_str()).collect();
        assert_eq!(pgids, vec!["1.1", "1.3"]);
    }

    #[tokio::test]
    async fn test_apply_writes_dirty_items_only() {
        let state = state();
        // 1.2 ends up with an empty mapping list; 1.3 gains one.
        state.try_remap("1.2", 4, 1).unwrap();
        state.try_remap("1.2", 5, 2).unwrap();
        state.try_remap("1.3", 8, 5).unwrap();

        let cluster = StubCluster::default();
        state.apply(&cluster, 2).await.unwrap();

        let mut written = cluster.mutations();
        written.sort();
        assert_eq!(
            written,
            vec![
                "pg-upmap-items 1.3 8 5".to_string(),
                "rm-pg-upmap-items 1.2".to_string(),
            ]
        );
    }
}
