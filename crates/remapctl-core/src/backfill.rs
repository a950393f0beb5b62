//! Per-OSD backfill reservation accounting.
//!
//! A backfill slot is an index where a PG's `up` and `acting` disagree and
//! both sides are valid; slots with a `NONE` side are degraded and stay out
//! of reservation accounting. Naming mirrors the cluster's own: a *local*
//! reservation is held on the PG's primary, a *remote* reservation on each
//! backfill target, and `backfills_from` counts the slots an OSD serves as
//! the source of.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::placement::{reorder_up_to_match_acting, PgBrief, PlacementError, PoolMap};
use crate::{Osd, OSD_NONE};

#[derive(Debug, Clone, Copy, Default)]
pub struct OsdBackfill {
    pub local_reservations: usize,
    pub remote_reservations: usize,
    pub backfills_from: usize,
    pub max_backfill_reservations: Option<usize>,
}

#[derive(Debug)]
pub struct BackfillState {
    osds: HashMap<Osd, OsdBackfill>,
    // BTreeMap keeps planner iteration in pgid order.
    pgs: BTreeMap<String, PgBrief>,
    pools: Arc<PoolMap>,

    max_backfills_from: usize,
    max_backfill_reservations: usize,
}

fn backfill_slots(up: &[Osd], acting: &[Osd]) -> (Vec<Osd>, Vec<Osd>) {
    let mut srcs = Vec::new();
    let mut tgts = Vec::new();
    for (&u, &a) in up.iter().zip(acting.iter()) {
        if u != a && u != OSD_NONE && a != OSD_NONE {
            srcs.push(a);
            tgts.push(u);
        }
    }
    (srcs, tgts)
}

impl BackfillState {
    /// Tally reservations from sanitized, normalized PG briefs.
    pub fn new(briefs: Vec<PgBrief>, pools: Arc<PoolMap>) -> Self {
        let mut bs = BackfillState {
            osds: HashMap::new(),
            pgs: BTreeMap::new(),
            pools,
            max_backfills_from: usize::MAX,
            max_backfill_reservations: usize::MAX,
        };
        for pgb in briefs {
            let pgid = pgb.pgid.clone();
            bs.pgs.insert(pgid.clone(), pgb);
            bs.add_reservations(&pgid);
        }
        bs
    }

    pub fn pg(&self, pgid: &str) -> Option<&PgBrief> {
        self.pgs.get(pgid)
    }

    pub fn pgs(&self) -> impl Iterator<Item = &PgBrief> {
        self.pgs.values()
    }

    pub fn osd_state(&self, osd: Osd) -> OsdBackfill {
        self.osds.get(&osd).copied().unwrap_or_default()
    }

    fn osd_mut(&mut self, osd: Osd) -> &mut OsdBackfill {
        self.osds.entry(osd).or_default()
    }

    pub fn set_max_backfills_from(&mut self, max: usize) {
        self.max_backfills_from = max;
    }

    pub fn set_max_backfill_reservations(&mut self, max: usize) {
        self.max_backfill_reservations = max;
    }

    pub fn set_osd_max_backfill_reservations(&mut self, osd: Osd, max: usize) {
        self.osd_mut(osd).max_backfill_reservations = Some(max);
    }

    pub fn max_backfill_reservations_for(&self, osd: Osd) -> usize {
        self.osd_state(osd)
            .max_backfill_reservations
            .unwrap_or(self.max_backfill_reservations)
    }

    fn expect_pg(&self, pgid: &str) -> &PgBrief {
        self.pgs
            .get(pgid)
            .unwrap_or_else(|| panic!("pg {pgid}: not in the backfill state"))
    }

    fn add_reservations(&mut self, pgid: &str) {
        let pgb = self.expect_pg(pgid);
        let (srcs, tgts) = backfill_slots(&pgb.up, &pgb.acting);
        let primary = pgb.primary();
        for osd in srcs {
            self.osd_mut(osd).backfills_from += 1;
        }
        for &osd in &tgts {
            self.osd_mut(osd).remote_reservations += 1;
        }
        if !tgts.is_empty() {
            let primary =
                primary.unwrap_or_else(|| panic!("pg {pgid}: acting set has no valid members"));
            self.osd_mut(primary).local_reservations += 1;
        }
    }

    fn remove_reservations(&mut self, pgid: &str) {
        let pgb = self.expect_pg(pgid);
        let (srcs, tgts) = backfill_slots(&pgb.up, &pgb.acting);
        let primary = pgb.primary();
        for osd in srcs {
            let counter = &mut self.osd_mut(osd).backfills_from;
            assert!(*counter > 0, "no backfills from remaining on osd {osd}");
            *counter -= 1;
        }
        for &osd in &tgts {
            let counter = &mut self.osd_mut(osd).remote_reservations;
            assert!(*counter > 0, "no remote reservations remaining on osd {osd}");
            *counter -= 1;
        }
        if !tgts.is_empty() {
            let primary =
                primary.unwrap_or_else(|| panic!("pg {pgid}: acting set has no valid members"));
            let counter = &mut self.osd_mut(primary).local_reservations;
            assert!(
                *counter > 0,
                "no local reservations remaining on osd {primary}"
            );
            *counter -= 1;
        }
    }

    /// Fold the effect of moving `from` to `to` in the PG's up set into the
    /// reservation counters: drop the PG's current reservations, mutate `up`,
    /// realign it against acting, and re-add.
    pub fn account_for_remap(
        &mut self,
        pgid: &str,
        from: Osd,
        to: Osd,
    ) -> Result<(), PlacementError> {
        let pgb = self.expect_pg(pgid);
        let Some(slot) = pgb.up.iter().position(|&osd| osd == from) else {
            // The from OSD can be missing when it is currently down; degraded
            // backfill is not modeled here.
            tracing::warn!(
                pgid,
                osd = from,
                "osd not in up set, unable to compute effect of remap on backfill state"
            );
            return Ok(());
        };

        self.remove_reservations(pgid);

        let pools = Arc::clone(&self.pools);
        let pgb = self.pgs.get_mut(pgid).expect("pg vanished mid-remap");
        pgb.up[slot] = to;
        let acting = pgb.acting.clone();
        // Membership alignment is all that matters here, so the upmap
        // indirection is not consulted.
        reorder_up_to_match_acting(&pools, pgid, &mut pgb.up, &acting, None)?;

        self.add_reservations(pgid);
        Ok(())
    }

    /// Would the given remap fit within every reservation budget it touches?
    ///
    /// The edit is applied tentatively, the budgets are checked, and the edit
    /// is reverted regardless of the outcome. The source-concurrency check
    /// looks at the OSD leaving the up set, which models EC backfill sources;
    /// replicated backfill actually reads from the primary. Keep as is.
    pub fn has_room_for(&mut self, pgid: &str, from: Osd, to: Osd) -> Result<bool, PlacementError> {
        if self.osd_state(from).backfills_from >= self.max_backfills_from {
            return Ok(false);
        }

        self.account_for_remap(pgid, from, to)?;

        let pgb = self.expect_pg(pgid);
        let primary = pgb
            .primary()
            .unwrap_or_else(|| panic!("pg {pgid}: acting set has no valid members"));
        let (_, tgts) = backfill_slots(&pgb.up, &pgb.acting);

        let mut has_room =
            self.osd_state(primary).local_reservations <= self.max_backfill_reservations_for(primary);
        for osd in tgts {
            if self.osd_state(osd).remote_reservations > self.max_backfill_reservations_for(osd) {
                has_room = false;
            }
        }

        self.account_for_remap(pgid, to, from)?;

        Ok(has_room)
    }

    /// PGs whose up set contains each requested OSD, in pgid order.
    pub fn up_pgs_for_osds(&self, osds: &[Osd]) -> HashMap<Osd, Vec<String>> {
        let mut osd_pgs: HashMap<Osd, Vec<String>> =
            osds.iter().map(|&osd| (osd, Vec::new())).collect();
        for pgb in self.pgs.values() {
            for osd in &pgb.up {
                if let Some(pgs) = osd_pgs.get_mut(osd) {
                    pgs.push(pgb.pgid.clone());
                    break;
                }
            }
        }
        osd_pgs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::PoolDetail;

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

    fn state() -> BackfillState {
        BackfillState::new(
            vec![
                brief("1.01", &[77, 1, 2], &[77, 1, 2]),
                brief("1.02", &[77, 3, 4], &[77, 3, 5]),
                brief("1.03", &[77, 5, 6], &[3, 5, 7]),
                brief("1.04", &[8, 5, 6], &[77, 5, 7]),
            ],
            pools(),
        )
    }

    fn assert_counters(bs: &BackfillState, osd: Osd, local: usize, remote: usize, from: usize) {
        let s = bs.osd_state(osd);
        assert_eq!(s.local_reservations, local, "local reservations of {osd}");
        assert_eq!(s.remote_reservations, remote, "remote reservations of {osd}");
        assert_eq!(s.backfills_from, from, "backfills from {osd}");
    }

    #[test]
    fn test_initial_tally() {
        let bs = state();
        assert_counters(&bs, 3, 1, 0, 1);
        assert_counters(&bs, 4, 0, 1, 0);
        assert_counters(&bs, 5, 0, 0, 1);
        assert_counters(&bs, 6, 0, 2, 0);
        assert_counters(&bs, 7, 0, 0, 2);
        assert_counters(&bs, 77, 2, 1, 1);
    }

    #[test]
    fn test_account_for_remap_sequence() {
        let mut bs = state();

        // Put 1.01 into a backfill state.
        bs.account_for_remap("1.01", 1, 6).unwrap();
        assert_eq!(bs.osd_state(1).backfills_from, 1);
        assert_eq!(bs.osd_state(6).remote_reservations, 3);
        assert_eq!(bs.osd_state(77).local_reservations, 3);

        // 1.02 already has 5 in acting, so this changes the backfill source
        // without changing reservations.
        bs.account_for_remap("1.02", 3, 5).unwrap();
        assert_eq!(bs.osd_state(3).backfills_from, 2);
        assert_eq!(bs.osd_state(4).remote_reservations, 1);
        assert_eq!(bs.osd_state(4).backfills_from, 0);
        assert_eq!(bs.osd_state(5).remote_reservations, 0);
        assert_eq!(bs.osd_state(5).backfills_from, 0);
        assert_eq!(bs.osd_state(77).local_reservations, 3);

        // Take 1.02 out of a backfill state.
        bs.account_for_remap("1.02", 4, 3).unwrap();
        assert_eq!(bs.osd_state(3).remote_reservations, 0);
        assert_eq!(bs.osd_state(3).backfills_from, 1);
        assert_eq!(bs.osd_state(4).remote_reservations, 0);
        assert_eq!(bs.osd_state(5).remote_reservations, 0);
        assert_eq!(bs.osd_state(77).local_reservations, 2);

        assert_counters(&bs, 3, 1, 0, 1);
        assert_counters(&bs, 4, 0, 0, 0);
        assert_counters(&bs, 5, 0, 0, 0);
        assert_counters(&bs, 6, 0, 3, 0);
        assert_counters(&bs, 7, 0, 0, 2);
        assert_counters(&bs, 77, 2, 1, 1);
    }

    #[test]
    fn test_degraded_slots_are_not_counted() {
        let bs = BackfillState::new(
            vec![brief("1.8c", &[0, 6, 3], &[1, OSD_NONE, 3])],
            pools(),
        );
        // Only the 0/1 slot counts; 6 vs NONE is degraded.
        assert_counters(&bs, 0, 0, 1, 0);
        assert_counters(&bs, 1, 1, 0, 1);
        assert_counters(&bs, 6, 0, 0, 0);
        assert_counters(&bs, OSD_NONE, 0, 0, 0);
    }

    #[test]
    fn test_account_warns_when_from_not_in_up() {
        let mut bs = state();
        bs.account_for_remap("1.01", 42, 6).unwrap();
        // Nothing changed.
        assert_counters(&bs, 6, 0, 2, 0);
        assert_eq!(bs.pg("1.01").unwrap().up, vec![77, 1, 2]);
    }

    #[test]
    fn test_has_room_for_respects_source_limit() {
        let mut bs = state();
        bs.set_max_backfills_from(2);
        // OSD 7 is already the source of two backfills.
        assert!(!bs.has_room_for("1.01", 7, 9).unwrap());
        // OSD 1 is the source of none.
        assert!(bs.has_room_for("1.01", 1, 9).unwrap());
    }

    #[test]
    fn test_has_room_for_respects_reservation_limits() {
        let mut bs = state();
        bs.set_max_backfill_reservations(3);
        assert!(bs.has_room_for("1.01", 1, 9).unwrap());

        // Remapping 1.01's slot for OSD 1 to OSD 6 would give 6 three remote
        // reservations; a per-OSD override takes precedence over the default.
        bs.set_osd_max_backfill_reservations(6, 2);
        assert!(!bs.has_room_for("1.01", 1, 6).unwrap());
        bs.set_osd_max_backfill_reservations(6, 3);
        assert!(bs.has_room_for("1.01", 1, 6).unwrap());

        // Primary 77 already holds two local reservations; a third exceeds a
        // default of 2.
        bs.set_max_backfill_reservations(2);
        assert!(!bs.has_room_for("1.01", 1, 9).unwrap());
    }

    #[test]
    fn test_has_room_for_is_side_effect_free() {
        let mut bs = state();
        bs.set_max_backfill_reservations(2);
        bs.has_room_for("1.01", 1, 6).unwrap();
        bs.has_room_for("1.01", 1, 9).unwrap();
        assert_counters(&bs, 6, 0, 2, 0);
        assert_counters(&bs, 9, 0, 0, 0);
        assert_counters(&bs, 77, 2, 1, 1);
        assert_eq!(bs.pg("1.01").unwrap().up, vec![77, 1, 2]);
    }

    #[test]
    #[should_panic(expected = "no backfills from remaining")]
    fn test_underflow_panics() {
        let mut bs = state();
        // Force an inconsistent removal by clearing counters first.
        bs.osds.clear();
        bs.remove_reservations("1.02");
    }

    #[test]
    fn test_up_pgs_for_osds() {
        let bs = state();
        let pgs = bs.up_pgs_for_osds(&[5, 9, 77]);
        assert_eq!(pgs[&77], vec!["1.01", "1.02", "1.03"]);
        assert_eq!(pgs[&5], vec!["1.04"]);
        assert!(pgs[&9].is_empty());
    }
}
