//! Equalize PG counts across the OSDs of one CRUSH bucket, bounded by a
//! backfill budget. A small, targeted version of the cluster's own upmap
//! balancer for when enabling it cluster-wide is off the table.

use std::collections::HashMap;

use crate::mapping::MappingState;
use crate::planner::PlannerError;
use crate::snapshot::ClusterView;
use crate::Osd;

#[derive(Debug, Clone)]
pub struct BalanceOptions {
    /// The bucket's OSDs, already expanded (and device-class filtered) by
    /// the caller.
    pub osds: Vec<Osd>,
    /// Total backfill budget for the bucket, pre-existing backfills
    /// included.
    pub max_backfills: usize,
    /// Stop once the spread between the fullest and emptiest OSD is at most
    /// this.
    pub target_spread: usize,
}

pub async fn balance_bucket(
    view: &ClusterView,
    state: &MappingState,
    opts: &BalanceOptions,
) -> Result<(), PlannerError> {
    let mut osds = opts.osds.clone();
    osds.sort_unstable();

    let mut up_pgs: HashMap<Osd, Vec<String>> = state.up_pgs_for_osds(&osds);

    for flags in &view.osd_dump().await?.osds {
        if flags.is_in != 0 {
            continue;
        }
        if let Some(pgs) = up_pgs.get(&flags.osd) {
            if !pgs.is_empty() {
                return Err(PlannerError::OutOsdWithUpPgs(flags.osd));
            }
            up_pgs.remove(&flags.osd);
        }
    }

    let mut backfills_in_set: usize = osds
        .iter()
        .map(|&osd| state.osd_backfill(osd).backfills_from)
        .sum();

    while backfills_in_set < opts.max_backfills {
        let mut lowest: Option<(Osd, usize)> = None;
        let mut highest: Option<(Osd, usize)> = None;
        for &osd in &osds {
            let Some(pgs) = up_pgs.get(&osd) else {
                continue;
            };
            let count = pgs.len();
            match (&mut lowest, &mut highest) {
                (Some(low), Some(high)) => {
                    if count < low.1 {
                        *low = (osd, count);
                    }
                    if count > high.1 {
                        *high = (osd, count);
                    }
                }
                _ => {
                    lowest = Some((osd, count));
                    highest = Some((osd, count));
                }
            }
        }
        let (Some((low_osd, low_count)), Some((high_osd, high_count))) = (lowest, highest) else {
            return Ok(());
        };
        if high_count - low_count <= opts.target_spread {
            // Balanced enough.
            return Ok(());
        }

        let pgid = up_pgs
            .get(&high_osd)
            .and_then(|pgs| pgs.last())
            .cloned()
            .expect("fullest osd has no PGs");
        state.must_remap(&pgid, high_osd, low_osd)?;

        up_pgs.get_mut(&high_osd).unwrap().pop();
        up_pgs.get_mut(&low_osd).unwrap().push(pgid);
        backfills_in_set += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::ChangeState;
    use crate::testutil::StubCluster;
    use std::sync::Arc;

    // Up-set PG counts: 0 -> 4, 1 -> 4 (one arriving via 1.4's backfill),
    // 2 -> 2, 3 -> 4, 4 -> 1; OSD 5 is out and empty.
    const PG_DUMP: &str = r#"
    [
     { "pgid": "1.1", "up": [ 0 ], "acting": [ 0 ] },
     { "pgid": "1.2", "up": [ 0 ], "acting": [ 0 ] },
     { "pgid": "1.3", "up": [ 0 ], "acting": [ 0 ] },
     { "pgid": "1.4", "up": [ 1 ], "acting": [ 0 ] },
     { "pgid": "1.5", "up": [ 0 ], "acting": [ 0 ] },
     { "pgid": "1.6", "up": [ 1 ], "acting": [ 1 ] },
     { "pgid": "1.7", "up": [ 1 ], "acting": [ 1 ] },
     { "pgid": "1.8", "up": [ 1 ], "acting": [ 1 ] },
     { "pgid": "1.9", "up": [ 2 ], "acting": [ 2 ] },
     { "pgid": "1.10", "up": [ 2 ], "acting": [ 2 ] },
     { "pgid": "1.11", "up": [ 3 ], "acting": [ 3 ] },
     { "pgid": "1.12", "up": [ 3 ], "acting": [ 3 ] },
     { "pgid": "1.13", "up": [ 3 ], "acting": [ 3 ] },
     { "pgid": "1.14", "up": [ 3 ], "acting": [ 3 ] },
     { "pgid": "1.15", "up": [ 4 ], "acting": [ 4 ] }
    ]
    "#;

    const OSD_DUMP: &str = r#"
    {
      "osds": [
        { "osd": 0, "in": 1, "up": 1 },
        { "osd": 1, "in": 1, "up": 1 },
        { "osd": 2, "in": 1, "up": 1 },
        { "osd": 3, "in": 1, "up": 1 },
        { "osd": 4, "in": 1, "up": 1 },
        { "osd": 5, "in": 0, "up": 1 }
      ],
      "pg_upmap_items": [
        { "pgid": "1.4", "mappings": [ { "from": 0, "to": 1 } ] },
        { "pgid": "1.5", "mappings": [ { "from": 2, "to": 0 } ] }
      ]
    }
    "#;

    async fn fixture() -> (ClusterView, MappingState) {
        let cluster = Arc::new(StubCluster {
            osd_dump: OSD_DUMP.to_string(),
            pg_dump: PG_DUMP.to_string(),
            ..StubCluster::default()
        });
        let view = ClusterView::new(cluster);
        let state = MappingState::load(&view).await.unwrap();
        (view, state)
    }

    async fn run(max_backfills: usize, target_spread: usize) -> (MappingState, ClusterView) {
        let (view, state) = fixture().await;
        balance_bucket(
            &view,
            &state,
            &BalanceOptions {
                osds: vec![0, 1, 2, 3, 4, 5],
                max_backfills,
                target_spread,
            },
        )
        .await
        .unwrap();
        (state, view)
    }

    fn assert_dirty(state: &MappingState, expected: &[(&str, Osd, Osd)]) {
        let dirty = state.dirty_items();
        let got: Vec<(String, Osd, Osd)> = dirty
            .iter()
            .map(|item| {
                assert_eq!(item.mappings.len(), 1, "pg {}", item.pgid);
                let m = &item.mappings[0];
                (item.pgid.clone(), m.from, m.to)
            })
            .collect();
        let want: Vec<(String, Osd, Osd)> = expected
            .iter()
            .map(|(pgid, from, to)| (pgid.to_string(), *from, *to))
            .collect();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn test_fully_balance() {
        let (state, _view) = run(4, 0).await;
        // 1.5 already has a mapping 2->0, which gets chained to 2->4.
        assert_dirty(
            &state,
            &[("1.14", 3, 4), ("1.5", 2, 4), ("1.8", 1, 2)],
        );
    }

    #[tokio::test]
    async fn test_no_balance_due_to_outstanding_backfill() {
        let (state, _view) = run(1, 0).await;
        assert!(state.dirty_items().is_empty());
        assert_eq!(state.change_state(), ChangeState::NoChange);
    }

    #[tokio::test]
    async fn test_single_movement() {
        let (state, _view) = run(2, 0).await;
        assert_dirty(&state, &[("1.5", 2, 4)]);
    }

    #[tokio::test]
    async fn test_increased_target_spread() {
        let (state, _view) = run(4, 2).await;
        assert_dirty(&state, &[("1.5", 2, 4)]);
    }

    #[tokio::test]
    async fn test_out_osd_with_up_pgs_is_an_error() {
        let cluster = Arc::new(StubCluster {
            osd_dump: r#"{ "osds": [ { "osd": 0, "in": 0, "up": 1 } ] }"#.to_string(),
            pg_dump: r#"[ { "pgid": "1.1", "up": [ 0 ], "acting": [ 0 ] } ]"#.to_string(),
            ..StubCluster::default()
        });
        let view = ClusterView::new(cluster);
        let state = MappingState::load(&view).await.unwrap();
        let err = balance_bucket(
            &view,
            &state,
            &BalanceOptions {
                osds: vec![0],
                max_backfills: 5,
                target_spread: 0,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PlannerError::OutOsdWithUpPgs(0)));
    }
}
