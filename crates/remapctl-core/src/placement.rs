//! Per-PG placement model: up/acting vectors, primary selection, the
//! reorder-up-to-match-acting normalization, and reconstruction of degraded
//! acting sets from per-peer metadata.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Osd, OSD_NONE};

static PG_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([0-9]+)\.([0-9a-f]+)$").unwrap());

// Peers are `<osd>` for replicated pools and `<osd>(<index>)` for EC pools.
static PEER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([0-9]+)(?:\(([0-9]+)\))?$").unwrap());

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("pg id {0:?} is not of the form <pool>.<hex>")]
    MalformedPgId(String),
    #[error("pg {pgid}: pool {pool} is not in the pool listing")]
    UnknownPool { pgid: String, pool: i64 },
    #[error("pg {pgid}: cannot interpret peer {peer:?}")]
    MalformedPeer { pgid: String, peer: String },
    #[error("pg {pgid}: more complete replicas than acting slots")]
    TooManyCompletePeers { pgid: String },
    #[error("pg {pgid}: no complete peer for acting slot {slot}")]
    IncompleteSlot { pgid: String, slot: usize },
}

/// One entry of the cluster's brief PG dump: where a PG is (`acting`) and
/// where it should be (`up`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgBrief {
    pub pgid: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub up: Vec<Osd>,
    #[serde(default)]
    pub acting: Vec<Osd>,
}

impl PgBrief {
    /// The first valid member of the acting set. An all-`NONE` acting set has
    /// no primary and is invalid input.
    pub fn primary(&self) -> Option<Osd> {
        self.acting.iter().copied().find(|&osd| osd != OSD_NONE)
    }

    pub fn in_backfill(&self) -> bool {
        self.state.contains("backfill")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolDetail {
    pub pool_id: i64,
    #[serde(default)]
    pub pool_name: String,
    #[serde(default)]
    pub erasure_code_profile: String,
}

/// Pool details indexed by pool id, used to distinguish erasure-coded pools
/// (slot order is structural) from replicated ones (only membership matters).
#[derive(Debug, Default)]
pub struct PoolMap {
    pools: HashMap<i64, PoolDetail>,
}

impl PoolMap {
    pub fn from_details(details: Vec<PoolDetail>) -> Self {
        Self {
            pools: details.into_iter().map(|p| (p.pool_id, p)).collect(),
        }
    }

    pub fn pg_uses_ec(&self, pgid: &str) -> Result<bool, PlacementError> {
        let pool = pool_of(pgid)?;
        let detail = self.pools.get(&pool).ok_or(PlacementError::UnknownPool {
            pgid: pgid.to_string(),
            pool,
        })?;
        Ok(detail.erasure_code_profile != "replicated_rule")
    }
}

pub fn pool_of(pgid: &str) -> Result<i64, PlacementError> {
    let caps = PG_ID_RE
        .captures(pgid)
        .ok_or_else(|| PlacementError::MalformedPgId(pgid.to_string()))?;
    caps[1]
        .parse()
        .map_err(|_| PlacementError::MalformedPgId(pgid.to_string()))
}

fn has_duplicate_osd(osds: &[Osd]) -> bool {
    for (i, &osd) in osds.iter().enumerate() {
        if osd == OSD_NONE {
            continue;
        }
        if osds[i + 1..].contains(&osd) {
            return true;
        }
    }
    false
}

/// Drop briefs the planner cannot reason about: mismatched up/acting lengths
/// or duplicated OSD ids, both impossible under a valid CRUSH map.
pub fn sanitize_briefs(briefs: Vec<PgBrief>) -> Vec<PgBrief> {
    briefs
        .into_iter()
        .filter(|pgb| {
            if pgb.up.len() != pgb.acting.len() {
                tracing::warn!(
                    pgid = %pgb.pgid,
                    up = pgb.up.len(),
                    acting = pgb.acting.len(),
                    "up and acting sets have mismatched lengths; excluding this PG \
                     from operations and reservation calculations"
                );
                return false;
            }
            for (set, osds) in [("acting", &pgb.acting), ("up", &pgb.up)] {
                if has_duplicate_osd(osds) {
                    tracing::warn!(
                        pgid = %pgb.pgid,
                        set,
                        "set has duplicated OSD ids; excluding this PG from \
                         operations and reservation calculations"
                    );
                    return false;
                }
            }
            true
        })
        .collect()
}

/// Permute `up` so that members shared with `acting` sit at the same index.
///
/// The cluster freely permutes `up` for replicated pools without implying
/// data movement, but the per-slot backfill test (`up[i] != acting[i]`) only
/// works when identical members line up. For EC pools the slot index is
/// structural and this is a no-op.
///
/// `upmap` is the to->from view of the PG's upmap item: when `up[i] = X` and
/// a mapping `Y -> X` exists, the entry counts as matching acting member `Y`,
/// letting the planner see logical acting membership through the remap.
pub fn reorder_up_to_match_acting(
    pools: &PoolMap,
    pgid: &str,
    up: &mut [Osd],
    acting: &[Osd],
    upmap: Option<&HashMap<Osd, Osd>>,
) -> Result<(), PlacementError> {
    if pools.pg_uses_ec(pgid)? {
        return Ok(());
    }

    for (ai, &act_osd) in acting.iter().enumerate() {
        for ui in 0..up.len() {
            let up_osd = up[ui];
            let mapped_from = upmap.and_then(|m| m.get(&up_osd).copied());
            if up_osd == act_osd || mapped_from == Some(act_osd) {
                up.swap(ui, ai);
                break;
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct PgQueryOut {
    #[serde(default)]
    pub acting: Vec<Osd>,
    #[serde(default)]
    pub info: PgQueryInfo,
    #[serde(default)]
    pub peer_info: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PgQueryInfo {
    #[serde(default)]
    pub pgid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerInfo {
    pub peer: String,
    #[serde(default)]
    pub incomplete: i32,
    #[serde(default)]
    pub stats: PeerStats,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerStats {
    #[serde(default)]
    pub last_epoch_clean: i64,
}

/// Reconstruct a complete acting set for a degraded PG from its peer list.
///
/// Starts from the queried acting set, which is known complete where valid.
/// Replicated peers fill `NONE` slots in any order; EC peers carry their slot
/// index and contend by `last_epoch_clean`. Only complete peers
/// (`incomplete == 0`) are eligible. If any slot is still `NONE` afterwards
/// the PG is not reconstructible and must be excluded from planning.
pub fn complete_acting_from_peers(query: &PgQueryOut) -> Result<Vec<Osd>, PlacementError> {
    let pgid = &query.info.pgid;
    let mut peers = query.acting.clone();
    let mut epoch_of: HashMap<Osd, i64> = HashMap::new();

    for pi in &query.peer_info {
        let caps = PEER_RE
            .captures(&pi.peer)
            .ok_or_else(|| PlacementError::MalformedPeer {
                pgid: pgid.clone(),
                peer: pi.peer.clone(),
            })?;
        let osd: Osd = caps[1]
            .parse()
            .map_err(|_| PlacementError::MalformedPeer {
                pgid: pgid.clone(),
                peer: pi.peer.clone(),
            })?;

        if let Some(index) = caps.get(2) {
            // EC shard: the peer id carries the slot index.
            let index: usize =
                index
                    .as_str()
                    .parse()
                    .map_err(|_| PlacementError::MalformedPeer {
                        pgid: pgid.clone(),
                        peer: pi.peer.clone(),
                    })?;
            epoch_of.insert(osd, pi.stats.last_epoch_clean);

            if pi.incomplete != 0 || peers.get(index) == Some(&osd) {
                continue;
            }
            if let Some(&occupant) = peers.get(index) {
                if occupant != OSD_NONE
                    && epoch_of.get(&occupant).copied().unwrap_or(0) > pi.stats.last_epoch_clean
                {
                    continue;
                }
                peers[index] = osd;
            }
        } else {
            // Replicated: membership is enough, order does not matter.
            if pi.incomplete != 0 || peers.contains(&osd) {
                continue;
            }
            match peers.iter().position(|&p| p == OSD_NONE) {
                Some(slot) => peers[slot] = osd,
                None => {
                    return Err(PlacementError::TooManyCompletePeers { pgid: pgid.clone() });
                }
            }
        }
    }

    if let Some(slot) = peers.iter().position(|&p| p == OSD_NONE) {
        return Err(PlacementError::IncompleteSlot {
            pgid: pgid.clone(),
            slot,
        });
    }
    Ok(peers)
}
