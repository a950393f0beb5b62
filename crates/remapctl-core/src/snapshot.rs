//! Parsed, cached views of the cluster's JSON dumps.
//!
//! [`ClusterView`] wraps a [`ClusterCli`] and materializes each dump on
//! first use, holding it for the process lifetime. Snapshots are read-only
//! once parsed; the only mutable copy of placement state lives in
//! [`crate::mapping::MappingState`].

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::cluster::{ClusterCli, ClusterError};
use crate::mapping::UpmapItem;
use crate::placement::{
    reorder_up_to_match_acting, sanitize_briefs, PgBrief, PgQueryOut, PlacementError, PoolDetail,
    PoolMap,
};
use crate::topology::{CrushNodeDump, CrushTree};
use crate::Osd;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("failed to parse {what} output: {source}")]
    Parse {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Placement(#[from] PlacementError),
}

fn parse<T: for<'de> Deserialize<'de>>(what: &'static str, json: &str) -> Result<T, SnapshotError> {
    serde_json::from_str(json).map_err(|source| SnapshotError::Parse { what, source })
}

#[derive(Debug, Clone, Deserialize)]
pub struct OsdFlags {
    pub osd: Osd,
    #[serde(default, rename = "in")]
    pub is_in: i32,
    #[serde(default)]
    pub up: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OsdDump {
    #[serde(default)]
    pub osds: Vec<OsdFlags>,
    #[serde(default)]
    pub pg_upmap_items: Vec<UpmapItem>,
}

#[derive(Debug, Default, Deserialize)]
struct TreeDump {
    #[serde(default)]
    nodes: Vec<CrushNodeDump>,
}

// Newer cluster versions wrap the brief PG dump in a pg_stats object; older
// ones return a bare array. Try both.
#[derive(Debug, Default, Deserialize)]
struct WrappedBriefs {
    #[serde(default)]
    pg_stats: Vec<PgBrief>,
}

pub fn parse_pg_briefs(json: &str) -> Result<Vec<PgBrief>, SnapshotError> {
    if let Ok(briefs) = serde_json::from_str::<Vec<PgBrief>>(json) {
        return Ok(briefs);
    }
    parse::<WrappedBriefs>("pg dump", json).map(|w| w.pg_stats)
}

pub struct ClusterView {
    cli: Arc<dyn ClusterCli>,
    osd_dump: OnceCell<OsdDump>,
    tree: OnceCell<CrushTree>,
    pools: OnceCell<Arc<PoolMap>>,
    pg_briefs: OnceCell<Vec<PgBrief>>,
}

impl ClusterView {
    pub fn new(cli: Arc<dyn ClusterCli>) -> Self {
        Self {
            cli,
            osd_dump: OnceCell::new(),
            tree: OnceCell::new(),
            pools: OnceCell::new(),
            pg_briefs: OnceCell::new(),
        }
    }

    pub fn cli(&self) -> &dyn ClusterCli {
        self.cli.as_ref()
    }

    pub async fn osd_dump(&self) -> Result<&OsdDump, SnapshotError> {
        self.osd_dump
            .get_or_try_init(|| async {
                let raw = self.cli.osd_dump().await?;
                parse("osd dump", &raw)
            })
            .await
    }

    pub async fn crush_tree(&self) -> Result<&CrushTree, SnapshotError> {
        self.tree
            .get_or_try_init(|| async {
                let raw = self.cli.osd_tree().await?;
                let dump: TreeDump = parse("osd tree", &raw)?;
                Ok(CrushTree::from_nodes(dump.nodes))
            })
            .await
    }

    pub async fn pools(&self) -> Result<&Arc<PoolMap>, SnapshotError> {
        self.pools
            .get_or_try_init(|| async {
                let raw = self.cli.pool_details().await?;
                let details: Vec<PoolDetail> = parse("pool details", &raw)?;
                Ok(Arc::new(PoolMap::from_details(details)))
            })
            .await
    }

    /// The sanitized, normalized PG briefs: malformed PGs dropped with a
    /// warning, every up set reordered to line up with acting (following the
    /// upmap indirection).
    pub async fn pg_briefs(&self) -> Result<&[PgBrief], SnapshotError> {
        self.pg_briefs
            .get_or_try_init(|| async {
                let pools = self.pools().await?.clone();
                let upmaps: HashMap<String, HashMap<Osd, Osd>> = self
                    .osd_dump()
                    .await?
                    .pg_upmap_items
                    .iter()
                    .map(|item| {
                        let to_from = item.mappings.iter().map(|m| (m.to, m.from)).collect();
                        (item.pgid.clone(), to_from)
                    })
                    .collect();

                let raw = self.cli.pg_dump_brief().await?;
                let mut briefs = sanitize_briefs(parse_pg_briefs(&raw)?);
                for pgb in &mut briefs {
                    reorder_up_to_match_acting(
                        &pools,
                        &pgb.pgid,
                        &mut pgb.up,
                        &pgb.acting,
                        upmaps.get(&pgb.pgid),
                    )?;
                }
                Ok(briefs)
            })
            .await
            .map(Vec::as_slice)
    }

    /// Uncached per-PG query, used only for degraded-acting reconstruction.
    pub async fn pg_query(&self, pgid: &str) -> Result<PgQueryOut, SnapshotError> {
        let raw = self.cli.pg_query(pgid).await?;
        parse("pg query", &raw)
    }
}
