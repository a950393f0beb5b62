//! Canned-output cluster stub shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::cluster::{ClusterCli, ClusterError};
use crate::mapping::Mapping;

pub(crate) struct StubCluster {
    pub osd_dump: String,
    pub osd_tree: String,
    pub pools: String,
    pub pg_dump: String,
    pub pg_queries: HashMap<String, String>,
    pub crush_compare_output: String,
    pub fail_mutations: bool,

    pub mutations: Mutex<Vec<String>>,
    pub osd_dump_reads: AtomicUsize,
    pub tree_reads: AtomicUsize,
    pub pool_reads: AtomicUsize,
    pub pg_dump_reads: AtomicUsize,
}

impl Default for StubCluster {
    fn default() -> Self {
        Self {
            osd_dump: "{}".to_string(),
            osd_tree: r#"{ "nodes": [] }"#.to_string(),
            // Pool 1 replicated, pool 2 erasure-coded: enough for most
            // fixtures.
            pools: r#"[
              { "pool_id": 1, "pool_name": "data", "erasure_code_profile": "replicated_rule" },
              { "pool_id": 2, "pool_name": "ecdata", "erasure_code_profile": "isa-62" }
            ]"#
            .to_string(),
            pg_dump: "[]".to_string(),
            pg_queries: HashMap::new(),
            crush_compare_output: String::new(),
            fail_mutations: false,
            mutations: Mutex::new(Vec::new()),
            osd_dump_reads: AtomicUsize::new(0),
            tree_reads: AtomicUsize::new(0),
            pool_reads: AtomicUsize::new(0),
            pg_dump_reads: AtomicUsize::new(0),
        }
    }
}

impl StubCluster {
    pub fn mutations(&self) -> Vec<String> {
        self.mutations.lock().unwrap().clone()
    }

    pub fn read_counts(&self) -> (usize, usize, usize, usize) {
        (
            self.osd_dump_reads.load(Ordering::SeqCst),
            self.tree_reads.load(Ordering::SeqCst),
            self.pool_reads.load(Ordering::SeqCst),
            self.pg_dump_reads.load(Ordering::SeqCst),
        )
    }

    fn record(&self, mutation: String) -> Result<(), ClusterError> {
        if self.fail_mutations {
            return Err(ClusterError::Failed {
                command: mutation,
                code: "1".to_string(),
                stderr: "stub failure".to_string(),
            });
        }
        self.mutations.lock().unwrap().push(mutation);
        Ok(())
    }
}

#[async_trait]
impl ClusterCli for StubCluster {
    async fn osd_dump(&self) -> Result<String, ClusterError> {
        self.osd_dump_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.osd_dump.clone())
    }

    async fn osd_tree(&self) -> Result<String, ClusterError> {
        self.tree_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.osd_tree.clone())
    }

    async fn pool_details(&self) -> Result<String, ClusterError> {
        self.pool_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.pools.clone())
    }

    async fn pg_dump_brief(&self) -> Result<String, ClusterError> {
        self.pg_dump_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.pg_dump.clone())
    }

    async fn pg_query(&self, pgid: &str) -> Result<String, ClusterError> {
        self.pg_queries
            .get(pgid)
            .cloned()
            .ok_or_else(|| ClusterError::Failed {
                command: format!("pg {pgid} query"),
                code: "2".to_string(),
                stderr: format!("unhandled pg {pgid}"),
            })
    }

    async fn crush_compare(&self, _crushmap_text: &str) -> Result<String, ClusterError> {
        Ok(self.crush_compare_output.clone())
    }

    async fn set_upmap(&self, pgid: &str, mappings: &[Mapping]) -> Result<(), ClusterError> {
        let mut cmd = format!("pg-upmap-items {pgid}");
        for m in mappings {
            cmd.push_str(&format!(" {} {}", m.from, m.to));
        }
        self.record(cmd)
    }

    async fn remove_upmap(&self, pgid: &str) -> Result<(), ClusterError> {
        self.record(format!("rm-pg-upmap-items {pgid}"))
    }
}
