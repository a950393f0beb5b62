//! Transport to the cluster CLI.
//!
//! The planner never speaks to the cluster directly; everything goes through
//! the [`ClusterCli`] trait so that tests can substitute canned output. The
//! production implementation, [`CephCli`], shells out to the `ceph` binary
//! (and to `crushdiff` for crushmap comparisons).

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::mapping::Mapping;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("failed to execute `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("`{command}` exited with {code}: {stderr}")]
    Failed {
        command: String,
        code: String,
        stderr: String,
    },
    #[error("`{command}` produced non-UTF-8 output")]
    BadEncoding { command: String },
}

/// The read and write commands the planner needs from the cluster.
///
/// Read commands return the raw JSON (or, for [`crush_compare`], free text)
/// exactly as the cluster CLI printed it; parsing lives in
/// [`crate::snapshot`]. Write commands mutate the upmap exception table.
///
/// [`crush_compare`]: ClusterCli::crush_compare
#[async_trait]
pub trait ClusterCli: Send + Sync {
    async fn osd_dump(&self) -> Result<String, ClusterError>;
    async fn osd_tree(&self) -> Result<String, ClusterError>;
    async fn pool_details(&self) -> Result<String, ClusterError>;
    async fn pg_dump_brief(&self) -> Result<String, ClusterError>;
    async fn pg_query(&self, pgid: &str) -> Result<String, ClusterError>;

    /// Run the crush-diff helper against a crushmap in text form, returning
    /// its combined stdout and stderr.
    async fn crush_compare(&self, crushmap_text: &str) -> Result<String, ClusterError>;

    /// Replace the upmap exception table entry for a PG. The mapping list
    /// must be non-empty; an emptied entry is removed via [`remove_upmap`].
    ///
    /// [`remove_upmap`]: ClusterCli::remove_upmap
    async fn set_upmap(&self, pgid: &str, mappings: &[Mapping]) -> Result<(), ClusterError>;
    async fn remove_upmap(&self, pgid: &str) -> Result<(), ClusterError>;
}

/// [`ClusterCli`] over the real `ceph` binary.
pub struct CephCli {
    ceph_bin: String,
}

impl CephCli {
    pub fn new(ceph_bin: impl Into<String>) -> Self {
        Self {
            ceph_bin: ceph_bin.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, ClusterError> {
        run_command(&self.ceph_bin, args, false).await
    }
}

async fn run_command(bin: &str, args: &[&str], combined: bool) -> Result<String, ClusterError> {
    let rendered = format!("{} {}", bin, args.join(" "));
    tracing::debug!(command = %rendered, "executing");

    let output = Command::new(bin)
        .args(args)
        .output()
        .await
        .map_err(|source| ClusterError::Spawn {
            command: rendered.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(ClusterError::Failed {
            command: rendered,
            code: output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string()),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let mut out = String::from_utf8(output.stdout)
        .map_err(|_| ClusterError::BadEncoding {
            command: rendered.clone(),
        })?;
    if combined {
        out.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    Ok(out)
}

#[async_trait]
impl ClusterCli for CephCli {
    async fn osd_dump(&self) -> Result<String, ClusterError> {
        self.run(&["osd", "dump", "-f", "json"]).await
    }

    async fn osd_tree(&self) -> Result<String, ClusterError> {
        self.run(&["osd", "tree", "-f", "json"]).await
    }

    async fn pool_details(&self) -> Result<String, ClusterError> {
        self.run(&["osd", "pool", "ls", "detail", "-f", "json"]).await
    }

    async fn pg_dump_brief(&self) -> Result<String, ClusterError> {
        self.run(&["pg", "dump", "pgs_brief", "-f", "json"]).await
    }

    async fn pg_query(&self, pgid: &str) -> Result<String, ClusterError> {
        self.run(&["pg", pgid, "query", "-f", "json"]).await
    }

    async fn crush_compare(&self, crushmap_text: &str) -> Result<String, ClusterError> {
        // The helper interleaves osdmaptool chatter on stderr with the
        // per-PG stanzas; the parser wants both streams.
        run_command("crushdiff", &["compare", crushmap_text], true).await
    }

    async fn set_upmap(&self, pgid: &str, mappings: &[Mapping]) -> Result<(), ClusterError> {
        let mut args: Vec<String> = vec![
            "osd".to_string(),
            "pg-upmap-items".to_string(),
            pgid.to_string(),
        ];
        for m in mappings {
            args.push(m.from.to_string());
            args.push(m.to.to_string());
        }
        let borrowed: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&borrowed).await.map(|_| ())
    }

    async fn remove_upmap(&self, pgid: &str) -> Result<(), ClusterError> {
        self.run(&["osd", "rm-pg-upmap-items", pgid]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_error_names_command() {
        let cli = CephCli::new("/nonexistent/remapctl-test-ceph");
        let err = cli.osd_dump().await.unwrap_err();
        match err {
            ClusterError::Spawn { command, .. } => {
                assert!(command.contains("osd dump"));
            }
            other => panic!("expected Spawn error, got {other:?}"),
        }
    }
}
