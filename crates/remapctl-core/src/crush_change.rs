//! Turn the textual output of the crush-diff helper into mapping edits.
//!
//! The helper prints, among assorted osdmaptool chatter, one stanza per
//! remapped PG of the form `<pgid>\t[old...] -> [new...]`. Each index where
//! the old and new OSD sets differ becomes one `(pgid, old, new)` edit,
//! suitable for later replay through import-mappings.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::mapping::{Mapping, PgMapping};
use crate::planner::PlannerError;
use crate::snapshot::ClusterView;
use crate::Osd;

static STANZA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*([0-9]+\.[0-9a-f]+)\t\[([0-9,\s]*)\] -> \[([0-9,\s]*)\]\s*$").unwrap()
});

#[derive(Debug, Error)]
pub enum CrushDiffError {
    #[error("pg {pgid}: unequal count between existing and new OSD sets")]
    UnequalOsdCount { pgid: String },
    #[error("pg {pgid}: could not parse OSD set {set:?}")]
    BadOsdSet { pgid: String, set: String },
}

fn parse_osd_set(pgid: &str, set: &str) -> Result<Vec<Osd>, CrushDiffError> {
    let set = set.trim();
    if set.is_empty() {
        return Ok(Vec::new());
    }
    set.split(',')
        .map(|osd| {
            osd.trim().parse().map_err(|_| CrushDiffError::BadOsdSet {
                pgid: pgid.to_string(),
                set: set.to_string(),
            })
        })
        .collect()
}

pub fn parse_crush_diff(text: &str) -> Result<Vec<PgMapping>, CrushDiffError> {
    let mut mappings = Vec::new();
    for caps in STANZA_RE.captures_iter(text) {
        let pgid = &caps[1];
        let old = parse_osd_set(pgid, &caps[2])?;
        let new = parse_osd_set(pgid, &caps[3])?;
        if old.len() != new.len() {
            return Err(CrushDiffError::UnequalOsdCount {
                pgid: pgid.to_string(),
            });
        }
        for (&from, &to) in old.iter().zip(new.iter()) {
            if from != to {
                mappings.push(PgMapping {
                    pgid: pgid.to_string(),
                    mapping: Mapping::new(from, to),
                });
            }
        }
    }
    Ok(mappings)
}

/// Run the crush-diff helper against the given crushmap text and collect the
/// mapping edits the change would incur.
pub async fn crush_change_mappings(
    view: &ClusterView,
    crushmap_text: &str,
) -> Result<Vec<PgMapping>, PlannerError> {
    let out = view.cli().crush_compare(crushmap_text).await?;
    Ok(parse_crush_diff(&out)?)
}
