use std::collections::HashSet;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::seq::SliceRandom;

use remapctl_core::balance::{balance_bucket, BalanceOptions};
use remapctl_core::cancel_backfill::{cancel_backfill, CancelBackfillOptions};
use remapctl_core::crush_change::crush_change_mappings;
use remapctl_core::drain::{drain, DrainOptions};
use remapctl_core::transfer::{export_mappings, import_mappings};
use remapctl_core::undo_upmaps::undo_upmaps;
use remapctl_core::{
    CephCli, ChangeState, ClusterCli, ClusterView, MappingState, Osd, PgMapping,
};

/// Use the upmap exception table to manipulate PG mappings (and thus
/// scheduled backfill).
#[derive(Parser)]
#[command(name = "remapctl", version)]
#[command(
    long_about = "Use the upmap exception table to manipulate PG mappings (and thus scheduled \
                  backfill).\n\nFor any command that takes an osdspec, one of the following can \
                  be given:\n* An OSD ID (e.g. '54').\n* A CRUSH bucket (e.g. 'bucket:rack1' or \
                  'bucket:host04'), expanding to all of its OSDs."
)]
pub struct Cli {
    /// Number of cluster commands to issue in parallel.
    #[arg(long, global = true, default_value_t = 5)]
    pub concurrency: usize,

    /// Skip confirmations and dry-run output.
    #[arg(long, global = true)]
    pub yes: bool,

    /// Display the cluster commands being run.
    #[arg(long, global = true)]
    pub verbose: bool,

    /// The cluster CLI binary to invoke.
    #[arg(long, global = true, env = "REMAPCTL_CEPH_BIN", default_value = "ceph")]
    pub ceph_bin: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Add/modify upmap entries to balance the PG count of OSDs in the
    /// given CRUSH bucket.
    ///
    /// A small, targeted version of the cluster's own upmap balancer,
    /// useful where general enablement of the balancer isn't possible or
    /// desirable. The given bucket must contain OSDs.
    BalanceBucket {
        bucket: String,
        /// Max number of backfills to schedule for this bucket, including
        /// pre-existing ones.
        #[arg(long, default_value_t = 5)]
        max_backfills: usize,
        /// Target difference between the fullest and emptiest OSD in the
        /// bucket.
        #[arg(long, default_value_t = 1)]
        target_spread: usize,
        /// Only balance OSDs with this device class.
        #[arg(long, default_value = "")]
        device_class: String,
    },

    /// Add upmap entries cancelling out pending backfill.
    ///
    /// Iterates the PGs in a backfill state, creating, modifying, or
    /// removing upmap exception table entries to point each PG back to
    /// where it is located now (i.e. makes the up set match the acting
    /// set). The acting set of a degraded backfill is reconstructed first,
    /// provided complete copies exist for all of its slots.
    CancelBackfill {
        /// Don't interrupt already-started backfills.
        #[arg(long)]
        exclude_backfilling: bool,
        /// Apply the include/exclude filters to backfill sources only.
        #[arg(long)]
        source: bool,
        /// Apply the include/exclude filters to backfill targets only.
        #[arg(long)]
        target: bool,
        /// Osdspecs whose backfills will be excluded from cancellation.
        #[arg(long, value_delimiter = ',')]
        exclude_osds: Vec<String>,
        /// Osdspecs whose backfills will be included in cancellation.
        #[arg(long, value_delimiter = ',')]
        include_osds: Vec<String>,
        /// Cancel all backfill of any PG whose up or acting set includes
        /// one of these osdspecs, whether or not the OSD is a backfill
        /// source or target there.
        #[arg(long, value_delimiter = ',')]
        pgs_including: Vec<String>,
    },

    /// Drain PGs from the given OSD to the target OSDs.
    ///
    /// No attempt is made to balance the fullness of the targets; the
    /// least busy target OSDs and PGs are selected.
    Drain {
        source_osd: Osd,
        /// Osdspecs used as the target of remappings.
        #[arg(long, value_delimiter = ',', required = true)]
        target_osds: Vec<String>,
        /// The lowest CRUSH bucket type across which shards/replicas of a
        /// PG may move; omit to keep them within their current direct
        /// bucket. Not validated against CRUSH rules.
        #[arg(long)]
        allow_movement_across: Option<String>,
        /// Limit backfill reservations; format: "default max[,osdspec:max]*",
        /// e.g. "5,bucket:data10:10".
        #[arg(long, value_delimiter = ',')]
        max_backfill_reservations: Vec<String>,
        /// Max number of backfills to schedule per source OSD, including
        /// pre-existing ones.
        #[arg(long, default_value_t = 1)]
        max_source_backfills: usize,
    },

    /// Undo upmap entries for the given source (or target) OSDs.
    ///
    /// Removes or modifies upmap items so that the given OSDs become the
    /// source (or, with --target, the target) of backfill, up to the given
    /// limits. Backfill is spread across target and primary OSDs in a
    /// best-effort manner.
    UndoUpmaps {
        #[arg(required = true)]
        osds: Vec<String>,
        /// The given OSDs are backfill targets rather than sources.
        #[arg(long)]
        target: bool,
        /// Limit backfill reservations; format: "default max[,osdspec:max]*".
        #[arg(long, value_delimiter = ',')]
        max_backfill_reservations: Vec<String>,
        /// Max number of backfills to schedule per source OSD, including
        /// pre-existing ones.
        #[arg(long, default_value_t = 1)]
        max_source_backfills: usize,
    },

    /// Remap the given PG from the source OSD to the target OSD.
    ///
    /// Takes existing mappings for the PG into account, making it safer
    /// than editing the exception table directly.
    Remap {
        pgid: String,
        source_osd: Osd,
        target_osd: Osd,
    },

    /// Export the mappings pertaining to the given osdspecs as JSON usable
    /// by import-mappings.
    ///
    /// Useful for preserving mappings across OSD destruction or any other
    /// CRUSH change that will cause the cluster to clean up upmap items.
    ExportMappings {
        #[arg(required = true)]
        osdspecs: Vec<String>,
        /// Write output to the given file path instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Export all mappings of any PG that includes the given OSDs, not
        /// just the portions pertaining to those OSDs.
        #[arg(long)]
        whole_pg: bool,
    },

    /// Import and apply mappings from a JSON file (stdin when omitted).
    ImportMappings { file: Option<PathBuf> },

    /// Export the mappings a CRUSHmap change would incur, as JSON usable
    /// by import-mappings.
    ///
    /// Lets a large CRUSH change (e.g. switching chooseleaf from host to
    /// rack) be rolled out gradually: import the pregenerated mappings
    /// first, then inject the new CRUSHmap as a near no-op.
    GenerateCrushChangeMappings {
        /// CRUSHmap, with changes, in text format.
        #[arg(long)]
        crushmap_text: String,
        /// Write output to the given file path instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let cluster: Arc<dyn ClusterCli> = Arc::new(CephCli::new(self.ceph_bin.clone()));
        let view = ClusterView::new(cluster);

        match &self.command {
            Command::BalanceBucket {
                bucket,
                max_backfills,
                target_spread,
                device_class,
            } => {
                let tree = view.crush_tree().await?;
                let device_class = (!device_class.is_empty()).then_some(device_class.as_str());
                let osds = tree.osds_under(bucket, device_class)?;
                if osds.is_empty() {
                    bail!("bucket {bucket:?} contains no OSDs");
                }

                let state = MappingState::load(&view).await?;
                balance_bucket(
                    &view,
                    &state,
                    &BalanceOptions {
                        osds,
                        max_backfills: *max_backfills,
                        target_spread: *target_spread,
                    },
                )
                .await?;
                self.finish(&view, &state).await
            }

            Command::CancelBackfill {
                exclude_backfilling,
                source,
                target,
                exclude_osds,
                include_osds,
                pgs_including,
            } => {
                let opts = CancelBackfillOptions {
                    exclude_backfilling: *exclude_backfilling,
                    source: *source,
                    target: *target,
                    excluded_osds: resolve_osdspec_set(&view, exclude_osds).await?,
                    included_osds: resolve_osdspec_set(&view, include_osds).await?,
                    pgs_including_osds: resolve_osdspec_set(&view, pgs_including).await?,
                    concurrency: self.concurrency,
                };

                let state = MappingState::load(&view).await?;
                cancel_backfill(&view, &state, &opts).await?;
                self.finish(&view, &state).await
            }

            Command::Drain {
                source_osd,
                target_osds,
                allow_movement_across,
                max_backfill_reservations,
                max_source_backfills,
            } => {
                let state = MappingState::load(&view).await?;
                state.set_max_backfills_from(*max_source_backfills);
                apply_reservation_limits(&view, &state, max_backfill_reservations).await?;

                let target_osds = resolve_osdspecs(&view, target_osds).await?;
                drain(
                    &view,
                    &state,
                    &DrainOptions {
                        source_osd: *source_osd,
                        target_osds,
                        allow_movement_across: allow_movement_across.clone(),
                    },
                )
                .await?;
                self.finish(&view, &state).await
            }

            Command::UndoUpmaps {
                osds,
                target,
                max_backfill_reservations,
                max_source_backfills,
            } => {
                let state = MappingState::load(&view).await?;
                state.set_max_backfills_from(*max_source_backfills);
                apply_reservation_limits(&view, &state, max_backfill_reservations).await?;

                let mut osds = resolve_osdspecs(&view, osds).await?;
                // Randomize for fairness across repeated runs.
                osds.shuffle(&mut rand::thread_rng());

                undo_upmaps(&state, &osds, *target)?;
                self.finish(&view, &state).await
            }

            Command::Remap {
                pgid,
                source_osd,
                target_osd,
            } => {
                let state = MappingState::load(&view).await?;
                state.must_remap(pgid, *source_osd, *target_osd)?;
                self.finish(&view, &state).await
            }

            Command::ExportMappings {
                osdspecs,
                output,
                whole_pg,
            } => {
                let osds = resolve_osdspecs(&view, osdspecs).await?;
                let state = MappingState::load(&view).await?;
                let mappings = export_mappings(&state, &osds, *whole_pg);
                write_mappings(&mappings, output.as_deref())
            }

            Command::ImportMappings { file } => {
                let json = match file {
                    Some(path) => std::fs::read_to_string(path)
                        .with_context(|| format!("reading {}", path.display()))?,
                    None => {
                        let mut buf = String::new();
                        std::io::stdin().read_to_string(&mut buf)?;
                        buf
                    }
                };
                let mappings: Vec<PgMapping> =
                    serde_json::from_str(&json).context("parsing mappings")?;

                let state = MappingState::load(&view).await?;
                import_mappings(&state, &mappings)?;
                self.finish(&view, &state).await
            }

            Command::GenerateCrushChangeMappings {
                crushmap_text,
                output,
            } => {
                let mappings = crush_change_mappings(&view, crushmap_text).await?;
                write_mappings(&mappings, output.as_deref())
            }
        }
    }

    /// Dry-run confirmation and, when confirmed, the parallel apply.
    async fn finish(&self, view: &ClusterView, state: &MappingState) -> Result<()> {
        match state.change_state() {
            ChangeState::NoChange => {
                eprintln!("nothing to do");
                return Ok(());
            }
            ChangeState::NoReservationAvailable => {
                eprintln!("change possible but no backfill reservation available, try later");
                return Ok(());
            }
            ChangeState::ChangesPending => {}
        }

        if !self.yes {
            println!("The following changes would be made to the upmap exception table:");
            println!("{}", state.render_diff());
            println!();
            println!("No changes made - use --yes to apply changes.");
            return Ok(());
        }

        state.apply(view.cli(), self.concurrency).await?;
        Ok(())
    }
}

fn write_mappings(mappings: &[PgMapping], output: Option<&std::path::Path>) -> Result<()> {
    match output {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            serde_json::to_writer(file, mappings)?;
        }
        None => {
            serde_json::to_writer(std::io::stdout(), mappings)?;
            println!();
        }
    }
    Ok(())
}

/// An osdspec is an OSD ID or `bucket:<name>`, expanding to the bucket's
/// descendant OSDs (skipping those that are out).
async fn resolve_osdspec(view: &ClusterView, spec: &str) -> Result<Vec<Osd>> {
    if let Ok(osd) = spec.parse::<Osd>() {
        return Ok(vec![osd]);
    }
    let Some(bucket) = spec.strip_prefix("bucket:") else {
        bail!("{spec:?} is not a valid osdspec - see --help");
    };
    let tree = view.crush_tree().await?;
    Ok(tree.osds_under(bucket, None)?)
}

async fn resolve_osdspecs(view: &ClusterView, specs: &[String]) -> Result<Vec<Osd>> {
    let mut osds = Vec::new();
    for spec in specs {
        osds.extend(resolve_osdspec(view, spec).await?);
    }
    Ok(osds)
}

async fn resolve_osdspec_set(view: &ClusterView, specs: &[String]) -> Result<HashSet<Osd>> {
    Ok(resolve_osdspecs(view, specs).await?.into_iter().collect())
}

/// Parse `default[,osdspec:max]*` reservation limits into the mapping
/// state. Overrides split at the last colon so bucket specs stay intact.
async fn apply_reservation_limits(
    view: &ClusterView,
    state: &MappingState,
    specs: &[String],
) -> Result<()> {
    let Some((default, overrides)) = specs.split_first() else {
        return Ok(());
    };
    let default: usize = default
        .parse()
        .with_context(|| format!("{default:?} is not a valid default max-backfill-reservations"))?;
    state.set_max_backfill_reservations(default);

    for spec in overrides {
        let Some((osdspec, max)) = spec.rsplit_once(':') else {
            bail!("{spec:?} is not a valid max-backfill-reservations specifier");
        };
        let max: usize = max
            .parse()
            .with_context(|| format!("{spec:?} is not a valid max-backfill-reservations specifier"))?;
        for osd in resolve_osdspec(view, osdspec).await? {
            state.set_osd_max_backfill_reservations(osd, max);
        }
    }
    Ok(())
}
