//! Placement, backfill, and upmap planning model for remapctl.
//!
//! The core is a read-modify-diff engine over a single snapshot of cluster
//! placement state: parse the cluster's JSON dumps into a [`snapshot::ClusterView`],
//! seed a [`mapping::MappingState`] (upmap exception table plus derived
//! [`backfill::BackfillState`] reservation counters), let one of the planners
//! mutate it, then render the dirty subset as a diff or apply it back to the
//! cluster.

pub mod backfill;
pub mod balance;
pub mod cancel_backfill;
pub mod cluster;
pub mod crush_change;
pub mod drain;
pub mod mapping;
pub mod placement;
pub mod planner;
pub mod snapshot;
pub mod topology;
pub mod transfer;
pub mod undo_upmaps;

#[cfg(test)]
pub(crate) mod testutil;

pub use cluster::{CephCli, ClusterCli, ClusterError};
pub use mapping::{ChangeState, Mapping, MappingState, PgMapping, RemapError, RemapOutcome};
pub use planner::PlannerError;
pub use snapshot::ClusterView;

/// An OSD identifier as it appears in cluster dumps.
pub type Osd = i32;

/// Sentinel for a missing slot in an acting set. This is the placement
/// function's "no such OSD" marker, `i32::MAX` on the wire.
pub const OSD_NONE: Osd = i32::MAX;
