// THEORY:
// Advisory placement hints: task priorities and region residency.
//
// The worker pool asks the policy for the priority of every task it queues,
// and the orchestrator asks it whether a region must be materialised for the
// orchestration level. Any policy that keeps Feature > Filter > Load >
// orchestration is a valid replacement for the default.

use std::fmt::Debug;

use crate::core_modules::region::Residency;

/// The kinds of task the pipeline schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKind {
    Orchestration,
    Load,
    Filter,
    /// Per-item preprocessing and the batched backend call.
    Feature,
    Compaction,
    Search,
}

/// Regions and fields the pipeline creates for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegionRole {
    /// Manifest identifiers.
    Paths,
    /// Decoded frames.
    Items,
    /// Filter flag field of the vector region.
    VectorFlags,
    /// Feature vector field of the vector region.
    VectorData,
    /// Downstream neighbor results.
    Neighbors,
}

pub trait PlacementPolicy: Send + Sync + Debug {
    /// Higher runs first when several tasks are ready.
    fn priority(&self, kind: TaskKind) -> u8;

    /// Whether `kind` needs `role` materialised while it runs.
    fn residency(&self, kind: TaskKind, role: RegionRole) -> Residency;
}

/// Feature > Filter > Load > orchestration. The orchestration level only
/// forwards manifest identifiers and vector data to item tasks, so neither is
/// resident for it.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPlacement;

impl PlacementPolicy for DefaultPlacement {
    fn priority(&self, kind: TaskKind) -> u8 {
        match kind {
            TaskKind::Feature => 3,
            TaskKind::Filter => 2,
            TaskKind::Load => 1,
            TaskKind::Orchestration | TaskKind::Compaction | TaskKind::Search => 0,
        }
    }

    fn residency(&self, kind: TaskKind, role: RegionRole) -> Residency {
        match (kind, role) {
            (TaskKind::Orchestration, RegionRole::Paths | RegionRole::VectorData) => {
                Residency::Virtual
            }
            _ => Residency::Resident,
        }
    }
}
