use serde::{Deserialize, Serialize};

/// Phases of one deployment attempt. The coordinator only ever moves along
/// the edges `can_transition` admits; everything else is a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    BackingUp,
    Building,
    Migrating,
    CuttingOver,
    Monitoring,
    Succeeded,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Phase::Succeeded | Phase::RolledBack | Phase::RollbackFailed
        )
    }

    pub fn can_transition(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Idle, BackingUp)
                // Backup or build failures abort back to Idle: nothing has
                // been mutated yet.
                | (BackingUp, Building)
                | (BackingUp, Idle)
                | (Building, Migrating)
                | (Building, Idle)
                | (Migrating, CuttingOver)
                | (Migrating, RollingBack)
                | (CuttingOver, Monitoring)
                | (CuttingOver, RollingBack)
                | (Monitoring, Succeeded)
                | (Monitoring, RollingBack)
                | (RollingBack, RolledBack)
                | (RollingBack, RollbackFailed)
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::BackingUp => "backing-up",
            Phase::Building => "building",
            Phase::Migrating => "migrating",
            Phase::CuttingOver => "cutting-over",
            Phase::Monitoring => "monitoring",
            Phase::Succeeded => "succeeded",
            Phase::RollingBack => "rolling-back",
            Phase::RolledBack => "rolled-back",
            Phase::RollbackFailed => "rollback-failed",
        };
        f.write_str(name)
    }
}
