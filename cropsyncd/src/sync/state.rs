use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    #[default]
    Idle,
    Syncing,
    Error,
}

#[derive(Debug, Default)]
pub struct SyncStateMachine {
    phase: SyncPhase,
}

impl SyncStateMachine {
    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn begin(&mut self) -> bool {
        if self.phase == SyncPhase::Syncing {
            return false;
        }
        self.phase = SyncPhase::Syncing;
        true
    }

    pub fn complete(&mut self, terminal_failures: usize) {
        if self.phase != SyncPhase::Syncing {
            return;
        }
        self.phase = if terminal_failures == 0 {
            SyncPhase::Idle
        } else {
            SyncPhase::Error
        };
    }

    pub fn went_offline(&mut self) {
        self.phase = SyncPhase::Idle;
    }
}
