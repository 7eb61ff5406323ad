use serde::{Deserialize, Serialize};

/// Job lifecycle status. Monotonic: once a transition is taken,
/// its source state is never visited again for that job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Stopped)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Whether `self -> next` is one of the allowed transitions:
    /// `queued -> running -> {finished|failed|stopped}`, `queued -> failed`, `queued -> stopped`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Running) => true,
            (Queued, Failed) => true,
            (Queued, Stopped) => true,
            (Running, Finished) => true,
            (Running, Failed) => true,
            (Running, Stopped) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Stopped));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Finished));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Stopped));
    }

    #[test]
    fn terminal_states_reject_every_transition() {
        for terminal in [JobStatus::Finished, JobStatus::Failed, JobStatus::Stopped] {
            for next in [
                JobStatus::Queued,
                JobStatus::Running,
                JobStatus::Finished,
                JobStatus::Failed,
                JobStatus::Stopped,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal:?} -> {next:?} must be rejected");
            }
        }
    }

    #[test]
    fn running_never_returns_to_queued() {
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
    }
}
