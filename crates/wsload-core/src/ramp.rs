use crate::config::{RampConfig, RampStage};

/// Deterministic ramp planner: stages are applied strictly in order, each one
/// moving linearly from the previous stage's target to its own. Integer
/// milliseconds and integer virtual-user counts only.
#[derive(Debug, Clone)]
pub struct RampPlanner {
    stages: Vec<RampStage>,
}

impl RampPlanner {
    pub fn new(config: RampConfig) -> Self {
        Self {
            stages: config.stages,
        }
    }

    /// Iterate stages strictly in order.
    pub fn stages(&self) -> &[RampStage] {
        &self.stages
    }

    /// Total duration of all ramp stages in milliseconds.
    pub fn total_duration_ms(&self) -> u64 {
        self.stages.iter().map(|s| s.duration_ms).sum()
    }

    /// Highest target any stage asks for.
    pub fn peak_target(&self) -> u32 {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    /// Index of the stage running at `elapsed_ms`, or `None` once the ramp is over.
    pub fn stage_index_at(&self, elapsed_ms: u64) -> Option<usize> {
        let mut cumulative_ms = 0u64;
        for (idx, stage) in self.stages.iter().enumerate() {
            if elapsed_ms < cumulative_ms + stage.duration_ms {
                return Some(idx);
            }
            cumulative_ms += stage.duration_ms;
        }
        None
    }

    /// Desired concurrency at `elapsed_ms`. Past the end of the ramp this is
    /// the last stage's target; the scheduler handles the final drain to zero.
    pub fn target_at(&self, elapsed_ms: u64) -> u32 {
        let mut from = 0u32;
        let mut cumulative_ms = 0u64;

        for stage in &self.stages {
            let end_ms = cumulative_ms + stage.duration_ms;
            if elapsed_ms < end_ms {
                let into = (elapsed_ms - cumulative_ms) as i128;
                let span = stage.duration_ms as i128;
                let delta = stage.target as i128 - from as i128;
                // Truncates toward `from`, so ramps never overshoot.
                return (from as i128 + delta * into / span) as u32;
            }
            from = stage.target;
            cumulative_ms = end_ms;
        }

        from
    }
}
