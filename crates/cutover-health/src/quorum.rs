//! Quorum gate over a stream of health snapshots.

use tracing::debug;

use cutover_core::ProbeConfig;

use crate::prober::HealthSnapshot;

/// Decides when a group has been healthy for long enough.
///
/// A snapshot qualifies when the group is non-empty and its healthy
/// fraction meets the threshold. The gate opens after `required`
/// consecutive qualifying snapshots; any miss resets the streak.
/// Snapshots skipped by a slow consumer are not counted.
#[derive(Debug, Clone)]
pub struct QuorumGate {
    threshold: f64,
    required: u32,
    streak: u32,
    last_sequence: u64,
}

impl QuorumGate {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            threshold: config.healthy_threshold,
            required: config.required_snapshots(),
            streak: 0,
            last_sequence: 0,
        }
    }

    /// Feed one snapshot; returns true once quorum has been sustained.
    pub fn observe(&mut self, snapshot: &HealthSnapshot) -> bool {
        if snapshot.sequence <= self.last_sequence {
            return self.is_met();
        }
        self.last_sequence = snapshot.sequence;

        if snapshot.total > 0 && snapshot.healthy_fraction() >= self.threshold {
            self.streak += 1;
        } else {
            if self.streak > 0 {
                debug!(
                    group = %snapshot.group_id,
                    healthy = snapshot.healthy,
                    total = snapshot.total,
                    "quorum streak reset"
                );
            }
            self.streak = 0;
        }
        self.is_met()
    }

    pub fn is_met(&self) -> bool {
        self.streak >= self.required
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn required(&self) -> u32 {
        self.required
    }
}
