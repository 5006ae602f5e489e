//! Inter-stem drift detection.
//!
//! Every stem plays on its own clock, so positions wander apart. A tick samples
//! all positions, picks a reference position, and decides whether the spread is
//! large enough to justify seeking every stem back into line. Corrections are
//! rate limited: seeking is audible, and a correction needs time to settle
//! before its effect can be measured again.

use std::collections::HashMap;
use tokio::time::{Duration, Instant};

use crate::settings::{DriftSettings, ReferencePolicy};

/// One stem's position as read at the start of a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftSample {
    pub label: String,
    pub position_ms: u64,
}

impl DriftSample {
    pub fn new(label: impl Into<String>, position_ms: u64) -> Self {
        Self {
            label: label.into(),
            position_ms,
        }
    }
}

/// What a tick decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriftVerdict {
    /// Nothing to sample
    Idle,
    InSync { max_deviation_ms: u64 },
    /// Out of tolerance, but the last correction is too recent
    CoolingDown { max_deviation_ms: u64 },
    Correct {
        reference_ms: u64,
        max_deviation_ms: u64,
    },
}

#[derive(Debug, Clone)]
pub struct DriftCorrector {
    settings: DriftSettings,
    policy: ReferencePolicy,
    priority_label: Option<String>,
    last_correction: Option<Instant>,
}

impl DriftCorrector {
    pub fn new(
        settings: DriftSettings,
        policy: ReferencePolicy,
        priority_label: Option<String>,
    ) -> Self {
        Self {
            settings,
            policy,
            priority_label,
            last_correction: None,
        }
    }

    pub fn settings(&self) -> &DriftSettings {
        &self.settings
    }

    /// Which stem the others follow under the configured policy. Progress
    /// and relative seeks read this stem's clock.
    pub fn reference_index(&self, samples: &[DriftSample]) -> Option<usize> {
        let first = samples.first()?;
        let modal = || {
            let position = modal_position(samples);
            samples.iter().position(|s| s.position_ms == position)
        };
        match self.policy {
            ReferencePolicy::FirstStem => Some(0),
            ReferencePolicy::Modal => modal(),
            ReferencePolicy::ModalWithPriority => {
                let disagree = samples.iter().any(|s| s.position_ms != first.position_ms);
                let priority = self
                    .priority_label
                    .as_deref()
                    .and_then(|label| samples.iter().position(|s| s.label == label));
                match priority {
                    Some(index) if disagree => Some(index),
                    _ => modal(),
                }
            }
        }
    }

    /// Position every stem should be pulled to
    pub fn reference_position(&self, samples: &[DriftSample]) -> Option<u64> {
        self.reference_index(samples)
            .and_then(|index| samples.get(index))
            .map(|s| s.position_ms)
    }

    pub fn assess(&self, samples: &[DriftSample], now: Instant) -> DriftVerdict {
        let Some(reference_ms) = self.reference_position(samples) else {
            return DriftVerdict::Idle;
        };

        let max_deviation_ms = samples
            .iter()
            .map(|s| s.position_ms.abs_diff(reference_ms))
            .max()
            .unwrap_or(0);

        if max_deviation_ms <= self.settings.tolerance_ms {
            return DriftVerdict::InSync { max_deviation_ms };
        }

        if self.in_cooldown(now) {
            return DriftVerdict::CoolingDown { max_deviation_ms };
        }

        DriftVerdict::Correct {
            reference_ms,
            max_deviation_ms,
        }
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        self.last_correction.is_some_and(|last| {
            now.saturating_duration_since(last) < Duration::from_millis(self.settings.cooldown_ms)
        })
    }

    /// Take new settings, keeping the correction history so a pending
    /// cooldown still applies
    pub fn reconfigure(
        &mut self,
        settings: DriftSettings,
        policy: ReferencePolicy,
        priority_label: Option<String>,
    ) {
        self.settings = settings;
        self.policy = policy;
        self.priority_label = priority_label;
    }

    pub fn record_correction(&mut self, now: Instant) {
        self.last_correction = Some(now);
    }

    pub fn last_correction(&self) -> Option<Instant> {
        self.last_correction
    }

    /// Forget correction history; a fresh session starts with no cooldown
    pub fn reset(&mut self) {
        self.last_correction = None;
    }
}

/// Most frequent position; ties go to the stem that comes first
fn modal_position(samples: &[DriftSample]) -> u64 {
    let mut counts: HashMap<u64, usize> = HashMap::new();
    for sample in samples {
        *counts.entry(sample.position_ms).or_insert(0) += 1;
    }

    let mut best: Option<(u64, usize)> = None;
    for sample in samples {
        let count = counts[&sample.position_ms];
        if best.map_or(true, |(_, best_count)| count > best_count) {
            best = Some((sample.position_ms, count));
        }
    }
    best.map(|(position, _)| position).unwrap_or(0)
}
