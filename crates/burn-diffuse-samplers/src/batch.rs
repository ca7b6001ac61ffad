//! Batch option expansion
//!
//! Expands one set of scheduler options into a series that sweeps a
//! single parameter, for side-by-side comparison runs.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::options::{SchedulerKind, SchedulerOptions};

/// Parameter swept by a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    #[default]
    Seed,
    Step,
    Guidance,
    Strength,
    Scheduler,
}

/// Batch sweep configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    pub kind: BatchKind,
    pub value_from: f32,
    pub value_to: f32,
    pub increment: f32,
    /// Number of seeds for a seed sweep
    pub count: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            kind: BatchKind::Seed,
            value_from: 0.0,
            value_to: 0.0,
            increment: 1.0,
            count: 1,
        }
    }
}

/// Expand `options` into the batch described by `batch`
///
/// Seeds are drawn from an RNG seeded with the base seed, so the same
/// request always expands to the same seed list. Step sweeps are
/// inclusive of both ends; guidance and strength sweeps step by
/// `increment` from `value_from` and stop before `value_to`.
pub fn generate_batch(batch: &BatchOptions, options: &SchedulerOptions) -> Vec<SchedulerOptions> {
    match batch.kind {
        BatchKind::Seed => {
            let mut rng = StdRng::seed_from_u64(options.seed);
            (0..batch.count.max(1))
                .map(|_| SchedulerOptions {
                    seed: rng.gen::<u32>() as u64,
                    ..options.clone()
                })
                .collect()
        }
        BatchKind::Step => {
            let from = batch.value_from.max(1.0) as usize;
            let to = (batch.value_to.max(0.0) as usize).max(from);
            (from..=to)
                .map(|inference_steps| SchedulerOptions {
                    inference_steps,
                    ..options.clone()
                })
                .collect()
        }
        BatchKind::Guidance => sweep(batch)
            .map(|guidance_scale| SchedulerOptions {
                guidance_scale,
                ..options.clone()
            })
            .collect(),
        BatchKind::Strength => sweep(batch)
            .map(|strength| SchedulerOptions {
                strength,
                ..options.clone()
            })
            .collect(),
        BatchKind::Scheduler => SchedulerKind::ALL
            .into_iter()
            .map(|scheduler| SchedulerOptions {
                scheduler,
                ..options.clone()
            })
            .collect(),
    }
}

fn sweep(batch: &BatchOptions) -> impl Iterator<Item = f32> + '_ {
    let increments = if batch.increment > 0.0 {
        ((batch.value_to - batch.value_from) / batch.increment).max(1.0) as usize
    } else {
        1
    };
    (0..increments).map(move |i| batch.value_from + batch.increment * i as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_batch_is_reproducible() {
        let batch = BatchOptions {
            kind: BatchKind::Seed,
            count: 4,
            ..Default::default()
        };
        let options = SchedulerOptions {
            seed: 1234,
            ..Default::default()
        };
        let a = generate_batch(&batch, &options);
        let b = generate_batch(&batch, &options);
        assert_eq!(a.len(), 4);
        assert_eq!(a, b);
    }

    #[test]
    fn test_step_batch_inclusive() {
        let batch = BatchOptions {
            kind: BatchKind::Step,
            value_from: 10.0,
            value_to: 13.0,
            ..Default::default()
        };
        let steps: Vec<usize> = generate_batch(&batch, &SchedulerOptions::default())
            .iter()
            .map(|o| o.inference_steps)
            .collect();
        assert_eq!(steps, vec![10, 11, 12, 13]);
    }

    #[test]
    fn test_guidance_batch() {
        let batch = BatchOptions {
            kind: BatchKind::Guidance,
            value_from: 4.0,
            value_to: 8.0,
            increment: 2.0,
            ..Default::default()
        };
        let scales: Vec<f32> = generate_batch(&batch, &SchedulerOptions::default())
            .iter()
            .map(|o| o.guidance_scale)
            .collect();
        assert_eq!(scales, vec![4.0, 6.0]);
    }

    #[test]
    fn test_scheduler_batch_keeps_other_fields() {
        let batch = BatchOptions {
            kind: BatchKind::Scheduler,
            ..Default::default()
        };
        let options = SchedulerOptions {
            seed: 5,
            inference_steps: 12,
            ..Default::default()
        };
        let expanded = generate_batch(&batch, &options);
        assert_eq!(expanded.len(), SchedulerKind::ALL.len());
        assert!(expanded.iter().all(|o| o.seed == 5 && o.inference_steps == 12));
    }
}
