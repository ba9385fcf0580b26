//! Static stride scheduler
//!
//! Turns a frozen weight vector into a deterministic pick sequence whose
//! long-run index frequencies are proportional to the weights. Weights are
//! conditioned once at construction (fixed-point, ratio-bounded), so a pick
//! costs one shared atomic increment and a few integer operations: no
//! floating point, no locks, no per-pick allocation.

use std::fmt;

/// Fixed-point weight resolution. One stride distributes this many
/// generation credits; an endpoint with `weights_[i] == MAX_WEIGHT` is
/// accepted on every pass.
const MAX_WEIGHT: u16 = u16::MAX;

/// Largest allowed ratio between one weight and the mean weight. Bounds the
/// schedule share a single fat reporter can claim, and with it the number of
/// rejected candidates per pick.
const MAX_RATIO: f64 = 10.0;

/// Smallest allowed ratio between one weight and the mean weight, so a
/// nearly-idle endpoint is still exercised often enough to refresh its load
/// report.
const MIN_RATIO: f64 = 0.1;

/// Immutable weighted index selector.
///
/// Construction conditions the weights; [`pick`](Self::pick) then only reads
/// frozen state, which makes the scheduler safe to share with any number of
/// concurrent pickers. The caller supplies the sequence generator, normally
/// a `fetch_add` on an atomic shared across scheduler generations so the
/// schedule position survives rebuilds.
pub struct StaticStrideScheduler {
    weights: Vec<u16>,
    next_sequence: Box<dyn Fn() -> u32 + Send + Sync>,
}

impl fmt::Debug for StaticStrideScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticStrideScheduler")
            .field("weights", &self.weights)
            .finish()
    }
}

impl StaticStrideScheduler {
    /// Builds a scheduler from the raw weight vector.
    ///
    /// Returns `None` when fewer than two weights are positive; with that
    /// little spread a weighted schedule is meaningless and the caller falls
    /// back to plain round-robin.
    pub fn new(
        input_weights: &[f32],
        next_sequence: Box<dyn Fn() -> u32 + Send + Sync>,
    ) -> Option<Self> {
        if input_weights.len() < 2 {
            return None;
        }
        let mut sum = 0.0f64;
        let mut num_positive = 0usize;
        for &weight in input_weights {
            if weight > 0.0 {
                sum += f64::from(weight);
                num_positive += 1;
            }
        }
        if num_positive < 2 {
            return None;
        }
        let mean = sum / num_positive as f64;

        // Endpoints without a usable weight take the mean so they keep
        // receiving traffic; the rest are clamped so one outlier can neither
        // monopolize nor starve the schedule.
        let mut conditioned = Vec::with_capacity(input_weights.len());
        let mut max_weight = 0.0f64;
        for &weight in input_weights {
            let weight = if weight > 0.0 {
                f64::from(weight).clamp(MIN_RATIO * mean, MAX_RATIO * mean)
            } else {
                mean
            };
            max_weight = max_weight.max(weight);
            conditioned.push(weight);
        }

        // Scale so the largest weight gets MAX_WEIGHT credits per stride.
        let scale = f64::from(MAX_WEIGHT) / max_weight;
        let weights = conditioned
            .into_iter()
            .map(|weight| (scale * weight).round() as u16)
            .collect();

        Some(Self {
            weights,
            next_sequence,
        })
    }

    /// Returns the next index, in long-run proportion to the weights.
    ///
    /// The sequence number splits into a candidate index (`sequence mod n`)
    /// and a generation counter. A candidate is accepted when its credit
    /// reaches the generation's earliest-deadline threshold, i.e. `weight`
    /// times per `MAX_WEIGHT` generations, spread evenly; the index offset
    /// staggers the acceptance pattern of equal-weight neighbors. At least
    /// one index is accepted on every pass, so the loop is bounded by the
    /// capped weight ratio.
    pub fn pick(&self) -> usize {
        const OFFSET: u64 = (MAX_WEIGHT / 2) as u64;
        loop {
            let sequence = (self.next_sequence)();
            let index = sequence as usize % self.weights.len();
            let generation = u64::from(sequence) / self.weights.len() as u64;
            let weight = u64::from(self.weights[index]);
            if (weight * generation + index as u64 * OFFSET) % u64::from(MAX_WEIGHT)
                < u64::from(MAX_WEIGHT) - weight
            {
                continue;
            }
            return index;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    fn sequence_from_zero() -> Box<dyn Fn() -> u32 + Send + Sync> {
        let sequence = Arc::new(AtomicU32::new(0));
        Box::new(move || sequence.fetch_add(1, Ordering::Relaxed))
    }

    fn pick_counts(scheduler: &StaticStrideScheduler, n: usize, picks: usize) -> Vec<usize> {
        let mut counts = vec![0usize; n];
        for _ in 0..picks {
            counts[scheduler.pick()] += 1;
        }
        counts
    }

    #[test]
    fn declines_with_insufficient_positive_weights() {
        for weights in [
            &[][..],
            &[1.0][..],
            &[0.0, 0.0][..],
            &[1.0, 0.0][..],
            &[0.0, 0.0, 3.0][..],
        ] {
            assert!(
                StaticStrideScheduler::new(weights, sequence_from_zero()).is_none(),
                "{weights:?}"
            );
        }
    }

    #[test]
    fn equal_weights_degenerate_to_round_robin() {
        let scheduler = StaticStrideScheduler::new(&[3.0, 3.0], sequence_from_zero()).unwrap();
        let picks: Vec<usize> = (0..6).map(|_| scheduler.pick()).collect();
        assert_eq!(picks, vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn picks_are_proportional_to_weights() {
        let weights = [1.0, 2.0, 3.0];
        let scheduler = StaticStrideScheduler::new(&weights, sequence_from_zero()).unwrap();
        let picks = 6000;
        let counts = pick_counts(&scheduler, weights.len(), picks);
        let total: f64 = weights.iter().map(|&w| f64::from(w)).sum();
        for (index, &weight) in weights.iter().enumerate() {
            let expected = picks as f64 * f64::from(weight) / total;
            let actual = counts[index] as f64;
            assert!(
                (actual - expected).abs() <= expected * 0.1,
                "index {index}: {actual} picks, expected about {expected}"
            );
        }
    }

    #[test]
    fn zero_weight_takes_the_mean_share() {
        let scheduler =
            StaticStrideScheduler::new(&[2.0, 0.0, 2.0], sequence_from_zero()).unwrap();
        let counts = pick_counts(&scheduler, 3, 3000);
        // All three end up at the mean, so shares are roughly uniform.
        for (index, &count) in counts.iter().enumerate() {
            assert!(
                (900..=1100).contains(&count),
                "index {index}: {count} picks"
            );
        }
    }

    #[test]
    fn outlier_weights_are_ratio_bounded() {
        // One reporter claims 1000x its peers. The cap holds it to at most
        // MAX_RATIO times the mean and the floor keeps every peer above
        // MIN_RATIO of the mean.
        let mut weights = vec![1.0f32; 10];
        weights.push(1000.0);
        let scheduler = StaticStrideScheduler::new(&weights, sequence_from_zero()).unwrap();
        let picks = 20_000;
        let counts = pick_counts(&scheduler, weights.len(), picks);
        let fat_share = counts[10] as f64 / picks as f64;
        assert!(fat_share < 0.93, "fat endpoint took {fat_share}");
        for (index, &count) in counts.iter().enumerate().take(10) {
            let share = count as f64 / picks as f64;
            assert!(share > 0.004, "index {index} starved with share {share}");
        }
    }

    #[test]
    fn picked_indices_are_in_range() {
        let weights = [5.0, 0.0, 1.0, 9.0];
        let scheduler = StaticStrideScheduler::new(&weights, sequence_from_zero()).unwrap();
        for _ in 0..1000 {
            assert!(scheduler.pick() < weights.len());
        }
    }

    #[test]
    fn concurrent_picks_share_the_sequence() {
        let sequence = Arc::new(AtomicU32::new(0));
        let scheduler = Arc::new(
            StaticStrideScheduler::new(&[1.0, 1.0], {
                let sequence = sequence.clone();
                Box::new(move || sequence.fetch_add(1, Ordering::Relaxed))
            })
            .unwrap(),
        );
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let scheduler = scheduler.clone();
                std::thread::spawn(move || {
                    let mut counts = [0usize; 2];
                    for _ in 0..1000 {
                        counts[scheduler.pick()] += 1;
                    }
                    counts
                })
            })
            .collect();
        let mut counts = [0usize; 2];
        for handle in handles {
            let thread_counts = handle.join().unwrap();
            counts[0] += thread_counts[0];
            counts[1] += thread_counts[1];
        }
        assert_eq!(counts[0] + counts[1], 4000);
        assert!(counts[0].abs_diff(counts[1]) <= 4, "{counts:?}");
    }
}
