/// Running statistics and their cross-rank reduction
use std::fmt;
use std::time::Instant;

use crate::distributed::ExecutionContext;
use crate::Result;

/// Weighted running mean of a scalar
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStat {
    /// Last value passed to `update`
    pub val: f64,
    pub sum: f64,
    pub count: f64,
    pub avg: f64,
}

impl RunningStat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn update(&mut self, value: f64, weight: f64) {
        self.val = value;
        self.sum += value * weight;
        self.count += weight;
        self.refresh();
    }

    /// Overwrite totals with globally reduced values
    pub fn set_totals(&mut self, sum: f64, count: f64) {
        self.sum = sum;
        self.count = count;
        self.refresh();
    }

    fn refresh(&mut self) {
        self.avg = if self.count > 0.0 { self.sum / self.count } else { 0.0 };
    }
}

/// Snapshot emitted every `print_freq` batches
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRecord {
    pub batch: usize,
    pub batches_per_epoch: usize,
    /// Samples per second for the last batch, across all ranks
    pub speed: f64,
    pub avg_speed: f64,
    pub batch_time: f64,
    pub avg_batch_time: f64,
    pub loss: f64,
    pub avg_loss: f64,
    pub top1: f64,
    pub avg_top1: f64,
    pub top5: f64,
    pub avg_top5: f64,
}

impl fmt::Display for ProgressRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Test: [{}/{}]\tTime {:.3} ({:.3})\tSpeed {:.3} ({:.3})\tLoss {:.4} ({:.4})\tPrec@1 {:.3} ({:.3})\tPrec@5 {:.3} ({:.3})",
            self.batch,
            self.batches_per_epoch,
            self.batch_time,
            self.avg_batch_time,
            self.speed,
            self.avg_speed,
            self.loss,
            self.avg_loss,
            self.top1,
            self.avg_top1,
            self.top5,
            self.avg_top5
        )
    }
}

/// Rank-local evaluation metrics
///
/// `record` never synchronizes. `reduce_across_ranks` is the single
/// collective call: it sums every stat's (sum, count) pair together with the
/// substitution counter, then recomputes each average from the global totals.
#[derive(Debug)]
pub struct MetricAggregator {
    pub loss: RunningStat,
    /// One stat per requested k, in `ks` order
    pub topk: Vec<RunningStat>,
    pub batch_time: RunningStat,
    ks: Vec<usize>,
    substitutions: u64,
    world_size: usize,
    last: Instant,
}

impl MetricAggregator {
    pub fn new(ks: &[usize], world_size: usize) -> Self {
        Self {
            loss: RunningStat::new(),
            topk: vec![RunningStat::new(); ks.len()],
            batch_time: RunningStat::new(),
            ks: ks.to_vec(),
            substitutions: 0,
            world_size: world_size.max(1),
            last: Instant::now(),
        }
    }

    pub fn ks(&self) -> &[usize] {
        &self.ks
    }

    pub fn reset(&mut self) {
        self.loss.reset();
        self.topk.iter_mut().for_each(RunningStat::reset);
        self.batch_time.reset();
        self.substitutions = 0;
        self.last = Instant::now();
    }

    /// Restart the batch timer without touching the stats
    pub fn start_timer(&mut self) {
        self.last = Instant::now();
    }

    /// Accumulate one batch
    ///
    /// # Arguments
    /// * `loss` - Mean loss over the batch's valid rows
    /// * `accuracies` - Top-k percentages, aligned with `ks`
    /// * `valid` - Number of valid rows; the update weight
    /// * `substitutions` - Corrupt samples replaced in this batch
    pub fn record(&mut self, loss: f64, accuracies: &[f64], valid: usize, substitutions: usize) {
        let elapsed = self.last.elapsed();
        self.last = Instant::now();
        self.batch_time.update(elapsed.as_secs_f64(), 1.0);

        let weight = valid as f64;
        self.loss.update(loss, weight);
        for (stat, &acc) in self.topk.iter_mut().zip(accuracies) {
            stat.update(acc, weight);
        }
        self.substitutions += substitutions as u64;
    }

    pub fn substitutions(&self) -> u64 {
        self.substitutions
    }

    /// Accuracy average for cut-off `k`, if it was requested
    pub fn avg_topk(&self, k: usize) -> Option<f64> {
        self.ks
            .iter()
            .position(|&x| x == k)
            .map(|i| self.topk[i].avg)
    }

    fn value_topk(&self, k: usize) -> Option<f64> {
        self.ks
            .iter()
            .position(|&x| x == k)
            .map(|i| self.topk[i].val)
    }

    /// Rank-local progress snapshot for `batch` (1-based)
    ///
    /// Throughput counts the global batch, `batch_size × world_size`.
    pub fn progress(&self, batch: usize, batches_per_epoch: usize, batch_size: usize) -> ProgressRecord {
        let global_batch = (batch_size * self.world_size) as f64;
        let speed_of = |secs: f64| if secs > 0.0 { global_batch / secs } else { 0.0 };
        ProgressRecord {
            batch,
            batches_per_epoch,
            speed: speed_of(self.batch_time.val),
            avg_speed: speed_of(self.batch_time.avg),
            batch_time: self.batch_time.val,
            avg_batch_time: self.batch_time.avg,
            loss: self.loss.val,
            avg_loss: self.loss.avg,
            top1: self.value_topk(1).unwrap_or(0.0),
            avg_top1: self.avg_topk(1).unwrap_or(0.0),
            top5: self.value_topk(5).unwrap_or(0.0),
            avg_top5: self.avg_topk(5).unwrap_or(0.0),
        }
    }

    /// Combine totals across all ranks in one collective call
    ///
    /// After this returns every rank holds identical global totals. In a
    /// single-process context the call leaves everything unchanged.
    pub fn reduce_across_ranks(&mut self, ctx: &dyn ExecutionContext) -> Result<()> {
        let mut packed = Vec::with_capacity(2 * (self.topk.len() + 1) + 1);
        packed.push(self.loss.sum);
        packed.push(self.loss.count);
        for stat in &self.topk {
            packed.push(stat.sum);
            packed.push(stat.count);
        }
        packed.push(self.substitutions as f64);

        ctx.all_reduce_sum(&mut packed)?;

        self.loss.set_totals(packed[0], packed[1]);
        for (i, stat) in self.topk.iter_mut().enumerate() {
            stat.set_totals(packed[2 + 2 * i], packed[3 + 2 * i]);
        }
        self.substitutions = packed[packed.len() - 1].round() as u64;
        Ok(())
    }

    /// Total weight of the loss stat (samples seen)
    pub fn samples(&self) -> f64 {
        self.loss.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{DistributedContext, LocalContext, ThreadGroup};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_reset_then_single_update() {
        let mut stat = RunningStat::new();
        stat.update(3.0, 4.0);
        stat.reset();
        stat.update(7.5, 1.0);
        assert_eq!(stat.avg, 7.5);
        assert_eq!(stat.val, 7.5);
    }

    #[test]
    fn test_zero_count_average_is_zero() {
        let mut stat = RunningStat::new();
        stat.update(42.0, 0.0);
        assert_eq!(stat.avg, 0.0);
        assert_eq!(stat.val, 42.0);
    }

    #[test]
    fn test_weighted_average() {
        let mut stat = RunningStat::new();
        stat.update(10.0, 1.0);
        stat.update(40.0, 3.0);
        assert_eq!(stat.sum, 130.0);
        assert_eq!(stat.count, 4.0);
        assert_eq!(stat.avg, 32.5);
    }

    #[test]
    fn test_local_reduce_is_noop() {
        let mut agg = MetricAggregator::new(&[1, 5], 1);
        agg.record(2.0, &[50.0, 100.0], 4, 1);
        agg.reduce_across_ranks(&LocalContext).unwrap();
        assert_eq!(agg.loss.avg, 2.0);
        assert_eq!(agg.avg_topk(1), Some(50.0));
        assert_eq!(agg.substitutions(), 1);
        assert_eq!(agg.samples(), 4.0);
    }

    #[test]
    fn test_reduce_weights_by_count_not_by_rank() {
        // rank 0: sum 10 over 2 samples, rank 1: sum 100 over 8 samples
        let group = ThreadGroup::create(2, Duration::from_secs(5)).unwrap();
        let handles: Vec<_> = group
            .into_iter()
            .map(|member| {
                std::thread::spawn(move || {
                    let ctx = DistributedContext::new(Arc::new(member));
                    let mut agg = MetricAggregator::new(&[1], 2);
                    if ctx.rank() == 0 {
                        agg.record(5.0, &[5.0], 2, 0);
                    } else {
                        agg.record(12.5, &[12.5], 8, 3);
                    }
                    agg.reduce_across_ranks(&ctx).unwrap();
                    (agg.loss.sum, agg.loss.count, agg.loss.avg, agg.avg_topk(1), agg.substitutions())
                })
            })
            .collect();
        for h in handles {
            let (sum, count, avg, top1, subs) = h.join().unwrap();
            assert_eq!(sum, 110.0);
            assert_eq!(count, 10.0);
            assert_eq!(avg, 11.0);
            assert_eq!(top1, Some(11.0));
            assert_eq!(subs, 3);
        }
    }

    #[test]
    fn test_progress_line_format() {
        let record = ProgressRecord {
            batch: 10,
            batches_per_epoch: 40,
            speed: 100.0,
            avg_speed: 90.0,
            batch_time: 0.32,
            avg_batch_time: 0.35,
            loss: 1.25,
            avg_loss: 1.5,
            top1: 50.0,
            avg_top1: 48.0,
            top5: 75.0,
            avg_top5: 74.0,
        };
        let line = record.to_string();
        assert!(line.starts_with("Test: [10/40]\tTime 0.320 (0.350)"));
        assert!(line.ends_with("Prec@5 75.000 (74.000)"));
    }
}
