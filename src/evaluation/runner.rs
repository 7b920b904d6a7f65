/// Forward pass, loss and top-k accuracy for one batch
use candle_core::{DType, Tensor};

use crate::data::Batch;
use crate::models::Classifier;
use crate::{EvalError, Result};

/// Scalar loss over a batch of logits
pub trait Criterion: Send + Sync {
    /// # Arguments
    /// * `logits` - `[n, num_classes]`
    /// * `labels` - `[n]` u32 class indices
    ///
    /// # Returns
    /// Mean loss as a scalar tensor
    fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor>;
}

/// Mean softmax cross-entropy
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyCriterion;

impl Criterion for CrossEntropyCriterion {
    fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let logits = logits.to_dtype(DType::F32)?;
        Ok(candle_nn::loss::cross_entropy(&logits, labels)?)
    }
}

/// What one batch contributes to the metrics
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    /// Mean loss over valid rows; 0 when there are none
    pub loss: f64,
    /// Correct predictions per requested k
    pub correct: Vec<usize>,
    /// Rows that carry weight
    pub valid: usize,
}

impl BatchOutcome {
    fn empty(num_ks: usize) -> Self {
        Self {
            loss: 0.0,
            correct: vec![0; num_ks],
            valid: 0,
        }
    }

    /// Top-k accuracies in percent, aligned with the runner's ks
    pub fn accuracies(&self) -> Vec<f64> {
        self.correct
            .iter()
            .map(|&c| {
                if self.valid == 0 {
                    0.0
                } else {
                    100.0 * c as f64 / self.valid as f64
                }
            })
            .collect()
    }
}

/// Runs batches through a classifier without touching its parameters
pub struct InferenceRunner {
    criterion: Box<dyn Criterion>,
    ks: Vec<usize>,
}

impl InferenceRunner {
    /// Runner with cross-entropy loss
    pub fn new(ks: &[usize]) -> Self {
        Self::with_criterion(ks, Box::new(CrossEntropyCriterion))
    }

    pub fn with_criterion(ks: &[usize], criterion: Box<dyn Criterion>) -> Self {
        Self {
            criterion,
            ks: ks.to_vec(),
        }
    }

    pub fn ks(&self) -> &[usize] {
        &self.ks
    }

    /// Evaluate one batch
    ///
    /// Loss and accuracy consider only rows whose ignore flag is clear.
    pub fn run(&self, model: &dyn Classifier, batch: &Batch) -> Result<BatchOutcome> {
        let valid_rows: Vec<u32> = batch
            .ignore
            .iter()
            .enumerate()
            .filter(|&(_, &ignored)| !ignored)
            .map(|(i, _)| i as u32)
            .collect();
        if valid_rows.is_empty() {
            return Ok(BatchOutcome::empty(self.ks.len()));
        }

        let logits = model.forward(&batch.images)?.detach();
        let (rows, classes) = logits.dims2()?;
        if rows != batch.len() {
            return Err(EvalError::Model(format!(
                "model returned {} rows for a batch of {}",
                rows,
                batch.len()
            )));
        }

        let labels: Vec<u32> = valid_rows.iter().map(|&i| batch.labels[i as usize]).collect();
        if let Some(&bad) = labels.iter().find(|&&l| l as usize >= classes) {
            return Err(EvalError::Model(format!(
                "label {} out of range for {} classes",
                bad, classes
            )));
        }

        let logits = if valid_rows.len() < rows {
            let idx = Tensor::from_vec(valid_rows.clone(), valid_rows.len(), logits.device())?;
            logits.index_select(&idx, 0)?
        } else {
            logits
        };
        let label_tensor = Tensor::from_vec(labels.clone(), labels.len(), logits.device())?;

        let loss = self
            .criterion
            .compute(&logits, &label_tensor)?
            .to_dtype(DType::F32)?
            .to_scalar::<f32>()? as f64;
        let scores = logits.to_dtype(DType::F32)?.to_vec2::<f32>()?;

        Ok(BatchOutcome {
            loss,
            correct: topk_correct(&scores, &labels, &self.ks),
            valid: labels.len(),
        })
    }
}

/// Count rows whose label ranks among the k highest scores, for each k
///
/// Ranking follows a stable sort by descending score, so among equal scores
/// the lower class index wins. `k` is clamped to the class count. A NaN score
/// ranks below every number, and a row whose true class scores NaN is never
/// counted correct.
pub fn topk_correct(scores: &[Vec<f32>], labels: &[u32], ks: &[usize]) -> Vec<usize> {
    let mut correct = vec![0; ks.len()];
    for (row, &label) in scores.iter().zip(labels) {
        let label = label as usize;
        let Some(&target) = row.get(label).filter(|t| !t.is_nan()) else {
            continue;
        };
        let rank = row
            .iter()
            .enumerate()
            .filter(|&(j, &s)| !s.is_nan() && (s > target || (s == target && j < label)))
            .count();
        for (slot, &k) in correct.iter_mut().zip(ks) {
            if rank < k.min(row.len()) {
                *slot += 1;
            }
        }
    }
    correct
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    /// Returns its input as logits
    struct Passthrough;

    impl Classifier for Passthrough {
        fn forward(&self, images: &Tensor) -> candle_core::Result<Tensor> {
            Ok(images.clone())
        }
        fn set_training(&mut self, _training: bool) {}
        fn is_training(&self) -> bool {
            false
        }
        fn parameters(&self) -> Result<Vec<(String, Var)>> {
            Ok(Vec::new())
        }
    }

    fn batch(logits: &[[f32; 4]], labels: &[u32], ignore: &[bool]) -> Batch {
        let flat: Vec<f32> = logits.iter().flatten().copied().collect();
        Batch {
            index: 0,
            images: Tensor::from_vec(flat, (logits.len(), 4), &Device::Cpu).unwrap(),
            labels: labels.to_vec(),
            ignore: ignore.to_vec(),
            events: Vec::new(),
        }
    }

    #[test]
    fn test_topk_counts() {
        let scores = vec![vec![0.1, 0.9, 0.5, 0.0], vec![0.8, 0.1, 0.05, 0.05]];
        assert_eq!(topk_correct(&scores, &[2, 0], &[1, 2]), vec![1, 2]);
    }

    #[test]
    fn test_topk_clamps_to_class_count() {
        let scores = vec![vec![0.3, 0.2, 0.1]];
        assert_eq!(topk_correct(&scores, &[2], &[1, 5, 100]), vec![0, 1, 1]);
    }

    #[test]
    fn test_ties_favour_lower_class_index() {
        let scores = vec![vec![1.0, 1.0, 1.0]];
        assert_eq!(topk_correct(&scores, &[0], &[1]), vec![1]);
        assert_eq!(topk_correct(&scores, &[2], &[1, 2, 3]), vec![0, 0, 1]);
    }

    #[test]
    fn test_nan_scores_are_never_correct() {
        let nan = f32::NAN;
        assert_eq!(topk_correct(&[vec![nan; 4]], &[3], &[1, 5]), vec![0, 0]);
        assert_eq!(topk_correct(&[vec![nan; 4]], &[0], &[1]), vec![0]);
        assert_eq!(topk_correct(&[vec![0.0, nan, 0.5, 0.1]], &[1], &[1, 4]), vec![0, 0]);
    }

    #[test]
    fn test_nan_competitors_rank_last() {
        let nan = f32::NAN;
        assert_eq!(topk_correct(&[vec![nan, nan, -3.0, nan]], &[2], &[1]), vec![1]);
        assert_eq!(topk_correct(&[vec![nan, 0.2, 0.7]], &[1], &[1, 2]), vec![0, 1]);
    }

    #[test]
    fn test_top5_never_below_top1() {
        let rows: Vec<Vec<f32>> = (0..50)
            .map(|i| (0..10).map(|j| ((i * 7 + j * 13) % 17) as f32).collect())
            .collect();
        let labels: Vec<u32> = (0..50).map(|i| (i % 10) as u32).collect();
        let counts = topk_correct(&rows, &labels, &[1, 5]);
        assert!(counts[1] >= counts[0]);
    }

    #[test]
    fn test_ignored_rows_do_not_count() -> Result<()> {
        let runner = InferenceRunner::new(&[1, 5]);
        let b = batch(
            &[[5.0, 0.0, 0.0, 0.0], [0.0, 5.0, 0.0, 0.0], [0.0, 5.0, 0.0, 0.0]],
            &[0, 3, 3],
            &[false, false, true],
        );
        let outcome = runner.run(&Passthrough, &b)?;
        assert_eq!(outcome.valid, 2);
        assert_eq!(outcome.correct, vec![1, 2]);
        assert_eq!(outcome.accuracies(), vec![50.0, 100.0]);
        Ok(())
    }

    #[test]
    fn test_loss_matches_uniform_logits() -> Result<()> {
        let runner = InferenceRunner::new(&[1]);
        let b = batch(&[[0.0; 4], [0.0; 4]], &[1, 2], &[false, false]);
        let outcome = runner.run(&Passthrough, &b)?;
        assert!((outcome.loss - 4f64.ln()).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_all_ignored_batch_has_zero_weight() -> Result<()> {
        let runner = InferenceRunner::new(&[1, 5]);
        let b = batch(&[[1.0, 0.0, 0.0, 0.0]], &[0], &[true]);
        let outcome = runner.run(&Passthrough, &b)?;
        assert_eq!(outcome.valid, 0);
        assert_eq!(outcome.accuracies(), vec![0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_out_of_range_label_is_model_error() {
        let runner = InferenceRunner::new(&[1]);
        let b = batch(&[[1.0, 0.0, 0.0, 0.0]], &[9], &[false]);
        assert!(matches!(runner.run(&Passthrough, &b), Err(EvalError::Model(_))));
    }
}
