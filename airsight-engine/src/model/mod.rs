//! Gradient-boosted regression trees (squared loss)
//!
//! Each round fits a depth-limited `RegressionTree` to the current residuals
//! and adds it scaled by the learning rate. The starting score is the target
//! mean. Models serialize to JSON for the registry.

pub mod metrics;
pub mod tree;

pub use metrics::ModelMetrics;
pub use tree::{Node, RegressionTree};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TrainerConfig;
use tree::{BinnedFeatures, TreeParams};

/// Model fitting errors
#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("Empty training set")]
    EmptyTrainingSet,

    #[error("Row {row} has {got} features, expected {expected}")]
    DimensionMismatch {
        row: usize,
        expected: usize,
        got: usize,
    },

    #[error("Non-finite value in {0}")]
    NonFinite(String),
}

/// Ensemble hyperparameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GbtParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub min_samples_leaf: usize,
    pub max_bins: usize,
}

impl Default for GbtParams {
    fn default() -> Self {
        Self::from(&TrainerConfig::default())
    }
}

impl From<&TrainerConfig> for GbtParams {
    fn from(config: &TrainerConfig) -> Self {
        Self {
            n_trees: config.n_trees,
            max_depth: config.max_depth,
            learning_rate: config.learning_rate,
            min_samples_leaf: config.min_samples_leaf,
            max_bins: config.max_bins,
        }
    }
}

/// Fitted ensemble
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostedModel {
    base_score: f64,
    learning_rate: f64,
    n_features: usize,
    trees: Vec<RegressionTree>,
}

impl GradientBoostedModel {
    pub fn fit(
        rows: &[Vec<f64>],
        targets: &[f64],
        params: &GbtParams,
    ) -> Result<Self, ModelError> {
        if rows.is_empty() || rows.len() != targets.len() {
            return Err(ModelError::EmptyTrainingSet);
        }
        let n_features = rows[0].len();
        for (i, row) in rows.iter().enumerate() {
            if row.len() != n_features {
                return Err(ModelError::DimensionMismatch {
                    row: i,
                    expected: n_features,
                    got: row.len(),
                });
            }
            if row.iter().any(|v| !v.is_finite()) {
                return Err(ModelError::NonFinite(format!("features of row {}", i)));
            }
        }
        if targets.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite("targets".to_string()));
        }

        let base_score = targets.iter().sum::<f64>() / targets.len() as f64;
        let binned = BinnedFeatures::new(rows, n_features, params.max_bins);
        let tree_params = TreeParams {
            max_depth: params.max_depth,
            min_samples_leaf: params.min_samples_leaf.max(1),
        };

        let mut predictions = vec![base_score; targets.len()];
        let mut residuals = vec![0.0; targets.len()];
        let mut trees = Vec::with_capacity(params.n_trees);

        for _ in 0..params.n_trees {
            for ((r, t), p) in residuals.iter_mut().zip(targets).zip(&predictions) {
                *r = t - p;
            }
            let all_rows = (0..rows.len()).collect();
            let tree = RegressionTree::fit(&binned, &residuals, all_rows, tree_params);
            for (p, row) in predictions.iter_mut().zip(rows) {
                *p += params.learning_rate * tree.predict(row);
            }
            trees.push(tree);
        }

        if predictions.iter().any(|p| !p.is_finite()) {
            return Err(ModelError::NonFinite("training predictions".to_string()));
        }

        Ok(Self {
            base_score,
            learning_rate: params.learning_rate,
            n_features,
            trees,
        })
    }

    pub fn predict(&self, row: &[f64]) -> f64 {
        self.base_score
            + self.learning_rate * self.trees.iter().map(|t| t.predict(row)).sum::<f64>()
    }

    pub fn predict_batch(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        rows.iter().map(|r| self.predict(r)).collect()
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }
}
