//! Histogram-based regression tree
//!
//! Nodes live in a flat `Vec`; a split sends `row[feature] <= threshold`
//! left. Candidate thresholds are per-feature quantiles computed once per
//! ensemble (see `BinnedFeatures`), which keeps each split search linear in
//! the number of rows.

use serde::{Deserialize, Serialize};

/// Tree node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// Growth limits for one tree
#[derive(Debug, Clone, Copy)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
}

/// Feature values pre-bucketed against quantile thresholds
pub struct BinnedFeatures {
    /// thresholds[f] ascending, deduplicated
    thresholds: Vec<Vec<f64>>,
    /// bins[f][row]: index of the first threshold ≥ value, or thresholds[f].len()
    bins: Vec<Vec<u16>>,
}

impl BinnedFeatures {
    pub fn new(rows: &[Vec<f64>], n_features: usize, max_bins: usize) -> Self {
        let max_bins = max_bins.clamp(2, u16::MAX as usize);
        let mut thresholds = Vec::with_capacity(n_features);
        let mut bins = Vec::with_capacity(n_features);

        for f in 0..n_features {
            let mut values: Vec<f64> = rows.iter().map(|r| r[f]).collect();
            values.sort_by(|a, b| a.total_cmp(b));

            let mut cuts: Vec<f64> = (1..max_bins)
                .map(|i| values[(i * values.len() / max_bins).min(values.len() - 1)])
                .collect();
            cuts.dedup();

            let feature_bins = rows
                .iter()
                .map(|r| cuts.partition_point(|t| *t < r[f]) as u16)
                .collect();

            thresholds.push(cuts);
            bins.push(feature_bins);
        }

        Self { thresholds, bins }
    }

    pub fn n_features(&self) -> usize {
        self.thresholds.len()
    }
}

struct BestSplit {
    feature: usize,
    bin: usize,
    gain: f64,
}

/// Regression tree fitted to residuals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    /// Fit to `residuals` over the row subset `rows`
    pub fn fit(
        binned: &BinnedFeatures,
        residuals: &[f64],
        rows: Vec<usize>,
        params: TreeParams,
    ) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.grow(binned, residuals, rows, 0, params);
        tree
    }

    fn grow(
        &mut self,
        binned: &BinnedFeatures,
        residuals: &[f64],
        rows: Vec<usize>,
        depth: usize,
        params: TreeParams,
    ) -> usize {
        let n = rows.len();
        let sum: f64 = rows.iter().map(|&i| residuals[i]).sum();
        let index = self.nodes.len();
        self.nodes.push(Node::Leaf {
            value: if n == 0 { 0.0 } else { sum / n as f64 },
        });

        if depth >= params.max_depth || n < 2 * params.min_samples_leaf {
            return index;
        }

        let Some(best) = best_split(binned, residuals, &rows, sum, params.min_samples_leaf) else {
            return index;
        };

        let column = &binned.bins[best.feature];
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|&i| (column[i] as usize) <= best.bin);

        let left = self.grow(binned, residuals, left_rows, depth + 1, params);
        let right = self.grow(binned, residuals, right_rows, depth + 1, params);
        self.nodes[index] = Node::Split {
            feature: best.feature,
            threshold: binned.thresholds[best.feature][best.bin],
            left,
            right,
        };
        index
    }

    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut index = 0;
        loop {
            match self.nodes.get(index) {
                Some(Node::Leaf { value }) => return *value,
                Some(Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    index = if row.get(*feature).copied().unwrap_or(0.0) <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
                None => return 0.0,
            }
        }
    }

    pub fn predict_batch(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        rows.iter().map(|r| self.predict(r)).collect()
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], index: usize) -> usize {
            match nodes.get(index) {
                Some(Node::Split { left, right, .. }) => {
                    1 + walk(nodes, *left).max(walk(nodes, *right))
                }
                _ => 0,
            }
        }
        walk(&self.nodes, 0)
    }
}

/// Variance-reduction split search over histogram bins
///
/// gain = S_L²/n_L + S_R²/n_R − S²/n. Ties keep the first feature and bin.
fn best_split(
    binned: &BinnedFeatures,
    residuals: &[f64],
    rows: &[usize],
    total_sum: f64,
    min_leaf: usize,
) -> Option<BestSplit> {
    let n = rows.len();
    let parent_score = total_sum * total_sum / n as f64;
    let mut best: Option<BestSplit> = None;

    for feature in 0..binned.n_features() {
        let n_thresholds = binned.thresholds[feature].len();
        if n_thresholds == 0 {
            continue;
        }
        let column = &binned.bins[feature];

        let mut counts = vec![0usize; n_thresholds + 1];
        let mut sums = vec![0.0f64; n_thresholds + 1];
        for &i in rows {
            let b = column[i] as usize;
            counts[b] += 1;
            sums[b] += residuals[i];
        }

        let mut n_left = 0usize;
        let mut s_left = 0.0f64;
        for bin in 0..n_thresholds {
            n_left += counts[bin];
            s_left += sums[bin];
            let n_right = n - n_left;
            if n_left < min_leaf || n_right < min_leaf {
                continue;
            }
            let s_right = total_sum - s_left;
            let gain = s_left * s_left / n_left as f64 + s_right * s_right / n_right as f64
                - parent_score;
            if gain > 1e-12 && best.as_ref().map_or(true, |b| gain > b.gain) {
                best = Some(BestSplit { feature, bin, gain });
            }
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(max_depth: usize) -> TreeParams {
        TreeParams {
            max_depth,
            min_samples_leaf: 1,
        }
    }

    #[test]
    fn test_stump_separates_step_function() {
        let rows: Vec<Vec<f64>> = (0..20).map(|i| vec![i as f64]).collect();
        let targets: Vec<f64> = (0..20).map(|i| if i < 10 { 0.0 } else { 10.0 }).collect();
        let binned = BinnedFeatures::new(&rows, 1, 64);

        let tree = RegressionTree::fit(&binned, &targets, (0..20).collect(), params(1));

        assert_eq!(tree.n_nodes(), 3);
        assert_eq!(tree.n_leaves(), 2);
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.predict(&[3.0]), 0.0);
        assert_eq!(tree.predict(&[15.0]), 10.0);
        assert_eq!(tree.predict_batch(&rows), targets);
    }

    #[test]
    fn test_constant_target_stays_a_leaf() {
        let rows: Vec<Vec<f64>> = (0..10).map(|i| vec![i as f64, 1.0]).collect();
        let targets = vec![4.0; 10];
        let binned = BinnedFeatures::new(&rows, 2, 16);
        let tree = RegressionTree::fit(&binned, &targets, (0..10).collect(), params(6));
        assert_eq!(tree.n_nodes(), 1);
        assert_eq!(tree.predict(&[100.0, 0.0]), 4.0);
    }

    #[test]
    fn test_min_samples_leaf_is_respected() {
        let rows: Vec<Vec<f64>> = (0..10).map(|i| vec![i as f64]).collect();
        let mut targets = vec![0.0; 10];
        targets[9] = 100.0;
        let binned = BinnedFeatures::new(&rows, 1, 64);
        let tree = RegressionTree::fit(
            &binned,
            &targets,
            (0..10).collect(),
            TreeParams {
                max_depth: 3,
                min_samples_leaf: 3,
            },
        );
        // The lone outlier cannot get a leaf of its own
        assert!(tree.predict(&[9.0]) < 100.0);
    }

    #[test]
    fn test_serializes_flat_nodes() {
        let rows: Vec<Vec<f64>> = (0..4).map(|i| vec![i as f64]).collect();
        let targets = vec![0.0, 0.0, 1.0, 1.0];
        let binned = BinnedFeatures::new(&rows, 1, 4);
        let tree = RegressionTree::fit(&binned, &targets, (0..4).collect(), params(1));
        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json["nodes"][0]["kind"], "split");
        let back: RegressionTree = serde_json::from_value(json).unwrap();
        assert_eq!(back, tree);
    }
}
