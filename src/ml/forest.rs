//! Bagged CART regression trees (random-forest regressor).
//!
//! Trees split on variance reduction over a random feature subset per node
//! and predict the mean target of their leaf; the forest averages its trees.
//! Every random draw comes from a `StdRng` derived from `random_state`, so a
//! fixed seed reproduces the same forest.

use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

/// Validated `rf` hyperparameters (sklearn-style names)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForestOptions {
    pub n_estimators: usize,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub max_features: Option<MaxFeatures>,
    pub bootstrap: bool,
    pub random_state: Option<u64>,
}

impl Default for ForestOptions {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
            bootstrap: true,
            random_state: None,
        }
    }
}

impl ForestOptions {
    pub const KEYS: [&'static str; 7] = [
        "n_estimators",
        "max_depth",
        "min_samples_split",
        "min_samples_leaf",
        "max_features",
        "bootstrap",
        "random_state",
    ];

    pub fn validate(&self) -> std::result::Result<(), Vec<(String, String)>> {
        let mut errors = Vec::new();
        if self.n_estimators == 0 {
            errors.push(("n_estimators".to_string(), "must be > 0".to_string()));
        }
        if self.max_depth == Some(0) {
            errors.push(("max_depth".to_string(), "must be > 0 when set".to_string()));
        }
        if self.min_samples_split < 2 {
            errors.push(("min_samples_split".to_string(), "must be >= 2".to_string()));
        }
        if self.min_samples_leaf == 0 {
            errors.push(("min_samples_leaf".to_string(), "must be >= 1".to_string()));
        }
        match self.max_features {
            Some(MaxFeatures::Count(0)) => {
                errors.push(("max_features".to_string(), "must be >= 1".to_string()));
            }
            Some(MaxFeatures::Fraction(f)) if !(f > 0.0 && f <= 1.0) => {
                errors.push(("max_features".to_string(), "fraction must be in (0, 1]".to_string()));
            }
            _ => {}
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Features considered at each split
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxFeatures {
    Count(usize),
    Fraction(f64),
    Rule(FeatureRule),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureRule {
    Sqrt,
    Log2,
}

impl MaxFeatures {
    pub fn resolve(&self, n_features: usize) -> usize {
        let n = n_features as f64;
        let k = match *self {
            MaxFeatures::Count(c) => c,
            MaxFeatures::Fraction(f) => (f * n).floor() as usize,
            MaxFeatures::Rule(FeatureRule::Sqrt) => n.sqrt().floor() as usize,
            MaxFeatures::Rule(FeatureRule::Log2) => n.log2().floor() as usize,
        };
        k.clamp(1, n_features.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Node {
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

/// One regression tree stored as a flat node arena; node 0 is the root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

struct TreeBuilder<'a> {
    x: &'a Array2<f64>,
    y: &'a Array1<f64>,
    options: &'a ForestOptions,
    n_candidates: usize,
    nodes: Vec<Node>,
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    /// Position in the sorted sample list where the right child starts
    position: usize,
    score: f64,
}

impl<'a> TreeBuilder<'a> {
    fn build(&mut self, samples: &mut [usize], depth: usize, rng: &mut StdRng) -> usize {
        let n = samples.len();
        let sum: f64 = samples.iter().map(|&i| self.y[i]).sum();
        let mean = sum / n as f64;

        let depth_reached = self.options.max_depth.is_some_and(|d| depth >= d);
        let too_small = n < self.options.min_samples_split || n < 2 * self.options.min_samples_leaf;
        let pure = samples.iter().all(|&i| (self.y[i] - mean).abs() <= f64::EPSILON * mean.abs().max(1.0));

        if depth_reached || too_small || pure {
            return self.leaf(mean);
        }

        let best = match self.best_split(samples, sum, rng) {
            Some(best) => best,
            None => return self.leaf(mean),
        };

        let feature = best.feature;
        samples.sort_by(|&a, &b| self.x[[a, feature]].total_cmp(&self.x[[b, feature]]));
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { value: mean });
        let (left_samples, right_samples) = samples.split_at_mut(best.position);
        let left = self.build(left_samples, depth + 1, rng);
        let right = self.build(right_samples, depth + 1, rng);
        self.nodes[id] = Node::Split {
            feature,
            threshold: best.threshold,
            left,
            right,
        };
        id
    }

    fn leaf(&mut self, value: f64) -> usize {
        self.nodes.push(Node::Leaf { value });
        self.nodes.len() - 1
    }

    /// Maximizes `sum_l² / n_l + sum_r² / n_r`, which minimizes the summed
    /// squared error of the two children.
    fn best_split(&self, samples: &mut [usize], total: f64, rng: &mut StdRng) -> Option<BestSplit> {
        let n = samples.len();
        let min_leaf = self.options.min_samples_leaf;
        let parent_score = total * total / n as f64;

        let mut features: Vec<usize> = (0..self.x.ncols()).collect();
        features.shuffle(rng);
        features.truncate(self.n_candidates);

        let mut best: Option<BestSplit> = None;
        for &feature in &features {
            samples.sort_by(|&a, &b| self.x[[a, feature]].total_cmp(&self.x[[b, feature]]));
            let mut left_sum = 0.0;
            for pos in 1..n {
                left_sum += self.y[samples[pos - 1]];
                if pos < min_leaf || n - pos < min_leaf {
                    continue;
                }
                let lo = self.x[[samples[pos - 1], feature]];
                let hi = self.x[[samples[pos], feature]];
                if hi <= lo {
                    continue;
                }
                let right_sum = total - left_sum;
                let score = left_sum * left_sum / pos as f64 + right_sum * right_sum / (n - pos) as f64;
                if score > parent_score + 1e-12 && best.as_ref().map_or(true, |b| score > b.score) {
                    best = Some(BestSplit {
                        feature,
                        threshold: lo + (hi - lo) / 2.0,
                        position: pos,
                        score,
                    });
                }
            }
        }
        best
    }
}

impl RegressionTree {
    fn fit(
        x: &Array2<f64>,
        y: &Array1<f64>,
        samples: &mut [usize],
        options: &ForestOptions,
        rng: &mut StdRng,
    ) -> Self {
        let n_candidates = options
            .max_features
            .map_or(x.ncols(), |m| m.resolve(x.ncols()));
        let mut builder = TreeBuilder {
            x,
            y,
            options,
            n_candidates,
            nodes: Vec::new(),
        };
        builder.build(samples, 0, rng);
        Self { nodes: builder.nodes }
    }

    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut id = 0;
        loop {
            match &self.nodes[id] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    id = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], id: usize) -> usize {
            match &nodes[id] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }
}

/// Fitted random-forest regressor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    pub n_features: usize,
    trees: Vec<RegressionTree>,
}

impl RandomForest {
    pub fn fit(options: &ForestOptions, seed: u64, x: &Array2<f64>, y: &Array1<f64>) -> Result<Self> {
        let n = x.nrows();
        if n == 0 || n != y.len() {
            return Err(PipelineError::Fit(format!(
                "random forest needs matching non-empty inputs, got {} rows and {} targets",
                n,
                y.len()
            )));
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::Fit("target contains non-finite values".to_string()));
        }

        let mut rng = StdRng::seed_from_u64(options.random_state.unwrap_or(seed));
        let mut trees = Vec::with_capacity(options.n_estimators);
        for _ in 0..options.n_estimators {
            let mut tree_rng = StdRng::seed_from_u64(rng.random::<u64>());
            let mut samples: Vec<usize> = if options.bootstrap {
                (0..n).map(|_| tree_rng.random_range(0..n)).collect()
            } else {
                (0..n).collect()
            };
            trees.push(RegressionTree::fit(x, y, &mut samples, options, &mut tree_rng));
        }

        let max_depth = trees.iter().map(RegressionTree::depth).max().unwrap_or(0);
        debug!(
            "Forest: {} trees, max depth {}, mean leaves {:.1}",
            trees.len(),
            max_depth,
            trees.iter().map(|t| t.n_leaves()).sum::<usize>() as f64 / trees.len() as f64
        );
        info!("Random forest fitted on {} samples, {} features", n, x.ncols());

        Ok(Self {
            n_features: x.ncols(),
            trees,
        })
    }

    pub fn predict(&self, x: &Array2<f64>) -> Array1<f64> {
        let n_trees = self.trees.len().max(1) as f64;
        x.outer_iter()
            .map(|row| self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>() / n_trees)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn step_data() -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((40, 2), |(i, j)| if j == 0 { i as f64 } else { (i % 7) as f64 });
        let y = Array1::from_iter((0..40).map(|i| if i < 20 { 1.0 } else { 5.0 }));
        (x, y)
    }

    #[test]
    fn test_single_tree_learns_step() {
        let (x, y) = step_data();
        let options = ForestOptions {
            n_estimators: 1,
            bootstrap: false,
            ..Default::default()
        };
        let forest = RandomForest::fit(&options, 42, &x, &y).unwrap();
        assert_eq!(forest.predict(&x), y);
        assert_eq!(forest.trees[0].depth(), 1);
    }

    #[test]
    fn test_forest_is_deterministic_per_seed() {
        let (x, y) = step_data();
        let options = ForestOptions {
            n_estimators: 10,
            max_features: Some(MaxFeatures::Rule(FeatureRule::Sqrt)),
            ..Default::default()
        };
        let a = RandomForest::fit(&options, 42, &x, &y).unwrap();
        let b = RandomForest::fit(&options, 42, &x, &y).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.predict(&x), b.predict(&x));
    }

    #[test]
    fn test_random_state_overrides_seed() {
        let (x, y) = step_data();
        let options = ForestOptions {
            n_estimators: 5,
            random_state: Some(7),
            ..Default::default()
        };
        let a = RandomForest::fit(&options, 1, &x, &y).unwrap();
        let b = RandomForest::fit(&options, 2, &x, &y).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_max_depth_and_min_leaf() {
        let x = Array2::from_shape_fn((32, 1), |(i, _)| i as f64);
        let y = x.column(0).mapv(|v| v * v);
        let options = ForestOptions {
            n_estimators: 1,
            bootstrap: false,
            max_depth: Some(2),
            ..Default::default()
        };
        let forest = RandomForest::fit(&options, 0, &x, &y).unwrap();
        assert_eq!(forest.trees[0].depth(), 2);
        assert_eq!(forest.trees[0].n_leaves(), 4);

        let options = ForestOptions {
            n_estimators: 1,
            bootstrap: false,
            min_samples_leaf: 16,
            ..Default::default()
        };
        let forest = RandomForest::fit(&options, 0, &x, &y).unwrap();
        assert_eq!(forest.trees[0].n_leaves(), 2);
    }

    #[test]
    fn test_constant_target_is_single_leaf() {
        let x = array![[1.0], [2.0], [3.0]];
        let y = array![4.0, 4.0, 4.0];
        let forest = RandomForest::fit(&ForestOptions::default(), 0, &x, &y).unwrap();
        assert!(forest.trees.iter().all(|t| t.n_leaves() == 1));
        assert_eq!(forest.predict(&array![[10.0]])[0], 4.0);
    }

    #[test]
    fn test_max_features_resolution() {
        assert_eq!(MaxFeatures::Rule(FeatureRule::Sqrt).resolve(13), 3);
        assert_eq!(MaxFeatures::Rule(FeatureRule::Log2).resolve(13), 3);
        assert_eq!(MaxFeatures::Fraction(0.5).resolve(13), 6);
        assert_eq!(MaxFeatures::Count(20).resolve(13), 13);
        assert_eq!(MaxFeatures::Fraction(0.01).resolve(13), 1);
    }

    #[test]
    fn test_max_features_from_json() {
        let opts: ForestOptions =
            serde_json::from_value(serde_json::json!({"max_features": "sqrt"})).unwrap();
        assert_eq!(opts.max_features, Some(MaxFeatures::Rule(FeatureRule::Sqrt)));
        let opts: ForestOptions = serde_json::from_value(serde_json::json!({"max_features": 4})).unwrap();
        assert_eq!(opts.max_features, Some(MaxFeatures::Count(4)));
        let opts: ForestOptions = serde_json::from_value(serde_json::json!({"max_features": 0.3})).unwrap();
        assert_eq!(opts.max_features, Some(MaxFeatures::Fraction(0.3)));
    }

    #[test]
    fn test_options_validation() {
        let bad = ForestOptions {
            n_estimators: 0,
            min_samples_split: 1,
            max_features: Some(MaxFeatures::Fraction(1.5)),
            ..Default::default()
        };
        let keys: Vec<String> = bad.validate().unwrap_err().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["n_estimators", "min_samples_split", "max_features"]);
    }
}
