//! Second-order regression trees shared by both boosting variants.

use serde::{Deserialize, Serialize};

/// Split gain and leaf weight regularization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GainParams {
    /// L2 regularization on leaf weights (lambda).
    pub reg_lambda: f64,
    /// Minimum gain for a split to be kept (gamma).
    pub min_gain: f64,
    /// Minimum rows on each side of a split.
    pub min_samples_leaf: usize,
}

impl Default for GainParams {
    fn default() -> Self {
        Self {
            reg_lambda: 1.0,
            min_gain: 0.0,
            min_samples_leaf: 2,
        }
    }
}

impl GainParams {
    /// `0.5 * [G_L²/(H_L+λ) + G_R²/(H_R+λ) - G_P²/(H_P+λ)] - γ`
    fn gain(&self, left: Sums, right: Sums) -> f64 {
        let parent = left.merge(right);
        0.5 * (left.score(self.reg_lambda) + right.score(self.reg_lambda)
            - parent.score(self.reg_lambda))
            - self.min_gain
    }

    fn leaf_weight(&self, sums: Sums) -> f64 {
        -sums.grad / (sums.hess + self.reg_lambda)
    }
}

/// Order in which leaves are expanded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GrowthStrategy {
    /// Split level by level up to `max_depth`.
    DepthWise { max_depth: usize },
    /// Always split the leaf with the largest gain, up to `max_leaves`.
    LeafWise { max_leaves: usize },
}

/// How split thresholds are enumerated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SplitFinding {
    /// Midpoints between every pair of distinct sorted values.
    Exact,
    /// Quantile bin edges, at most `max_bins` bins per feature.
    Histogram { max_bins: usize },
}

#[derive(Debug, Clone, Copy, Default)]
struct Sums {
    grad: f64,
    hess: f64,
    count: usize,
}

impl Sums {
    fn add(&mut self, grad: f64, hess: f64) {
        self.grad += grad;
        self.hess += hess;
        self.count += 1;
    }

    fn merge(self, other: Sums) -> Sums {
        Sums {
            grad: self.grad + other.grad,
            hess: self.hess + other.hess,
            count: self.count + other.count,
        }
    }

    fn minus(self, other: Sums) -> Sums {
        Sums {
            grad: self.grad - other.grad,
            hess: self.hess - other.hess,
            count: self.count - other.count,
        }
    }

    fn score(&self, lambda: f64) -> f64 {
        self.grad * self.grad / (self.hess + lambda)
    }
}

#[derive(Debug, Clone)]
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

/// Rows with `x[feature] <= threshold` go left.
#[derive(Debug, Clone)]
pub(crate) struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    pub(crate) fn predict(&self, x: &[f64]) -> f64 {
        let mut at = 0;
        loop {
            match &self.nodes[at] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    at = if x[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }

    pub(crate) fn n_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| matches!(node, Node::Leaf { .. }))
            .count()
    }
}

/// Candidate thresholds per feature, computed once per fit.
pub(crate) struct SplitCandidates {
    mode: SplitFinding,
    /// Histogram edges per feature (empty for exact search).
    edges: Vec<Vec<f64>>,
    /// Bin index per row and feature (empty for exact search).
    bins: Vec<Vec<usize>>,
}

impl SplitCandidates {
    pub(crate) fn new(x: &[Vec<f64>], mode: SplitFinding) -> Self {
        let SplitFinding::Histogram { max_bins } = mode else {
            return Self {
                mode,
                edges: Vec::new(),
                bins: Vec::new(),
            };
        };

        let n_features = x.first().map_or(0, Vec::len);
        let edges: Vec<Vec<f64>> = (0..n_features)
            .map(|f| quantile_edges(x.iter().map(|row| row[f]), max_bins.max(2)))
            .collect();
        let bins = x
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&edges)
                    .map(|(v, e)| e.partition_point(|edge| edge < v))
                    .collect()
            })
            .collect();

        Self { mode, edges, bins }
    }
}

/// Interior cut points at evenly spaced quantiles of the distinct values.
fn quantile_edges(values: impl Iterator<Item = f64>, max_bins: usize) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.collect();
    sorted.sort_by(f64::total_cmp);
    sorted.dedup();
    if sorted.len() <= 1 {
        return Vec::new();
    }
    if sorted.len() <= max_bins {
        return sorted.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect();
    }

    let mut edges: Vec<f64> = (1..max_bins)
        .map(|q| {
            let at = q * (sorted.len() - 1) / max_bins;
            (sorted[at] + sorted[at + 1]) / 2.0
        })
        .collect();
    edges.dedup();
    edges
}

#[derive(Debug, Clone, Copy)]
struct SplitInfo {
    feature: usize,
    threshold: f64,
    gain: f64,
}

struct Candidate {
    node: usize,
    depth: usize,
    rows: Vec<usize>,
    split: Option<SplitInfo>,
}

/// Grow one tree on gradients and hessians of the rows in `rows`.
///
/// Leaf values are `-G / (H + λ)` scaled by `learning_rate`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn grow_tree(
    x: &[Vec<f64>],
    grad: &[f64],
    hess: &[f64],
    rows: Vec<usize>,
    candidates: &SplitCandidates,
    gain: &GainParams,
    strategy: GrowthStrategy,
    learning_rate: f64,
) -> RegressionTree {
    let mut nodes = vec![Node::Leaf { value: 0.0 }];
    let mut pending = vec![Candidate {
        node: 0,
        depth: 0,
        split: best_split(x, grad, hess, &rows, candidates, gain),
        rows,
    }];
    let mut n_leaves = 1;

    loop {
        let pick = match strategy {
            GrowthStrategy::DepthWise { max_depth } => pending
                .iter()
                .position(|c| c.split.is_some() && c.depth < max_depth),
            GrowthStrategy::LeafWise { max_leaves } => {
                if n_leaves >= max_leaves {
                    None
                } else {
                    pending
                        .iter()
                        .enumerate()
                        .filter_map(|(i, c)| c.split.map(|s| (i, s.gain)))
                        .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
                        .map(|(i, _)| i)
                }
            }
        };
        let Some(pick) = pick else {
            break;
        };

        let parent = pending.remove(pick);
        let Some(split) = parent.split else {
            continue;
        };
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = parent
            .rows
            .into_iter()
            .partition(|&r| x[r][split.feature] <= split.threshold);

        let left = nodes.len();
        let right = left + 1;
        nodes.push(Node::Leaf { value: 0.0 });
        nodes.push(Node::Leaf { value: 0.0 });
        nodes[parent.node] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        n_leaves += 1;

        for (node, rows) in [(left, left_rows), (right, right_rows)] {
            pending.push(Candidate {
                node,
                depth: parent.depth + 1,
                split: best_split(x, grad, hess, &rows, candidates, gain),
                rows,
            });
        }
    }

    for candidate in pending {
        let sums = sum_rows(grad, hess, &candidate.rows);
        nodes[candidate.node] = Node::Leaf {
            value: gain.leaf_weight(sums) * learning_rate,
        };
    }

    RegressionTree { nodes }
}

fn sum_rows(grad: &[f64], hess: &[f64], rows: &[usize]) -> Sums {
    let mut sums = Sums::default();
    for &r in rows {
        sums.add(grad[r], hess[r]);
    }
    sums
}

fn best_split(
    x: &[Vec<f64>],
    grad: &[f64],
    hess: &[f64],
    rows: &[usize],
    candidates: &SplitCandidates,
    gain: &GainParams,
) -> Option<SplitInfo> {
    if rows.len() < 2 * gain.min_samples_leaf.max(1) {
        return None;
    }
    let total = sum_rows(grad, hess, rows);
    let n_features = x.first().map_or(0, Vec::len);
    let mut best: Option<SplitInfo> = None;

    let mut consider = |feature: usize, threshold: f64, left: Sums| {
        let right = total.minus(left);
        if left.count < gain.min_samples_leaf || right.count < gain.min_samples_leaf {
            return;
        }
        let g = gain.gain(left, right);
        if g > 0.0 && best.map_or(true, |b| g > b.gain) {
            best = Some(SplitInfo {
                feature,
                threshold,
                gain: g,
            });
        }
    };

    for feature in 0..n_features {
        match candidates.mode {
            SplitFinding::Exact => {
                let mut order = rows.to_vec();
                order.sort_by(|&a, &b| x[a][feature].total_cmp(&x[b][feature]));
                let mut left = Sums::default();
                for pair in order.windows(2) {
                    let (r, next) = (pair[0], pair[1]);
                    left.add(grad[r], hess[r]);
                    let (v, w) = (x[r][feature], x[next][feature]);
                    if v < w {
                        consider(feature, (v + w) / 2.0, left);
                    }
                }
            }
            SplitFinding::Histogram { .. } => {
                let edges = &candidates.edges[feature];
                if edges.is_empty() {
                    continue;
                }
                let mut histogram = vec![Sums::default(); edges.len() + 1];
                for &r in rows {
                    histogram[candidates.bins[r][feature]].add(grad[r], hess[r]);
                }
                let mut left = Sums::default();
                for (bin, edge) in edges.iter().enumerate() {
                    left = left.merge(histogram[bin]);
                    if left.count > 0 && left.count < total.count {
                        consider(feature, *edge, left);
                    }
                }
            }
        }
    }

    best
}
