// graph.rs
//
// Weighted graph metrics over connectivity matrices. Nodes are regions, edge
// weights the connectivity values; zero means "no edge".

use crate::error::{MacchiatoError, Result};
use crate::matrix_ops::{round_decimals, select_square, symmetrize};
use crate::network::ConnectivityMatrix;
use log::debug;
use ndarray::{Array1, Array2};
use ndarray_linalg::{Eigh, UPLO};
use std::fmt;
use std::str::FromStr;

pub const SANITIZE_DECIMALS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphMetric {
    ClusteringCoefficient,
    LocalEfficiency,
    Strength,
    NodeBetweennessCentrality,
    EdgeBetweennessCentrality,
    EigenvectorCentrality,
}

impl GraphMetric {
    pub const ALL: [GraphMetric; 6] = [
        GraphMetric::ClusteringCoefficient,
        GraphMetric::LocalEfficiency,
        GraphMetric::Strength,
        GraphMetric::NodeBetweennessCentrality,
        GraphMetric::EdgeBetweennessCentrality,
        GraphMetric::EigenvectorCentrality,
    ];

    pub fn name(self) -> &'static str {
        match self {
            GraphMetric::ClusteringCoefficient => "clustering_coefficient",
            GraphMetric::LocalEfficiency => "local_efficiency",
            GraphMetric::Strength => "strength",
            GraphMetric::NodeBetweennessCentrality => "node_betweenness_centrality",
            GraphMetric::EdgeBetweennessCentrality => "edge_betweenness_centrality",
            GraphMetric::EigenvectorCentrality => "eigenvector_centrality",
        }
    }

    pub fn shape(self) -> ResultShape {
        match self {
            GraphMetric::EdgeBetweennessCentrality => ResultShape::PerEdgeMatrix,
            _ => ResultShape::PerNodeVector,
        }
    }

    /// `All` expands to every metric; `NONE` entries select nothing.
    pub fn parse_selection<S: AsRef<str>>(selectors: &[S]) -> Result<Vec<GraphMetric>> {
        if selectors.iter().any(|s| s.as_ref().trim().eq_ignore_ascii_case("all")) {
            return Ok(Self::ALL.to_vec());
        }
        let mut metrics = Vec::new();
        for selector in selectors {
            if selector.as_ref().trim().eq_ignore_ascii_case("none") {
                continue;
            }
            let metric: GraphMetric = selector.as_ref().parse()?;
            if !metrics.contains(&metric) {
                metrics.push(metric);
            }
        }
        Ok(metrics)
    }
}

impl FromStr for GraphMetric {
    type Err = MacchiatoError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.name() == normalized)
            .ok_or_else(|| MacchiatoError::UnsupportedMetric(s.to_string()))
    }
}

impl fmt::Display for GraphMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    PerNodeVector,
    PerEdgeMatrix,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricValues {
    NodeVector(Array1<f64>),
    EdgeMatrix(Array2<f64>),
}

impl MetricValues {
    pub fn shape(&self) -> ResultShape {
        match self {
            MetricValues::NodeVector(_) => ResultShape::PerNodeVector,
            MetricValues::EdgeMatrix(_) => ResultShape::PerEdgeMatrix,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphMetricResult {
    pub metric: GraphMetric,
    pub values: MetricValues,
}

impl GraphMetricResult {
    pub fn shape(&self) -> ResultShape {
        self.values.shape()
    }
}

#[derive(Debug, Clone)]
pub struct GraphMetricEngine {
    decimals: i32,
}

impl Default for GraphMetricEngine {
    fn default() -> Self {
        Self {
            decimals: SANITIZE_DECIMALS,
        }
    }
}

impl GraphMetricEngine {
    /// Working copy with infinities and NaNs zeroed and every entry rounded.
    pub fn sanitize(&self, matrix: &Array2<f64>) -> Array2<f64> {
        matrix.mapv(|v| {
            if v.is_finite() {
                round_decimals(v, self.decimals)
            } else {
                0.0
            }
        })
    }

    pub fn compute(&self, matrix: &ConnectivityMatrix, metric: GraphMetric) -> Result<GraphMetricResult> {
        let n = matrix.region_count();
        if n == 0 {
            return Err(MacchiatoError::EmptyGraph);
        }
        debug!("Computing {} on a {}x{} {} matrix", metric, n, n, matrix.method);
        let weights = self.sanitize(&matrix.matrix);

        let values = match metric {
            GraphMetric::NodeBetweennessCentrality => {
                MetricValues::NodeVector(weighted_betweenness(&weights_to_lengths(&weights)).0)
            }
            GraphMetric::EdgeBetweennessCentrality => {
                MetricValues::EdgeMatrix(weighted_betweenness(&weights_to_lengths(&weights)).1)
            }
            GraphMetric::EigenvectorCentrality => MetricValues::NodeVector(eigenvector_centrality(&weights)?),
            GraphMetric::LocalEfficiency => MetricValues::NodeVector(local_efficiency(&weights)),
            GraphMetric::Strength => MetricValues::NodeVector(strength(&weights)),
            GraphMetric::ClusteringCoefficient => MetricValues::NodeVector(clustering_coefficient(&weights)),
        };
        Ok(GraphMetricResult { metric, values })
    }
}

/// Connection lengths: `1/w` for every nonzero weight, zeros stay absent.
fn weights_to_lengths(weights: &Array2<f64>) -> Array2<f64> {
    weights.mapv(|w| if w != 0.0 { 1.0 / w } else { 0.0 })
}

/// Node and edge betweenness on a length matrix (Brandes accumulation over
/// Dijkstra shortest paths). Both are unnormalized path counts.
fn weighted_betweenness(lengths: &Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let n = lengths.nrows();
    let mut node = Array1::zeros(n);
    let mut edge = Array2::zeros((n, n));

    for source in 0..n {
        let mut dist = vec![f64::INFINITY; n];
        let mut paths = vec![0.0f64; n];
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut settled = vec![false; n];
        let mut order = Vec::with_capacity(n);
        dist[source] = 0.0;
        paths[source] = 1.0;

        let mut frontier = vec![source];
        loop {
            for &v in &frontier {
                settled[v] = true;
            }
            for &v in &frontier {
                order.push(v);
                for w in 0..n {
                    let len = lengths[[v, w]];
                    if settled[w] || len == 0.0 {
                        continue;
                    }
                    let candidate = dist[v] + len;
                    if candidate < dist[w] {
                        dist[w] = candidate;
                        paths[w] = paths[v];
                        preds[w].clear();
                        preds[w].push(v);
                    } else if candidate == dist[w] {
                        paths[w] += paths[v];
                        preds[w].push(v);
                    }
                }
            }
            let next = (0..n)
                .filter(|&w| !settled[w])
                .map(|w| dist[w])
                .fold(f64::INFINITY, f64::min);
            if !next.is_finite() {
                break;
            }
            frontier = (0..n).filter(|&w| !settled[w] && dist[w] == next).collect();
        }

        let mut dependency = vec![0.0f64; n];
        for &w in order.iter().skip(1).rev() {
            node[w] += dependency[w];
            let share = (1.0 + dependency[w]) / paths[w];
            for &v in &preds[w] {
                let contribution = paths[v] * share;
                dependency[v] += contribution;
                edge[[v, w]] += contribution;
            }
        }
    }
    (node, edge)
}

/// Shortest path lengths from `source`, settling nodes in distance order.
fn shortest_lengths_from(lengths: &Array2<f64>, source: usize) -> Vec<f64> {
    let n = lengths.nrows();
    let mut dist = vec![f64::INFINITY; n];
    let mut settled = vec![false; n];
    dist[source] = 0.0;

    let mut frontier = vec![source];
    loop {
        for &v in &frontier {
            settled[v] = true;
        }
        for &v in &frontier {
            for w in 0..n {
                let len = lengths[[v, w]];
                if !settled[w] && len != 0.0 {
                    dist[w] = dist[w].min(dist[v] + len);
                }
            }
        }
        let next = (0..n)
            .filter(|&w| !settled[w])
            .map(|w| dist[w])
            .fold(f64::INFINITY, f64::min);
        if !next.is_finite() {
            break;
        }
        frontier = (0..n).filter(|&w| !settled[w] && dist[w] == next).collect();
    }
    dist
}

/// Inverse shortest path lengths, zero on the diagonal and between disconnected nodes.
fn inverse_distances(lengths: &Array2<f64>) -> Array2<f64> {
    let n = lengths.nrows();
    let mut inverse = Array2::zeros((n, n));
    for source in 0..n {
        for (target, d) in shortest_lengths_from(lengths, source).into_iter().enumerate() {
            if target != source {
                inverse[[source, target]] = 1.0 / d;
            }
        }
    }
    inverse
}

/// Local efficiency with cube-root weighting of both the node's edges and the
/// neighbourhood's inverse path lengths.
fn local_efficiency(weights: &Array2<f64>) -> Array1<f64> {
    let n = weights.nrows();
    let lengths = weights_to_lengths(weights);
    let present = |w: f64| if w != 0.0 { 1.0 } else { 0.0 };

    Array1::from_shape_fn(n, |u| {
        let neighbours: Vec<usize> = (0..n)
            .filter(|&v| weights[[u, v]] != 0.0 || weights[[v, u]] != 0.0)
            .collect();
        if neighbours.is_empty() {
            return 0.0;
        }
        let edge_strength: Vec<f64> = neighbours
            .iter()
            .map(|&v| weights[[u, v]].cbrt() + weights[[v, u]].cbrt())
            .collect();
        let inverse = inverse_distances(&select_square(&lengths, &neighbours));

        let mut numerator = 0.0;
        for a in 0..neighbours.len() {
            for b in 0..neighbours.len() {
                let path = inverse[[a, b]].cbrt() + inverse[[b, a]].cbrt();
                numerator += edge_strength[a] * edge_strength[b] * path;
            }
        }
        numerator /= 2.0;
        if numerator == 0.0 {
            return 0.0;
        }

        let adjacency: Vec<f64> = neighbours
            .iter()
            .map(|&v| present(weights[[u, v]]) + present(weights[[v, u]]))
            .collect();
        let total: f64 = adjacency.iter().sum();
        let denominator = total * total - adjacency.iter().map(|a| a * a).sum::<f64>();
        if denominator == 0.0 {
            0.0
        } else {
            numerator / denominator
        }
    })
}

fn strength(weights: &Array2<f64>) -> Array1<f64> {
    weights.sum_axis(ndarray::Axis(0))
}

/// Weighted clustering: geometric mean of triangle weights over k(k-1).
fn clustering_coefficient(weights: &Array2<f64>) -> Array1<f64> {
    let n = weights.nrows();
    let roots = weights.mapv(f64::cbrt);
    let paths = roots.dot(&roots);
    Array1::from_shape_fn(n, |i| {
        let cycles = paths.row(i).dot(&roots.column(i));
        let degree = weights.row(i).iter().filter(|&&w| w != 0.0).count() as f64;
        let denominator = degree * (degree - 1.0);
        if cycles == 0.0 || denominator == 0.0 {
            0.0
        } else {
            cycles / denominator
        }
    })
}

/// Absolute leading eigenvector of the symmetrized matrix.
fn eigenvector_centrality(weights: &Array2<f64>) -> Result<Array1<f64>> {
    let (eigenvalues, eigenvectors) = symmetrize(weights).eigh(UPLO::Lower)?;
    let leading = eigenvalues
        .iter()
        .enumerate()
        .fold(0, |best, (i, &l)| if l > eigenvalues[best] { i } else { best });
    Ok(eigenvectors.column(leading).mapv(f64::abs))
}
