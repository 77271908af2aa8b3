//! Weighted personalized PageRank over an undirected subgraph.

use std::collections::HashMap;

use nodegraph_core::graph::WeightedEdge;

#[derive(Debug, Clone, Copy)]
pub struct PprParams {
    /// Probability of following an edge rather than jumping back to the
    /// personalization vector.
    pub damping: f64,
    pub max_iterations: usize,
    /// Per-node L1 tolerance; iteration stops once the total change is
    /// below `tolerance * n`.
    pub tolerance: f64,
}

/// Score every node of the subgraph, best first. Ties are ordered by id.
///
/// Personalization entries for ids outside `nodes` are ignored. Returns an
/// empty ranking when no personalization mass lands in the subgraph.
pub fn personalized_pagerank(
    nodes: &[String],
    edges: &[WeightedEdge],
    personalization: &HashMap<String, f64>,
    params: PprParams,
) -> Vec<(String, f64)> {
    let mut ids: Vec<&str> = nodes.iter().map(String::as_str).collect();
    ids.sort_unstable();
    ids.dedup();
    let n = ids.len();
    if n == 0 {
        return Vec::new();
    }
    let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut jump = vec![0.0; n];
    for (id, weight) in personalization {
        if let Some(&i) = index.get(id.as_str()) {
            jump[i] += weight.max(0.0);
        }
    }
    let mass: f64 = jump.iter().sum();
    if mass <= 0.0 {
        return Vec::new();
    }
    jump.iter_mut().for_each(|p| *p /= mass);

    let mut adjacency: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
    for edge in edges {
        let (Some(&a), Some(&b)) = (index.get(edge.source.as_str()), index.get(edge.target.as_str())) else {
            continue;
        };
        let weight = edge.weight as f64;
        adjacency[a].push((b, weight));
        if a != b {
            adjacency[b].push((a, weight));
        }
    }
    for neighbors in &mut adjacency {
        neighbors.sort_by_key(|(i, _)| *i);
    }
    let out_weight: Vec<f64> = adjacency
        .iter()
        .map(|neighbors| neighbors.iter().map(|(_, w)| w).sum())
        .collect();

    let alpha = params.damping;
    let mut scores = vec![1.0 / n as f64; n];
    for iteration in 0..params.max_iterations {
        let mut next = vec![0.0; n];
        let mut dangling = 0.0;
        for (j, neighbors) in adjacency.iter().enumerate() {
            if out_weight[j] == 0.0 {
                dangling += scores[j];
                continue;
            }
            let share = alpha * scores[j] / out_weight[j];
            for &(i, w) in neighbors {
                next[i] += share * w;
            }
        }
        let restart = alpha * dangling + (1.0 - alpha);
        for (value, p) in next.iter_mut().zip(&jump) {
            *value += restart * p;
        }

        let change: f64 = next.iter().zip(&scores).map(|(a, b)| (a - b).abs()).sum();
        scores = next;
        if change < n as f64 * params.tolerance {
            tracing::debug!(iteration, "Personalized PageRank converged");
            break;
        }
    }

    let mut ranked: Vec<(String, f64)> = ids
        .into_iter()
        .zip(scores)
        .map(|(id, score)| (id.to_string(), score))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}
