//! Layered auto-layout for editor graphs.
//!
//! Rank is the longest path from a head; nodes within a rank are ordered by
//! the barycenter of their predecessors, ties by definition order. The
//! output only depends on the input, never on hash iteration order.

use std::collections::HashMap;

use prizm_types::flow::Position;

/// Horizontal gap between nodes in the same rank.
pub const NODE_SPACING_X: f64 = 260.0;

/// Vertical gap between ranks.
pub const RANK_SPACING_Y: f64 = 140.0;

/// Compute positions for `ids` (in definition order) given directed
/// `edges`, which must only point forward in that order.
pub fn layered_layout(ids: &[&str], edges: &[(&str, &str)]) -> HashMap<String, Position> {
    let order_of: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let mut preds: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    for (source, target) in edges {
        if let (Some(&s), Some(&t)) = (order_of.get(source), order_of.get(target)) {
            if s < t {
                preds[t].push(s);
            }
        }
    }

    // Edges point forward, so one pass in definition order settles ranks.
    let mut rank = vec![0usize; ids.len()];
    for node in 0..ids.len() {
        let longest = preds[node].iter().map(|p| rank[*p] + 1).max().unwrap_or(0);
        rank[node] = longest;
    }

    let rank_count = rank.iter().copied().max().map_or(0, |r| r + 1);
    let mut layers: Vec<Vec<usize>> = vec![Vec::new(); rank_count];
    for (node, r) in rank.iter().enumerate() {
        layers[*r].push(node);
    }

    let mut slot = vec![0.0f64; ids.len()];
    for layer in &mut layers {
        let mut keyed: Vec<(f64, usize)> = layer
            .iter()
            .map(|&node| {
                let placed = &preds[node];
                let center = if placed.is_empty() {
                    node as f64
                } else {
                    placed.iter().map(|p| slot[*p]).sum::<f64>() / placed.len() as f64
                };
                (center, node)
            })
            .collect();
        keyed.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        *layer = keyed.into_iter().map(|(_, node)| node).collect();
        for (position, node) in layer.iter().enumerate() {
            slot[*node] = position as f64;
        }
    }

    let mut positions = HashMap::with_capacity(ids.len());
    for (r, layer) in layers.iter().enumerate() {
        let offset = (layer.len().saturating_sub(1)) as f64 / 2.0;
        for (position, node) in layer.iter().enumerate() {
            positions.insert(
                ids[*node].to_string(),
                Position {
                    x: (position as f64 - offset) * NODE_SPACING_X,
                    y: r as f64 * RANK_SPACING_Y,
                },
            );
        }
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_is_vertical() {
        let positions = layered_layout(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        assert_eq!(positions["a"], Position { x: 0.0, y: 0.0 });
        assert_eq!(positions["b"], Position { x: 0.0, y: RANK_SPACING_Y });
        assert_eq!(positions["c"], Position { x: 0.0, y: 2.0 * RANK_SPACING_Y });
    }

    #[test]
    fn test_rank_is_longest_path() {
        // a -> b -> c and a -> c: c sits below b, not beside it.
        let positions = layered_layout(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("a", "c")]);
        assert_eq!(positions["c"].y, 2.0 * RANK_SPACING_Y);
    }

    #[test]
    fn test_siblings_centered_and_deterministic() {
        let ids = ["root", "left", "right"];
        let edges = [("root", "left"), ("root", "right")];
        let first = layered_layout(&ids, &edges);
        assert_eq!(first["left"].x, -NODE_SPACING_X / 2.0);
        assert_eq!(first["right"].x, NODE_SPACING_X / 2.0);
        assert_eq!(first, layered_layout(&ids, &edges));
    }
}
