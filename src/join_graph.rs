//! Join Graph Resolver
//!
//! Undirected relationship graph built from declared and inferred foreign
//! keys. Shortest paths between every pair of reachable tables are computed
//! once when the graph is built and memoized until the schema changes.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

use livesql_types::{Cardinality, JoinEdge};
use tracing::debug;

use crate::error::{LiveError, Result};

/// table -> neighbour -> weight
pub type Graph = BTreeMap<String, BTreeMap<String, u64>>;

/// Result of a shortest-path search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortestPath {
    pub path: Vec<String>,
    /// `None` when `end` is unreachable
    pub distance: Option<u64>,
}

/// Dijkstra over non-negative weights
pub fn shortest_path(graph: &Graph, start: &str, end: &str) -> ShortestPath {
    if start == end {
        return ShortestPath {
            path: vec![start.to_string()],
            distance: Some(0),
        };
    }

    let mut dist: HashMap<&str, u64> = HashMap::new();
    let mut prev: HashMap<&str, &str> = HashMap::new();
    let mut heap = BinaryHeap::new();

    dist.insert(start, 0);
    heap.push(Reverse((0u64, start)));

    while let Some(Reverse((d, node))) = heap.pop() {
        if node == end {
            break;
        }
        if dist.get(node).is_some_and(|best| d > *best) {
            continue;
        }
        let Some(neighbours) = graph.get(node) else {
            continue;
        };
        for (next, weight) in neighbours {
            let candidate = d + weight;
            let better = dist.get(next.as_str()).map_or(true, |cur| candidate < *cur);
            if better {
                dist.insert(next.as_str(), candidate);
                prev.insert(next.as_str(), node);
                heap.push(Reverse((candidate, next.as_str())));
            }
        }
    }

    let Some(distance) = dist.get(end).copied() else {
        return ShortestPath {
            path: Vec::new(),
            distance: None,
        };
    };

    let mut path = vec![end.to_string()];
    let mut cursor = end;
    while let Some(p) = prev.get(cursor) {
        path.push(p.to_string());
        cursor = *p;
    }
    path.reverse();

    ShortestPath {
        path,
        distance: Some(distance),
    }
}

/// One hop of a resolved join path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinStep {
    pub from: String,
    pub to: String,
    /// (from column, to column)
    pub on: Vec<(String, String)>,
    /// Rows of `to` per row of `from`
    pub cardinality: Cardinality,
}

/// Relationship graph with memoized shortest paths
#[derive(Debug, Clone, Default)]
pub struct JoinGraph {
    graph: Graph,
    /// Keyed by (from, to), oriented so `edge.left == from`
    edges: HashMap<(String, String), JoinEdge>,
    paths: HashMap<(String, String), Vec<String>>,
}

impl JoinGraph {
    /// Build the graph and precompute every pairwise path
    ///
    /// Self-referencing edges are dropped: self-joins are not supported.
    /// When several edges connect the same pair, the first one wins.
    pub fn build(edges: impl IntoIterator<Item = JoinEdge>) -> Self {
        let mut join_graph = JoinGraph::default();

        for edge in edges {
            if edge.left == edge.right {
                debug!(table = %edge.left, "Skipping self-referencing join edge");
                continue;
            }
            let key = (edge.left.clone(), edge.right.clone());
            if join_graph.edges.contains_key(&key) {
                continue;
            }
            join_graph
                .graph
                .entry(edge.left.clone())
                .or_default()
                .insert(edge.right.clone(), 1);
            join_graph
                .graph
                .entry(edge.right.clone())
                .or_default()
                .insert(edge.left.clone(), 1);

            let reversed = reverse_edge(&edge);
            join_graph
                .edges
                .insert((edge.right.clone(), edge.left.clone()), reversed);
            join_graph.edges.insert(key, edge);
        }

        join_graph.precompute_paths();
        join_graph
    }

    fn precompute_paths(&mut self) {
        let tables: Vec<String> = self.graph.keys().cloned().collect();
        let mut computed = 0usize;

        for (i, a) in tables.iter().enumerate() {
            for b in tables.iter().skip(i + 1) {
                if self.paths.contains_key(&(a.clone(), b.clone())) {
                    continue;
                }
                let found = shortest_path(&self.graph, a, b);
                computed += 1;
                if found.distance.is_none() {
                    continue;
                }
                // Every sub-path of a shortest path is itself shortest, so all
                // covered pairs are recorded in both directions.
                let path = found.path;
                for start in 0..path.len() {
                    for end in (start + 1)..path.len() {
                        let sub = &path[start..=end];
                        let forward = (sub[0].clone(), sub[sub.len() - 1].clone());
                        if self.paths.contains_key(&forward) {
                            continue;
                        }
                        let mut reverse: Vec<String> = sub.to_vec();
                        reverse.reverse();
                        self.paths
                            .insert((forward.1.clone(), forward.0.clone()), reverse);
                        self.paths.insert(forward, sub.to_vec());
                    }
                }
            }
        }

        debug!(
            tables = tables.len(),
            searches = computed,
            paths = self.paths.len(),
            "Join paths precomputed"
        );
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.graph.keys().map(String::as_str)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn are_adjacent(&self, a: &str, b: &str) -> bool {
        self.edges.contains_key(&(a.to_string(), b.to_string()))
    }

    /// Edge oriented from `from` to `to`
    pub fn edge(&self, from: &str, to: &str) -> Option<&JoinEdge> {
        self.edges.get(&(from.to_string(), to.to_string()))
    }

    /// Shortest path from `from` to `to`, both ends included
    pub fn path(&self, from: &str, to: &str) -> Result<&[String]> {
        if from == to {
            return Err(LiveError::join(format!(
                "self-join on table {from} is not supported"
            )));
        }
        self.paths
            .get(&(from.to_string(), to.to_string()))
            .map(Vec::as_slice)
            .ok_or_else(|| {
                LiveError::join(format!(
                    "join from {from} to {to} is disallowed or missing"
                ))
            })
    }

    /// Resolve a route: the shortest path, or an explicit chain whose hops
    /// must each be directly related
    pub fn route(&self, from: &str, to: &str, explicit: Option<&[String]>) -> Result<Vec<String>> {
        match explicit {
            None => self.path(from, to).map(<[String]>::to_vec),
            Some(chain) => {
                let mut full = vec![from.to_string()];
                full.extend(chain.iter().cloned());
                if full.last().map(String::as_str) != Some(to) {
                    return Err(LiveError::join(format!(
                        "join path must end at {to}"
                    )));
                }
                self.validate_chain(&full)?;
                Ok(full)
            }
        }
    }

    /// Every consecutive pair must be directly related and distinct
    pub fn validate_chain(&self, chain: &[String]) -> Result<()> {
        for pair in chain.windows(2) {
            if pair[0] == pair[1] {
                return Err(LiveError::join(format!(
                    "self-join on table {} is not supported",
                    pair[0]
                )));
            }
            if !self.are_adjacent(&pair[0], &pair[1]) {
                return Err(LiveError::join(format!(
                    "join from {} to {} is disallowed or missing",
                    pair[0], pair[1]
                )));
            }
        }
        Ok(())
    }

    /// Expand a table path into hops with their ON column pairs
    pub fn steps(&self, path: &[String]) -> Result<Vec<JoinStep>> {
        self.validate_chain(path)?;
        path.windows(2)
            .map(|pair| {
                let edge = self.edge(&pair[0], &pair[1]).ok_or_else(|| {
                    LiveError::join(format!(
                        "join from {} to {} is disallowed or missing",
                        pair[0], pair[1]
                    ))
                })?;
                Ok(JoinStep {
                    from: pair[0].clone(),
                    to: pair[1].clone(),
                    on: edge.on.clone(),
                    cardinality: edge.left_to_right,
                })
            })
            .collect()
    }

    /// A route yields at most one row when every hop is to-one
    pub fn is_to_one(steps: &[JoinStep]) -> bool {
        steps.iter().all(|s| s.cardinality == Cardinality::One)
    }
}

fn reverse_edge(edge: &JoinEdge) -> JoinEdge {
    JoinEdge {
        left: edge.right.clone(),
        right: edge.left.clone(),
        on: edge.on.iter().map(|(l, r)| (r.clone(), l.clone())).collect(),
        left_to_right: edge.right_to_left,
        right_to_left: edge.left_to_right,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weighted(edges: &[(&str, &str, u64)]) -> Graph {
        let mut graph = Graph::new();
        for (a, b, w) in edges {
            graph.entry(a.to_string()).or_default().insert(b.to_string(), *w);
            graph.entry(b.to_string()).or_default().insert(a.to_string(), *w);
        }
        graph
    }

    fn tables(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn fk(child: &str, col: &str, parent: &str) -> JoinEdge {
        JoinEdge {
            left: child.into(),
            right: parent.into(),
            on: vec![(col.into(), "id".into())],
            left_to_right: Cardinality::One,
            right_to_left: Cardinality::Many,
        }
    }

    #[test]
    fn weighted_shortest_path() {
        let graph = weighted(&[
            ("start", "A", 5),
            ("start", "B", 2),
            ("A", "D", 2),
            ("B", "D", 7),
            ("A", "C", 4),
            ("C", "D", 6),
            ("D", "end", 1),
        ]);
        let found = shortest_path(&graph, "start", "end");
        assert_eq!(found.distance, Some(8));
        assert_eq!(found.path, vec!["start", "A", "D", "end"]);
    }

    #[test]
    fn unreachable_is_infinite() {
        let graph = weighted(&[("a", "b", 1), ("c", "d", 1)]);
        let found = shortest_path(&graph, "a", "d");
        assert_eq!(found.distance, None);
        assert!(found.path.is_empty());
    }

    #[test]
    fn paths_are_precomputed_both_ways() {
        let g = JoinGraph::build(vec![
            fk("comments", "post_id", "posts"),
            fk("posts", "author_id", "users"),
        ]);
        assert_eq!(g.path("users", "comments").unwrap(), ["users", "posts", "comments"]);
        assert_eq!(g.path("comments", "users").unwrap(), ["comments", "posts", "users"]);
        assert_eq!(g.path("posts", "users").unwrap(), ["posts", "users"]);
    }

    #[test]
    fn missing_and_self_joins_are_rejected() {
        let g = JoinGraph::build(vec![fk("comments", "post_id", "posts"), fk("a", "b_id", "b")]);
        let err = g.path("comments", "a").unwrap_err();
        assert!(err.to_string().contains("disallowed or missing"));
        let err = g.path("posts", "posts").unwrap_err();
        assert!(err.to_string().contains("self-join"));
    }

    #[test]
    fn self_referencing_edges_are_dropped() {
        let g = JoinGraph::build(vec![fk("employees", "manager_id", "employees")]);
        assert_eq!(g.tables().count(), 0);
    }

    #[test]
    fn steps_carry_oriented_on_columns_and_cardinality() {
        let g = JoinGraph::build(vec![fk("comments", "post_id", "posts")]);
        let steps = g.steps(&tables(&["posts", "comments"])).unwrap();
        assert_eq!(steps[0].on, vec![("id".to_string(), "post_id".to_string())]);
        assert_eq!(steps[0].cardinality, Cardinality::Many);
        let back = g.steps(&tables(&["comments", "posts"])).unwrap();
        assert!(JoinGraph::is_to_one(&back));
    }

    #[test]
    fn explicit_route_must_be_adjacent() {
        let g = JoinGraph::build(vec![
            fk("comments", "post_id", "posts"),
            fk("posts", "author_id", "users"),
        ]);
        let route = g
            .route("users", "comments", Some(tables(&["posts", "comments"]).as_slice()))
            .unwrap();
        assert_eq!(route, vec!["users", "posts", "comments"]);
        assert!(g
            .route("users", "comments", Some(tables(&["comments"]).as_slice()))
            .is_err());
    }
}
