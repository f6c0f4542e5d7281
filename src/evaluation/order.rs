//! Ordering helpers over the input edges of a graph.
//!
//! `inputs(k)` yields the producers feeding `k`. Results are deterministic:
//! ties are broken by the position of the node in `nodes`.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
};

use anyhow::{Result, bail};

/// Kahn's algorithm. Fails if the edges contain a cycle.
pub fn topo_sort<K, I>(nodes: &[K], inputs: impl Fn(K) -> I) -> Result<Vec<K>>
where
    K: Copy + Eq + Hash,
    I: IntoIterator<Item = K>,
{
    let mut indeg: HashMap<K, usize> = nodes.iter().map(|n| (*n, 0usize)).collect();
    let mut outgoing: HashMap<K, Vec<K>> = HashMap::new();
    for &node in nodes {
        for producer in inputs(node) {
            if !indeg.contains_key(&producer) {
                continue;
            }
            if let Some(d) = indeg.get_mut(&node) {
                *d += 1;
            }
            outgoing.entry(producer).or_default().push(node);
        }
    }

    let mut queue: VecDeque<K> = nodes
        .iter()
        .copied()
        .filter(|n| indeg.get(n) == Some(&0))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(node) = queue.pop_front() {
        order.push(node);
        if let Some(nexts) = outgoing.get(&node) {
            for next in nexts {
                if let Some(d) = indeg.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(*next);
                    }
                }
            }
        }
    }

    if order.len() != nodes.len() {
        bail!("cycle detected in evaluation graph");
    }
    Ok(order)
}

/// `start` and everything it transitively reads from.
pub fn upstream_reachable<K, I>(start: K, inputs: impl Fn(K) -> I) -> HashSet<K>
where
    K: Copy + Eq + Hash,
    I: IntoIterator<Item = K>,
{
    let mut visited = HashSet::new();
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        if !visited.insert(node) {
            continue;
        }
        stack.extend(inputs(node));
    }
    visited
}

/// Whether wiring `source` into `consumer` would close a loop.
pub fn would_create_cycle<K, I>(consumer: K, source: K, inputs: impl Fn(K) -> I) -> bool
where
    K: Copy + Eq + Hash,
    I: IntoIterator<Item = K>,
{
    consumer == source || upstream_reachable(source, inputs).contains(&consumer)
}

/// Every producer listed in `order` comes before its consumers.
pub fn is_topological<K, I>(order: &[K], inputs: impl Fn(K) -> I) -> bool
where
    K: Copy + Eq + Hash,
    I: IntoIterator<Item = K>,
{
    let position: HashMap<K, usize> = order.iter().enumerate().map(|(i, k)| (*k, i)).collect();
    order.iter().enumerate().all(|(i, node)| {
        inputs(*node)
            .into_iter()
            .all(|producer| position.get(&producer).is_none_or(|p| *p < i))
    })
}
