// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::registry::CounterRegistry;

use log::trace;

use std::borrow::Cow;
use std::collections::HashMap;

/// Read-only view of a statistics tree.
///
/// Implementations must return children in the same order on every call,
/// and may only ever append children. Slot identities are derived from
/// child positions.
pub trait StatsTree {
    type Node: Copy;

    fn roots(&self) -> Vec<Self::Node>;
    fn children_of(&self, node: Self::Node) -> Vec<Self::Node>;
    fn label_of(&self, node: Self::Node) -> Cow<'_, str>;
    fn leaf_counters_of(&self, node: Self::Node) -> Vec<(Cow<'_, str>, u64)>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Assign slots and names to counters not seen before, update the others.
    Discover,
    /// Update values of known counters only.
    Refresh,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub nodes_visited: u64,
    pub new_counters: usize,
    pub updated_counters: usize,
}

#[derive(Debug)]
struct NodeRecord {
    ordinal: u64,
    slots: Vec<u32>,
}

/// Flattens a [`StatsTree`] into a [`CounterRegistry`].
///
/// Nodes are keyed by their child-index path from the roots, so a tree that
/// only grew since the last pass keeps every slot and name it already had.
#[derive(Debug, Default)]
pub struct TreeScanner {
    layout: HashMap<Vec<u32>, NodeRecord>,
    next_ordinal: u64,
    prefix: String,
    adopt_limit: usize,
    adopted: usize,
}

impl TreeScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next discovery pass map the first `n` counters, in traversal
    /// order, onto the already existing slots `0..n` instead of appending.
    ///
    /// Used when the registry was pre-filled from the name cache.
    pub fn adopt(&mut self, n: usize) {
        self.adopt_limit = n;
        self.adopted = 0;
    }

    /// Prepended to every counter name created from now on.
    pub fn set_prefix(&mut self, prefix: impl Into<String>) {
        self.prefix = prefix.into();
    }

    pub fn scan<T: StatsTree>(
        &mut self,
        tree: &T,
        registry: &mut CounterRegistry,
        mode: ScanMode,
    ) -> ScanReport {
        let mut report = ScanReport::default();
        let mut path = Vec::new();
        for (i, root) in tree.roots().into_iter().enumerate() {
            path.push(i as u32);
            self.visit(tree, root, &mut path, "", registry, mode, &mut report);
            path.pop();
        }
        trace!("{:?} pass over stats tree: {:?}", mode, report);
        report
    }

    #[allow(clippy::too_many_arguments)]
    fn visit<T: StatsTree>(
        &mut self,
        tree: &T,
        node: T::Node,
        path: &mut Vec<u32>,
        parent_chain: &str,
        registry: &mut CounterRegistry,
        mode: ScanMode,
        report: &mut ScanReport,
    ) {
        report.nodes_visited += 1;

        let chain = match mode {
            ScanMode::Discover => {
                let label = tree.label_of(node);
                if parent_chain.is_empty() {
                    label.into_owned()
                } else {
                    format!("{}-{}", parent_chain, label)
                }
            }
            ScanMode::Refresh => String::new(),
        };

        match mode {
            ScanMode::Discover => {
                let next_ordinal = &mut self.next_ordinal;
                let record = self.layout.entry(path.clone()).or_insert_with(|| {
                    let ordinal = *next_ordinal;
                    *next_ordinal += 1;
                    NodeRecord {
                        ordinal,
                        slots: Vec::new(),
                    }
                });
                for (k, (label, value)) in tree.leaf_counters_of(node).into_iter().enumerate() {
                    if let Some(slot) = record.slots.get(k) {
                        registry.set_value(*slot, value);
                        report.updated_counters += 1;
                    } else if self.adopted < self.adopt_limit {
                        let slot = self.adopted as u32;
                        self.adopted += 1;
                        registry.set_value(slot, value);
                        record.slots.push(slot);
                        report.updated_counters += 1;
                    } else {
                        let name = format!(
                            "{}cnt-object-{}-{}-{}",
                            self.prefix, record.ordinal, chain, label
                        );
                        record.slots.push(registry.push(name, value));
                        report.new_counters += 1;
                    }
                }
            }
            ScanMode::Refresh => {
                // nodes that appeared since discovery are skipped until the
                // next discovery pass
                if let Some(record) = self.layout.get(path.as_slice()) {
                    for (k, (_, value)) in tree.leaf_counters_of(node).into_iter().enumerate() {
                        let Some(slot) = record.slots.get(k) else {
                            break;
                        };
                        registry.set_value(*slot, value);
                        report.updated_counters += 1;
                    }
                }
            }
        }

        for (i, child) in tree.children_of(node).into_iter().enumerate() {
            path.push(i as u32);
            self.visit(tree, child, path, &chain, registry, mode, report);
            path.pop();
        }
    }
}

/// In-memory tree used by tests across the crate.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct MemNode {
        pub label: String,
        pub counters: Vec<(String, u64)>,
        pub children: Vec<usize>,
    }

    #[derive(Debug, Clone, Default)]
    pub struct MemoryTree {
        pub nodes: Vec<MemNode>,
        pub roots: Vec<usize>,
    }

    impl MemoryTree {
        pub fn add(&mut self, parent: Option<usize>, label: &str, counters: &[(&str, u64)]) -> usize {
            let id = self.nodes.len();
            self.nodes.push(MemNode {
                label: label.to_owned(),
                counters: counters
                    .iter()
                    .map(|(n, v)| (n.to_string(), *v))
                    .collect(),
                children: Vec::new(),
            });
            match parent {
                Some(p) => self.nodes[p].children.push(id),
                None => self.roots.push(id),
            }
            id
        }

        pub fn set(&mut self, node: usize, counter: usize, value: u64) {
            self.nodes[node].counters[counter].1 = value;
        }
    }

    impl StatsTree for MemoryTree {
        type Node = usize;

        fn roots(&self) -> Vec<usize> {
            self.roots.clone()
        }

        fn children_of(&self, node: usize) -> Vec<usize> {
            self.nodes[node].children.clone()
        }

        fn label_of(&self, node: usize) -> Cow<'_, str> {
            Cow::Borrowed(&self.nodes[node].label)
        }

        fn leaf_counters_of(&self, node: usize) -> Vec<(Cow<'_, str>, u64)> {
            self.nodes[node]
                .counters
                .iter()
                .map(|(n, v)| (Cow::Borrowed(n.as_str()), *v))
                .collect()
        }
    }
}
