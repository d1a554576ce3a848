//! Rooted binary tree and its pruning schedule.
//!
//! Nodes are indexed 0..n_nodes, with tips first, then internal nodes, the
//! same numbering the engine uses for buffers. Every node's parent edge
//! uses the transition matrix with the node's own index.

use crate::config::{EnginePolicy, InstanceConfig};
use crate::device::{DevicePool, Platform};
use crate::error::{Error, Result};
use crate::pruning::Operation;
use crate::staging::EigenSystem;

#[derive(Debug, Clone)]
pub struct Tree {
    pub n_nodes: usize,
    pub n_tips: usize,
    pub parent_indices: Vec<i32>,
    pub branch_lengths: Vec<f64>,
    pub children: Vec<Vec<usize>>,
    pub root_index: usize,
}

impl Tree {
    /// Build tree from structure arrays.
    ///
    /// # Arguments
    /// * `parent_indices` - Parent index for each node (-1 for root)
    /// * `branch_lengths` - Length of the edge above each node (root's is ignored)
    /// * `n_tips` - Number of tip nodes
    pub fn from_structure(
        parent_indices: Vec<i32>,
        branch_lengths: Vec<f64>,
        n_tips: usize,
    ) -> Result<Self> {
        let n_nodes = parent_indices.len();
        Error::check_len("branch_lengths", n_nodes, branch_lengths.len())?;
        if n_tips < 2 || n_nodes != 2 * n_tips - 1 {
            return Err(Error::InvalidArgument(format!(
                "a rooted binary tree with {n_tips} tips has {} nodes, got {n_nodes}",
                (2 * n_tips).saturating_sub(1)
            )));
        }

        let mut children = vec![Vec::new(); n_nodes];
        let mut roots = Vec::new();
        for (child, &parent) in parent_indices.iter().enumerate() {
            match usize::try_from(parent) {
                Ok(p) if p < n_nodes && p != child => children[p].push(child),
                Ok(p) => {
                    return Err(Error::InvalidArgument(format!(
                        "node {child} has invalid parent {p}"
                    )))
                }
                Err(_) if parent == -1 => roots.push(child),
                Err(_) => {
                    return Err(Error::InvalidArgument(format!(
                        "node {child} has invalid parent {parent}"
                    )))
                }
            }
        }

        // Exactly one node without a parent
        let root_index = match roots[..] {
            [root] => root,
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "expected one root (parent -1), found {}",
                    roots.len()
                )))
            }
        };

        for (node, kids) in children.iter().enumerate() {
            let expected = if node < n_tips { 0 } else { 2 };
            if kids.len() != expected {
                return Err(Error::InvalidArgument(format!(
                    "node {node} has {} children, expected {expected}",
                    kids.len()
                )));
            }
        }
        for (node, &t) in branch_lengths.iter().enumerate() {
            if node != root_index && (!t.is_finite() || t < 0.0) {
                return Err(Error::InvalidArgument(format!(
                    "branch length of node {node} must be finite and non-negative, got {t}"
                )));
            }
        }

        let tree = Tree { n_nodes, n_tips, parent_indices, branch_lengths, children, root_index };
        // A cycle leaves some nodes unreachable from the root.
        if tree.post_order().len() != n_nodes {
            return Err(Error::InvalidArgument("parent indices contain a cycle".into()));
        }
        Ok(tree)
    }

    /// Get post-order traversal of nodes (tips to root).
    pub fn post_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.n_nodes);
        let mut stack = vec![(self.root_index, false)];
        let mut visited = vec![false; self.n_nodes];

        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            if std::mem::replace(&mut visited[node], true) {
                continue;
            }
            stack.push((node, true));
            // Reversed so the first child is finished first
            for &child in self.children[node].iter().rev() {
                stack.push((child, false));
            }
        }
        order
    }

    /// One operation per internal node, children before parents.
    pub fn operations(&self) -> Vec<Operation> {
        self.post_order()
            .into_iter()
            .filter(|&node| node >= self.n_tips)
            .map(|node| {
                let (c1, c2) = (self.children[node][0], self.children[node][1]);
                Operation { destination: node, child1: c1, child1_matrix: c1, child2: c2, child2_matrix: c2 }
            })
            .collect()
    }

    /// Matrix indices and edge lengths of every non-root node.
    pub fn edges(&self) -> (Vec<usize>, Vec<f64>) {
        (0..self.n_nodes)
            .filter(|&node| node != self.root_index)
            .map(|node| (node, self.branch_lengths[node]))
            .unzip()
    }

    /// Instance shape for this tree with every tip held as compact states.
    pub fn instance_config(&self, state_count: usize, pattern_count: usize) -> InstanceConfig {
        InstanceConfig {
            tip_count: self.n_tips,
            partials_buffer_count: self.n_nodes - self.n_tips,
            compact_buffer_count: self.n_tips,
            state_count,
            pattern_count,
            eigen_count: 1,
            matrix_count: self.n_nodes,
        }
    }

    /// Per-pattern log-likelihoods of `tip_states` (one row per tip) on a
    /// fresh instance from `pool`.
    pub fn site_log_likelihoods<P: Platform>(
        &self,
        pool: &DevicePool<P>,
        policy: EnginePolicy,
        model: &EigenSystem,
        frequencies: &[f64],
        tip_states: &[Vec<i32>],
    ) -> Result<Vec<f64>> {
        Error::check_len("tip state rows", self.n_tips, tip_states.len())?;
        let pattern_count = tip_states.first().map_or(0, Vec::len);
        let config = self.instance_config(model.state_count, pattern_count);
        let mut instance = pool.create_instance(&config, policy)?;

        instance.set_eigen_decomposition(
            0,
            &model.eigenvectors,
            &model.inverse_eigenvectors,
            &model.eigenvalues,
        )?;
        for (tip, states) in tip_states.iter().enumerate() {
            instance.set_tip_states(tip, states)?;
        }
        let (matrices, lengths) = self.edges();
        instance.update_transition_matrices(0, &matrices, &lengths)?;
        instance.update_partials(&self.operations(), true)?;
        instance.calculate_root_log_likelihoods(&[self.root_index], &[1.0], frequencies)
    }
}
