//! Module for the rooted phylogenetic tree, its likelihood passes and the
//! ancestral state selection policies. Nodes live in an arena and reference
//! each other by dense integer ids, so the tree is an arborescence by
//! construction and no reference cycles can occur.

mod from_str;
pub mod likelihood;
pub mod states;

use crate::errors::{PastmlError, Result};
use nalgebra::{DMatrix, DVector};

/// A single tree node. The likelihood buffers are allocated once (after the
/// state alphabet size is known) and overwritten in place by every pass.
pub struct Node {
    pub id: usize,
    /// Tip label from the newick file; internal nodes are written as n<id>.
    pub name: Option<String>,
    pub parent: Option<usize>,
    /// Length of the branch towards the parent; zero for the root.
    pub branch_length: f64,
    pub children: Vec<usize>,
    /// State observed at this tip, fixed by every selection policy.
    pub fixed_state: Option<usize>,
    /// P(i -> j) over the parent branch under the current parameters.
    pub pij: DMatrix<f64>,
    /// Conditional likelihood of the subtree below, possibly rescaled.
    pub bottom_up: DVector<f64>,
    /// Sum of the log-rescale factors applied to `bottom_up`.
    pub log_scaler: f64,
    /// Partial likelihood of everything outside the subtree.
    pub top_down: DVector<f64>,
    pub top_down_scaler: f64,
    /// Normalised posterior over states at this node.
    pub marginal: DVector<f64>,
    /// States chosen by the selection policy, most probable first.
    pub best_states: Vec<usize>,
}

impl Node {
    fn new(id: usize, name: Option<String>, branch_length: f64, parent: Option<usize>) -> Node {
        Node {
            id,
            name,
            parent,
            branch_length,
            children: Vec::new(),
            fixed_state: None,
            pij: DMatrix::zeros(0, 0),
            bottom_up: DVector::zeros(0),
            log_scaler: 0.0,
            top_down: DVector::zeros(0),
            top_down_scaler: 0.0,
            marginal: DVector::zeros(0),
            best_states: Vec::new(),
        }
    }

    pub fn is_tip(&self) -> bool {
        self.children.is_empty()
    }
}

/// Arena of nodes plus the cached branch-length statistics that the
/// parameter bounds are derived from.
pub struct Tree {
    pub nodes: Vec<Node>,
    pub root: usize,
    pub num_tips: usize,
    pub avg_branch_len: f64,
    /// Minimum strictly positive branch length.
    pub min_branch_len: f64,
    pub avg_tip_branch_len: f64,
}

impl Tree {
    pub fn new() -> Tree {
        Tree {
            nodes: Vec::new(),
            root: 0,
            num_tips: 0,
            avg_branch_len: 1.0,
            min_branch_len: 1.0,
            avg_tip_branch_len: 1.0,
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Creates a node and links it under `parent` (if any); returns its id.
    pub fn add_node(
        &mut self,
        name: Option<String>,
        branch_length: f64,
        parent: Option<usize>,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::new(id, name, branch_length, parent));
        if let Some(p) = parent {
            self.nodes[p].children.push(id);
        }
        id
    }

    /// Node ids in an order where every child precedes its parent.
    pub fn post_order(&self) -> Vec<usize> {
        let mut order = self.pre_order();
        order.reverse();
        order
    }

    /// Node ids in an order where every parent precedes its children.
    pub fn pre_order(&self) -> Vec<usize> {
        let mut stack = vec![self.root];
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(u) = stack.pop() {
            order.push(u);
            for &c in &self.nodes[u].children {
                stack.push(c);
            }
        }
        order
    }

    pub fn tip_ids(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&u| self.nodes[u].is_tip())
            .collect()
    }

    /// Multiplies every branch length by `factor` and raises any length
    /// below `floor` to `floor`; the root keeps its zero length. Branch
    /// collapse and output scaling are both expressed with this primitive.
    pub fn rescale_branch_lengths(&mut self, factor: f64, floor: f64) {
        let root = self.root;
        for node in self.nodes.iter_mut() {
            if node.id == root {
                continue;
            }
            node.branch_length *= factor;
            if node.branch_length < floor {
                node.branch_length = floor;
            }
        }
        self.update_aggregates();
    }

    /// Recomputes the cached branch-length statistics and the tip count.
    pub fn update_aggregates(&mut self) {
        let root = self.root;
        let mut sum = 0.0;
        let mut count = 0usize;
        let mut tip_sum = 0.0;
        let mut tip_count = 0usize;
        let mut min_positive = f64::INFINITY;
        for node in &self.nodes {
            if node.id == root {
                continue;
            }
            sum += node.branch_length;
            count += 1;
            if node.is_tip() {
                tip_sum += node.branch_length;
                tip_count += 1;
            }
            if node.branch_length > 0.0 && node.branch_length < min_positive {
                min_positive = node.branch_length;
            }
        }
        self.avg_branch_len = if count > 0 && sum > 0.0 {
            sum / count as f64
        } else {
            1.0
        };
        self.avg_tip_branch_len = if tip_count > 0 && tip_sum > 0.0 {
            tip_sum / tip_count as f64
        } else {
            self.avg_branch_len
        };
        self.min_branch_len = if min_positive.is_finite() {
            min_positive
        } else {
            self.avg_branch_len
        };
        self.num_tips = self.nodes.iter().filter(|n| n.is_tip()).count();
    }

    /// An unrooted newick tree surfaces as a root with three or more
    /// children. The first internal child is promoted to root, the old root
    /// becomes its child carrying the child's former branch length, and the
    /// promoted node gets the zero length of a root. A star of tips only is
    /// left as is, it is already a rooted tree.
    pub(crate) fn promote_root_if_unrooted(&mut self) {
        if self.nodes[self.root].children.len() <= 2 {
            return;
        }
        let old_root = self.root;
        let promoted = match self.nodes[old_root]
            .children
            .iter()
            .copied()
            .find(|&c| !self.nodes[c].is_tip())
        {
            Some(c) => c,
            None => return,
        };
        self.nodes[old_root].children.retain(|&c| c != promoted);
        let folded_length = self.nodes[promoted].branch_length;
        self.nodes[old_root].parent = Some(promoted);
        self.nodes[old_root].branch_length = folded_length;
        self.nodes[promoted].parent = None;
        self.nodes[promoted].branch_length = 0.0;
        self.nodes[promoted].children.push(old_root);
        self.root = promoted;
    }

    /// Allocates the per-node likelihood buffers for a `k`-state alphabet.
    /// This is the only place the hot buffers are created; the passes reuse
    /// them across all optimiser iterations.
    pub fn allocate_state_buffers(&mut self, k: usize) -> Result<()> {
        for node in self.nodes.iter_mut() {
            node.pij = DMatrix::from_vec(k, k, alloc_buffer(k * k, k)?);
            node.bottom_up = DVector::from_vec(alloc_buffer(k, k)?);
            node.top_down = DVector::from_vec(alloc_buffer(k, k)?);
            node.marginal = DVector::from_vec(alloc_buffer(k, k)?);
        }
        Ok(())
    }
}

fn alloc_buffer(len: usize, k: usize) -> Result<Vec<f64>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| PastmlError::OutOfMemory(k))?;
    buffer.resize(len, 0.0);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn three_tip_tree() -> Tree {
        // ((a:0.1,b:0.1):0.1,c:0.2);
        let mut tree = Tree::new();
        let root = tree.add_node(None, 0.0, None);
        let inner = tree.add_node(None, 0.1, Some(root));
        tree.add_node(Some("a".to_string()), 0.1, Some(inner));
        tree.add_node(Some("b".to_string()), 0.1, Some(inner));
        tree.add_node(Some("c".to_string()), 0.2, Some(root));
        tree.update_aggregates();
        tree
    }

    #[test]
    fn test_traversal_orders() {
        let tree = three_tip_tree();
        let post = tree.post_order();
        let pre = tree.pre_order();
        assert_eq!(post.len(), 5);
        assert_eq!(pre.len(), 5);
        assert_eq!(pre[0], tree.root);
        assert_eq!(*post.last().unwrap(), tree.root);
        // every child must come before its parent in post-order
        for (position, &u) in post.iter().enumerate() {
            if let Some(p) = tree.nodes[u].parent {
                assert!(post.iter().position(|&v| v == p).unwrap() > position);
            }
        }
    }

    #[test]
    fn test_aggregates() {
        let tree = three_tip_tree();
        assert_eq!(tree.num_tips, 3);
        assert_relative_eq!(tree.avg_branch_len, 0.5 / 4.0, epsilon = 1e-12);
        assert_relative_eq!(tree.min_branch_len, 0.1, epsilon = 1e-12);
        assert_relative_eq!(tree.avg_tip_branch_len, 0.4 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rescale_round_trip() {
        let mut tree = three_tip_tree();
        let original: Vec<f64> = tree.nodes.iter().map(|n| n.branch_length).collect();
        tree.rescale_branch_lengths(3.7, 0.0);
        tree.rescale_branch_lengths(1.0 / 3.7, 0.0);
        for (node, &before) in tree.nodes.iter().zip(&original) {
            assert_relative_eq!(node.branch_length, before, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_rescale_floor() {
        let mut tree = three_tip_tree();
        tree.nodes[4].branch_length = 1e-7;
        tree.rescale_branch_lengths(1.0, 1e-6);
        assert_relative_eq!(tree.nodes[4].branch_length, 1e-6);
        assert_relative_eq!(tree.nodes[2].branch_length, 0.1);
        // the root keeps its zero length
        assert_relative_eq!(tree.nodes[tree.root].branch_length, 0.0);
    }

    #[test]
    fn test_promote_unrooted() {
        // (a:0.1,(b:0.2,c:0.3):0.4,d:0.5); -- trifurcation at the root
        let mut tree = Tree::new();
        let root = tree.add_node(None, 0.0, None);
        tree.add_node(Some("a".to_string()), 0.1, Some(root));
        let inner = tree.add_node(None, 0.4, Some(root));
        tree.add_node(Some("b".to_string()), 0.2, Some(inner));
        tree.add_node(Some("c".to_string()), 0.3, Some(inner));
        tree.add_node(Some("d".to_string()), 0.5, Some(root));
        tree.promote_root_if_unrooted();
        tree.update_aggregates();

        assert_eq!(tree.root, inner);
        assert_eq!(tree.nodes[inner].branch_length, 0.0);
        assert!(tree.nodes[inner].parent.is_none());
        assert_eq!(tree.nodes[root].parent, Some(inner));
        assert_relative_eq!(tree.nodes[root].branch_length, 0.4);
        assert_eq!(tree.nodes[root].children, vec![1, 5]);
    }

    #[test]
    fn test_star_of_tips_stays_rooted() {
        let mut tree = Tree::new();
        let root = tree.add_node(None, 0.0, None);
        for name in &["a", "b", "c"] {
            tree.add_node(Some(name.to_string()), 1.0, Some(root));
        }
        tree.promote_root_if_unrooted();
        assert_eq!(tree.root, root);
        assert_eq!(tree.nodes[root].children.len(), 3);
    }
}
