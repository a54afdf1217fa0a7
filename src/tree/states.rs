//! Selection policies that turn per-node posteriors into a short list of
//! predicted states. Tips with an observed state are pinned to it by every
//! policy; ties are always broken towards the lowest state index.

use crate::tree::likelihood::Parameters;
use crate::tree::Tree;
use log_domain::LogDomain;
use num_traits::Zero;
use std::cmp::Ordering;

impl Tree {
    /// Marginal-approximation policy: for every node, sort the posteriors
    /// descending and keep the prefix whose Brier score (1 − 2·sₖ)/k is
    /// minimal. At a [0.5, 0.5] posterior this keeps both states, at
    /// [0.9, 0.1] the argmax alone, and it degrades to a singleton as the
    /// posterior sharpens.
    pub fn choose_likely_states(&mut self) {
        for u in 0..self.num_nodes() {
            if let Some(a) = self.nodes[u].fixed_state {
                self.nodes[u].best_states = vec![a];
                continue;
            }
            let marginal = &self.nodes[u].marginal;
            let k = marginal.len();
            let mut order: Vec<usize> = (0..k).collect();
            order.sort_by(|&a, &b| {
                marginal[b]
                    .partial_cmp(&marginal[a])
                    .unwrap_or(Ordering::Equal)
                    .then(a.cmp(&b))
            });
            let mut chosen = 1;
            let mut best_score = f64::INFINITY;
            let mut cumulative = 0.0;
            for (position, &a) in order.iter().enumerate() {
                cumulative += marginal[a];
                let score = (1.0 - 2.0 * cumulative) / (position + 1) as f64;
                if score < best_score {
                    best_score = score;
                    chosen = position + 1;
                }
            }
            order.truncate(chosen);
            self.nodes[u].best_states = order;
        }
    }

    /// Maximum-a-posteriori policy: the single most probable state.
    pub fn choose_best_marginal_states(&mut self) {
        for u in 0..self.num_nodes() {
            if let Some(a) = self.nodes[u].fixed_state {
                self.nodes[u].best_states = vec![a];
                continue;
            }
            let marginal = &self.nodes[u].marginal;
            let mut best = 0;
            for a in 1..marginal.len() {
                if marginal[a] > marginal[best] {
                    best = a;
                }
            }
            self.nodes[u].best_states = vec![best];
        }
    }

    /// Joint policy: Pupko's dynamic program selects the single most
    /// probable assignment over all nodes at once. `best[u][j]` is the best
    /// achievable probability of u's subtree given parent state j, built in
    /// post-order from the transition matrices; the assignment is then read
    /// off in pre-order from the recorded argmaxes. The long products are
    /// taken in log space. Marginals are overwritten with the one-hot of
    /// the chosen state so the output table stays well formed.
    pub fn choose_joint_states(&mut self, params: &Parameters) {
        let k = params.frequencies.len();
        let n = self.num_nodes();
        let zero = LogDomain::zero();
        let mut best: Vec<Vec<LogDomain<f64>>> = vec![vec![zero; k]; n];
        let mut choice: Vec<Vec<usize>> = vec![vec![0; k]; n];

        for &u in &self.post_order() {
            if u == self.root {
                continue;
            }
            let node = &self.nodes[u];
            for j in 0..k {
                let mut argmax = 0;
                let mut max = zero;
                match node.fixed_state {
                    Some(a) => {
                        argmax = a;
                        max = LogDomain::new(node.pij[(j, a)]).unwrap_or(zero);
                    }
                    None => {
                        for i in 0..k {
                            let mut p =
                                LogDomain::new(node.pij[(j, i)]).unwrap_or(zero);
                            for &c in &node.children {
                                p *= best[c][i];
                            }
                            if p > max {
                                max = p;
                                argmax = i;
                            }
                        }
                    }
                }
                best[u][j] = max;
                choice[u][j] = argmax;
            }
        }

        let root = self.root;
        let mut root_state = 0;
        let mut root_max = zero;
        for i in 0..k {
            let mut p = LogDomain::new(params.frequencies[i]).unwrap_or(zero);
            for &c in &self.nodes[root].children {
                p *= best[c][i];
            }
            if p > root_max {
                root_max = p;
                root_state = i;
            }
        }

        let mut assigned = vec![0usize; n];
        for &u in &self.pre_order() {
            assigned[u] = if u == root {
                self.nodes[root].fixed_state.unwrap_or(root_state)
            } else {
                let parent_state = assigned[self.nodes[u].parent.unwrap()];
                choice[u][parent_state]
            };
        }
        for u in 0..n {
            let a = assigned[u];
            self.nodes[u].best_states = vec![a];
            self.nodes[u].marginal.fill(0.0);
            self.nodes[u].marginal[a] = 1.0;
        }
    }
}
