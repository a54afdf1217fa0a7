//! Two-pass belief propagation over the tree: bottom-up conditional
//! likelihoods with underflow rescaling, top-down partial likelihoods, and
//! the marginal combine. All passes work in linear space on the per-node
//! buffers and overwrite them in place.

use crate::errors::{PastmlError, Result};
use crate::tree::Tree;
use nalgebra::DVector;

/// Rescaling threshold 2⁻⁵⁰⁰: a conditional likelihood vector whose maximum
/// falls below it is divided by that maximum and the log factor recorded.
pub const LIM_P: f64 = 3.054936363499605e-151;

/// The model parameter vector θ: K equilibrium frequencies (fixed to 1/K
/// under JC), the overall branch-length scaling s, and the ε floor added to
/// every transition probability.
#[derive(Debug, Clone)]
pub struct Parameters {
    pub frequencies: Vec<f64>,
    pub scale: f64,
    pub epsilon: f64,
}

/// Rate normalisation μ = 1 / (1 − Σ πₐ²), so that one unit of branch
/// length equals one expected substitution at stationarity.
pub fn substitution_rate(frequencies: &[f64]) -> f64 {
    let squares: f64 = frequencies.iter().map(|p| p * p).sum();
    let denominator = 1.0 - squares;
    if denominator > 0.0 {
        1.0 / denominator
    } else {
        f64::INFINITY
    }
}

impl Tree {
    /// Recomputes every node's transition matrix over its parent branch:
    /// Pᵢⱼ(t) = e^(−μt)·𝟙[i=j] + (1 − e^(−μt))·πⱼ with t = s·ℓ, then the ε
    /// floor and a row renormalisation. A zero-length branch yields the
    /// identity before the floor (this also covers K = 1, where μ diverges).
    pub fn update_transition_probabilities(&mut self, params: &Parameters) {
        let k = params.frequencies.len();
        let mu = substitution_rate(&params.frequencies);
        let row_sum = 1.0 + k as f64 * params.epsilon;
        let root = self.root;
        for node in self.nodes.iter_mut() {
            if node.id == root {
                continue;
            }
            let t = params.scale * node.branch_length;
            let decay = if t == 0.0 { 1.0 } else { (-mu * t).exp() };
            for i in 0..k {
                for j in 0..k {
                    let mut p = (1.0 - decay) * params.frequencies[j];
                    if i == j {
                        p += decay;
                    }
                    node.pij[(i, j)] = (p + params.epsilon) / row_sum;
                }
            }
        }
    }

    /// Post-order pass. Every internal node's conditional likelihood is the
    /// product over children c of Pij⁽ᶜ⁾ · bottom_up_c, rescaled whenever
    /// the maximum component drops below `LIM_P`. Returns the tree
    /// log-likelihood log(Σᵢ πᵢ · bottom_up_root[i]) + log_scaler_root, or
    /// −∞ if a vector collapses to zero (the optimiser treats such a point
    /// as invalid).
    pub fn calculate_bottom_up_likelihood(&mut self, params: &Parameters) -> f64 {
        self.update_transition_probabilities(params);
        let k = params.frequencies.len();
        for &u in &self.post_order() {
            if self.nodes[u].is_tip() {
                self.nodes[u].log_scaler = 0.0;
                continue;
            }
            let mut conditional = DVector::from_element(k, 1.0);
            let mut scaler = 0.0;
            for ci in 0..self.nodes[u].children.len() {
                let child = &self.nodes[self.nodes[u].children[ci]];
                conditional.component_mul_assign(&(&child.pij * &child.bottom_up));
                scaler += child.log_scaler;
            }
            let max = conditional.iter().cloned().fold(0.0f64, f64::max);
            if !max.is_finite() || max <= 0.0 {
                return f64::NEG_INFINITY;
            }
            if max < LIM_P {
                conditional /= max;
                scaler += max.ln();
            }
            let node = &mut self.nodes[u];
            node.bottom_up.copy_from(&conditional);
            node.log_scaler = scaler;
        }
        let root = &self.nodes[self.root];
        let total: f64 = params
            .frequencies
            .iter()
            .zip(root.bottom_up.iter())
            .map(|(pi, lh)| pi * lh)
            .sum();
        if total > 0.0 && total.is_finite() {
            total.ln() + root.log_scaler
        } else {
            f64::NEG_INFINITY
        }
    }

    /// Pre-order pass. The root gets π; every other node u with parent v
    /// gets top_down_u[i] = Σⱼ Pij⁽ᵘ⁾ · top_down_v[j] · Πw Σₗ Pjl⁽ʷ⁾ ·
    /// bottom_up_w[l] over its siblings w, rescaled symmetrically to the
    /// bottom-up pass.
    pub fn calculate_top_down_likelihood(&mut self, params: &Parameters) {
        let k = params.frequencies.len();
        {
            let root = &mut self.nodes[self.root];
            for i in 0..k {
                root.top_down[i] = params.frequencies[i];
            }
            root.top_down_scaler = 0.0;
        }
        for &v in &self.pre_order() {
            if self.nodes[v].is_tip() {
                continue;
            }
            let children = self.nodes[v].children.clone();
            let contributions: Vec<DVector<f64>> = children
                .iter()
                .map(|&c| {
                    let child = &self.nodes[c];
                    &child.pij * &child.bottom_up
                })
                .collect();
            let parent_top_down = self.nodes[v].top_down.clone();
            let parent_scaler = self.nodes[v].top_down_scaler;
            for (ci, &u) in children.iter().enumerate() {
                let mut outside = parent_top_down.clone();
                let mut scaler = parent_scaler;
                for (cj, contribution) in contributions.iter().enumerate() {
                    if cj != ci {
                        outside.component_mul_assign(contribution);
                        scaler += self.nodes[children[cj]].log_scaler;
                    }
                }
                let mut partial = &self.nodes[u].pij * &outside;
                let max = partial.iter().cloned().fold(0.0f64, f64::max);
                if max > 0.0 && max < LIM_P {
                    partial /= max;
                    scaler += max.ln();
                }
                let node = &mut self.nodes[u];
                node.top_down.copy_from(&partial);
                node.top_down_scaler = scaler;
            }
        }
    }

    /// Combines both passes into the unnormalised per-node posterior.
    pub fn calculate_marginal_probabilities(&mut self) {
        for node in self.nodes.iter_mut() {
            let combined = node.bottom_up.component_mul(&node.top_down);
            node.marginal.copy_from(&combined);
        }
    }

    /// Normalises every posterior to sum to one.
    pub fn normalise_marginal_probabilities(&mut self) -> Result<()> {
        for node in self.nodes.iter_mut() {
            let sum: f64 = node.marginal.iter().sum();
            if !sum.is_finite() || sum <= 0.0 {
                return Err(PastmlError::NumericFailure(format!(
                    "the posterior at node {} cannot be normalised (sum {})",
                    node.id, sum
                )));
            }
            node.marginal /= sum;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::Annotation;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn jc_parameters(k: usize, scale: f64, epsilon: f64) -> Parameters {
        Parameters {
            frequencies: vec![1.0 / k as f64; k],
            scale,
            epsilon,
        }
    }

    fn prepared(newick: &str, csv: &str) -> (Tree, Annotation) {
        let mut tree: Tree = newick.parse().unwrap();
        let annotation = Annotation::from_csv(csv).unwrap();
        tree.allocate_state_buffers(annotation.num_states()).unwrap();
        annotation.initialise_tip_probabilities(&mut tree).unwrap();
        (tree, annotation)
    }

    #[test]
    fn test_pij_rows_are_stochastic() {
        let (mut tree, _) = prepared("((A:0.1,B:0.3):0.1,C:0.2);", "A,0\nB,1\nC,0\n");
        let params = jc_parameters(2, 1.7, 1e-4);
        tree.update_transition_probabilities(&params);
        for node in &tree.nodes {
            if node.id == tree.root {
                continue;
            }
            for i in 0..2 {
                let row: f64 = (0..2).map(|j| node.pij[(i, j)]).sum();
                assert_abs_diff_eq!(row, 1.0, epsilon = 1e-12);
                for j in 0..2 {
                    assert!(node.pij[(i, j)] > 0.0);
                }
            }
        }
    }

    #[test]
    fn test_zero_length_branch_is_identity_before_floor() {
        let (mut tree, _) = prepared("(A:0.0,B:0.5);", "A,0\nB,1\n");
        let params = jc_parameters(2, 1.0, 0.0);
        tree.update_transition_probabilities(&params);
        let a = 1;
        assert_abs_diff_eq!(tree.nodes[a].pij[(0, 0)], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(tree.nodes[a].pij[(0, 1)], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_two_tip_jc_symmetry() {
        // scenario: (A:0.5,B:0.5) with opposite states, JC
        let (mut tree, _) = prepared("(A:0.5,B:0.5);", "A,0\nB,1\n");
        let params = jc_parameters(2, 1.0, 1e-6);
        let log_likelihood = tree.calculate_bottom_up_likelihood(&params);
        assert!(log_likelihood.is_finite());
        assert!(log_likelihood < 0.0);
        tree.calculate_top_down_likelihood(&params);
        tree.calculate_marginal_probabilities();
        tree.normalise_marginal_probabilities().unwrap();
        let root = &tree.nodes[tree.root];
        assert_relative_eq!(root.marginal[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(root.marginal[1], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_single_state_is_certain() {
        // all tips share one state, so K = 1 and the likelihood is perfect
        let (mut tree, _) = prepared("((A:0.1,B:0.1):0.1,C:0.2);", "A,x\nB,x\nC,x\n");
        let params = jc_parameters(1, 1.0, 0.0);
        let log_likelihood = tree.calculate_bottom_up_likelihood(&params);
        assert_abs_diff_eq!(log_likelihood, 0.0, epsilon = 1e-12);
        tree.calculate_top_down_likelihood(&params);
        tree.calculate_marginal_probabilities();
        tree.normalise_marginal_probabilities().unwrap();
        for node in &tree.nodes {
            assert!(node.marginal[0] >= 0.999);
        }
    }

    #[test]
    fn test_missing_data_propagation() {
        let (mut tree, _) = prepared("((A:0.1,B:0.1):0.1,C:0.2);", "A,0\nB,?\nC,1\n");
        let params = jc_parameters(2, 1.0, 1e-6);
        tree.calculate_bottom_up_likelihood(&params);
        tree.calculate_top_down_likelihood(&params);
        tree.calculate_marginal_probabilities();
        tree.normalise_marginal_probabilities().unwrap();
        let root = &tree.nodes[tree.root];
        assert!(root.marginal[0] > 0.0 && root.marginal[0] < 1.0);
        assert!(root.marginal[1] > 0.0 && root.marginal[1] < 1.0);
        for node in &tree.nodes {
            let sum: f64 = node.marginal.iter().sum();
            assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_rescaling_keeps_deep_trees_finite() {
        // a 400-tip caterpillar with alternating states: the raw products
        // underflow far below 2^-500, the scalers must absorb it
        let tips = 400;
        let mut newick = String::from("(t0:0.001,t1:0.001)");
        for i in 2..tips {
            newick = format!("({}:0.001,t{}:0.001)", newick, i);
        }
        newick.push(';');
        let csv: String = (0..tips)
            .map(|i| format!("t{},{}\n", i, if i % 2 == 0 { "x" } else { "y" }))
            .collect();
        let (mut tree, _) = prepared(&newick, &csv);
        let params = jc_parameters(2, 1.0, 1e-8);
        let log_likelihood = tree.calculate_bottom_up_likelihood(&params);
        assert!(log_likelihood.is_finite());
        assert!(tree.nodes[tree.root].log_scaler < 0.0);
        tree.calculate_top_down_likelihood(&params);
        tree.calculate_marginal_probabilities();
        tree.normalise_marginal_probabilities().unwrap();
        for node in &tree.nodes {
            let sum: f64 = node.marginal.iter().sum();
            assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-9);
        }
    }
}
