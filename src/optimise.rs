//! Constrained maximum-likelihood estimation of the model parameters. The
//! bounded problem is mapped to an unconstrained one (softmax over the
//! frequencies, sigmoids for the scaling factor and ε), minimised with BFGS
//! and a backtracking line search, and the best point seen is kept.

use crate::tree::likelihood::Parameters;
use crate::tree::Tree;
use nalgebra::{DMatrix, DVector};

const GRADIENT_STEP: f64 = 1.0e-7;
const LINE_SEARCH_TOL: f64 = 0.1;
const MAX_ITERATIONS: usize = 200;

/// Box constraints for the scaling factor and ε, derived from the tree's
/// branch-length statistics.
#[derive(Debug, Clone)]
pub struct ParameterBounds {
    pub scale_low: f64,
    pub scale_up: f64,
    pub epsilon_low: f64,
    pub epsilon_up: f64,
}

impl ParameterBounds {
    pub fn from_tree(tree: &Tree) -> ParameterBounds {
        ParameterBounds {
            scale_low: 0.01 / tree.avg_branch_len,
            scale_up: 10.0 / tree.avg_branch_len,
            epsilon_low: (tree.min_branch_len / 10.0).min(tree.avg_tip_branch_len / 100.0),
            epsilon_up: (tree.min_branch_len * 10.0).min(tree.avg_tip_branch_len / 10.0),
        }
    }
}

/// Transforms an arbitrary slice so its entries are positive and sum to 1.
pub fn softmax(xs: &mut [f64]) {
    let mut exp_sum = 0.0;
    for x in xs.iter_mut() {
        *x = x.exp();
        exp_sum += *x;
    }
    for x in xs.iter_mut() {
        *x /= exp_sum;
    }
}

/// Maps an arbitrary value into (lower, upper).
pub fn sigmoid(x: f64, lower: f64, upper: f64) -> f64 {
    lower + (upper - lower) / (1.0 + (-x).exp())
}

/// Inverse of [`sigmoid`]; the argument must lie strictly inside the bounds.
pub fn anti_sigmoid(x: f64, lower: f64, upper: f64) -> f64 {
    -((upper - lower) / (x - lower) - 1.0).ln()
}

fn clamp_inside(x: f64, lower: f64, upper: f64) -> f64 {
    if x > lower && x < upper {
        x
    } else {
        lower + 0.5 * (upper - lower)
    }
}

/// Layout of the unconstrained optimisation vector: the K frequency
/// coordinates (F81 only), then the scaling factor (unless pinned), then ε.
struct Transform<'a> {
    k: usize,
    free_frequencies: bool,
    free_scale: bool,
    bounds: &'a ParameterBounds,
}

impl<'a> Transform<'a> {
    fn dimension(&self) -> usize {
        let mut n = 1;
        if self.free_frequencies {
            n += self.k;
        }
        if self.free_scale {
            n += 1;
        }
        n
    }

    fn initial_point(&self, params: &Parameters) -> DVector<f64> {
        let mut point = Vec::with_capacity(self.dimension());
        if self.free_frequencies {
            for &pi in &params.frequencies {
                point.push(pi.max(1e-12).ln());
            }
        }
        if self.free_scale {
            let scale = clamp_inside(params.scale, self.bounds.scale_low, self.bounds.scale_up);
            point.push(anti_sigmoid(scale, self.bounds.scale_low, self.bounds.scale_up));
        }
        let epsilon = clamp_inside(
            params.epsilon,
            self.bounds.epsilon_low,
            self.bounds.epsilon_up,
        );
        point.push(anti_sigmoid(
            epsilon,
            self.bounds.epsilon_low,
            self.bounds.epsilon_up,
        ));
        DVector::from_vec(point)
    }

    fn apply(&self, point: &DVector<f64>, params: &mut Parameters) {
        let mut index = 0;
        if self.free_frequencies {
            for a in 0..self.k {
                params.frequencies[a] = point[index + a];
            }
            softmax(&mut params.frequencies);
            index += self.k;
        }
        if self.free_scale {
            params.scale = sigmoid(point[index], self.bounds.scale_low, self.bounds.scale_up);
            index += 1;
        }
        params.epsilon = sigmoid(
            point[index],
            self.bounds.epsilon_low,
            self.bounds.epsilon_up,
        );
    }
}

fn negative_log_likelihood(
    transform: &Transform,
    tree: &mut Tree,
    scratch: &mut Parameters,
    point: &DVector<f64>,
) -> f64 {
    transform.apply(point, scratch);
    let log_likelihood = tree.calculate_bottom_up_likelihood(scratch);
    if log_likelihood.is_finite() {
        -log_likelihood
    } else {
        // an all-zero bottom-up vector marks an invalid point
        f64::INFINITY
    }
}

/// Forward finite differences in the unconstrained coordinates, reusing the
/// already known value at `point`.
fn gradient(
    transform: &Transform,
    tree: &mut Tree,
    scratch: &mut Parameters,
    point: &DVector<f64>,
    value_at_point: f64,
) -> DVector<f64> {
    let n = point.len();
    let mut grad = DVector::zeros(n);
    let mut probe = point.clone();
    for i in 0..n {
        probe[i] += GRADIENT_STEP;
        let value = negative_log_likelihood(transform, tree, scratch, &probe);
        grad[i] = (value - value_at_point) / GRADIENT_STEP;
        probe[i] = point[i];
    }
    grad
}

/// BFGS minimisation of −log L over the transformed parameters. `params`
/// is updated in place with the best point found; the returned value is the
/// optimum log-likelihood. Line-search failures are not errors: the best
/// point seen so far is kept and reported.
pub fn minimise_parameters(
    tree: &mut Tree,
    params: &mut Parameters,
    bounds: &ParameterBounds,
    optimise_frequencies: bool,
    optimise_scale: bool,
    quiet: bool,
) -> f64 {
    let transform = Transform {
        k: params.frequencies.len(),
        free_frequencies: optimise_frequencies,
        free_scale: optimise_scale,
        bounds,
    };
    let n = transform.dimension();
    let mut scratch = params.clone();

    if !quiet {
        println!(
            "Scaling factor can vary between {:.10} and {:.10}",
            bounds.scale_low, bounds.scale_up
        );
        println!(
            "Epsilon can vary between {:e} and {:e}",
            bounds.epsilon_low, bounds.epsilon_up
        );
        println!("\tstep\tlog-lh\t\tscaling\tepsilon");
    }

    let mut point = transform.initial_point(params);
    let mut value = negative_log_likelihood(&transform, tree, &mut scratch, &point);
    let mut grad = gradient(&transform, tree, &mut scratch, &point, value);
    let mut inverse_hessian = DMatrix::identity(n, n);

    let mut best_point = point.clone();
    let mut best_value = value;
    let mut step_size = 1.0;
    let mut tolerance = 1.0e-3;
    let mut iteration = 0usize;

    while iteration < MAX_ITERATIONS {
        iteration += 1;

        let mut direction = -(&inverse_hessian * &grad);
        let mut slope = grad.dot(&direction);
        if !(slope < 0.0) {
            // the curvature estimate went bad, restart from steepest descent
            inverse_hessian = DMatrix::identity(n, n);
            direction = -grad.clone();
            slope = -grad.norm_squared();
            if slope == 0.0 {
                break;
            }
        }

        let mut alpha = step_size;
        let mut accepted = None;
        for _ in 0..50 {
            let candidate = &point + &direction * alpha;
            let candidate_value =
                negative_log_likelihood(&transform, tree, &mut scratch, &candidate);
            if candidate_value <= value + LINE_SEARCH_TOL * alpha * slope {
                accepted = Some((candidate, candidate_value));
                break;
            }
            alpha *= 0.5;
        }

        let (new_point, new_value) = match accepted {
            Some(step) => step,
            None => {
                // no progress along this direction: retry with a smaller
                // step before giving up, as the reference minimiser does
                if step_size > GRADIENT_STEP {
                    step_size /= 10.0;
                    iteration -= 1;
                    inverse_hessian = DMatrix::identity(n, n);
                    if !quiet {
                        println!("\t\t(decreased the step size to {:.1e})", step_size);
                    }
                    continue;
                }
                if !quiet {
                    println!("\t\t(stopping minimisation: the line search cannot make progress)");
                }
                break;
            }
        };

        let new_grad = gradient(&transform, tree, &mut scratch, &new_point, new_value);
        let s = &new_point - &point;
        let y = &new_grad - &grad;
        let sy = s.dot(&y);
        if sy > 1.0e-30 {
            // H ← (I − s·yᵀ/sᵀy) · H · (I − y·sᵀ/sᵀy) + s·sᵀ/sᵀy
            let rho = 1.0 / sy;
            let identity = DMatrix::identity(n, n);
            let left = &identity - &(&s * y.transpose()) * rho;
            let right = &identity - &(&y * s.transpose()) * rho;
            inverse_hessian = &left * &inverse_hessian * &right + (&s * s.transpose()) * rho;
        }

        point = new_point;
        value = new_value;
        grad = new_grad;
        if value < best_value {
            best_value = value;
            best_point = point.clone();
        }

        if !quiet {
            transform.apply(&point, &mut scratch);
            print!("\t{}\t{:.10}\t", iteration, -value);
            if optimise_frequencies {
                for pi in &scratch.frequencies {
                    print!("{:.10}\t", pi);
                }
            }
            println!("{:.10}\t{:e}", scratch.scale, scratch.epsilon);
        }

        if grad.norm() < tolerance {
            if iteration < 10 && tolerance > 1.0e-5 {
                // guard against spurious early convergence
                tolerance /= 10.0;
                if !quiet {
                    println!(
                        "\t\t(found an optimum candidate, decreased the gradient tolerance to {:.1e})",
                        tolerance
                    );
                }
                continue;
            }
            if !quiet {
                println!("\t\t(optimum found)");
            }
            break;
        }
    }

    transform.apply(&best_point, params);
    // leave the tree's buffers in the state of the returned optimum
    tree.calculate_bottom_up_likelihood(params)
}
