//! The sequential pipeline behind the command line: annotation intake,
//! tree intake, tip initialisation, parameter optimisation, the likelihood
//! passes, state selection, and output assembly.

use crate::annotation::Annotation;
use crate::errors::{PastmlError, Result};
use crate::optimise::{minimise_parameters, ParameterBounds};
use crate::output;
use crate::tree::likelihood::Parameters;
use crate::tree::Tree;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

/// Upper bound on the newick file size, roughly 10 MB.
pub const MAX_TREELENGTH: u64 = 10_000_000;

macro_rules! log_info {
    ($options:expr, $($arg:tt)*) => {
        if !$options.quiet {
            println!($($arg)*);
        }
    };
}

/// Substitution model for the single analysed character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    Jc,
    F81,
}

impl FromStr for Model {
    type Err = PastmlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "JC" => Ok(Model::Jc),
            "F81" => Ok(Model::F81),
            other => Err(PastmlError::BadInput(format!(
                "model must be either JC or F81, not {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Model::Jc => write!(f, "JC"),
            Model::F81 => write!(f, "F81"),
        }
    }
}

/// Ancestral state prediction method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    MarginalApprox,
    Marginal,
    MaxPosteriori,
    Joint,
}

impl FromStr for Method {
    type Err = PastmlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "marginal_approx" => Ok(Method::MarginalApprox),
            "marginal" => Ok(Method::Marginal),
            "max_posteriori" => Ok(Method::MaxPosteriori),
            "joint" => Ok(Method::Joint),
            other => Err(PastmlError::BadInput(format!(
                "prediction method must be one of marginal_approx, marginal, \
                 max_posteriori or joint, not {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Method::MarginalApprox => "marginal_approx",
            Method::Marginal => "marginal",
            Method::MaxPosteriori => "max_posteriori",
            Method::Joint => "joint",
        };
        write!(f, "{}", name)
    }
}

pub struct RunOptions {
    pub annotation_path: PathBuf,
    pub tree_path: PathBuf,
    pub out_annotation_path: PathBuf,
    pub out_tree_path: PathBuf,
    pub out_parameters_path: PathBuf,
    pub model: Model,
    pub method: Method,
    pub scaling: bool,
    /// Branches shorter than this are collapsed to it before anything else.
    pub collapse_threshold: Option<f64>,
    pub quiet: bool,
}

fn initial_frequencies(annotation: &Annotation, model: Model) -> Vec<f64> {
    let k = annotation.num_states();
    match model {
        Model::Jc => vec![1.0 / k as f64; k],
        Model::F81 => {
            let counts = annotation.state_counts();
            let total: usize = counts.iter().sum();
            counts
                .iter()
                .map(|&c| c as f64 / total as f64)
                .collect()
        }
    }
}

/// Runs the whole inference once. Strictly sequential: parse, alphabet,
/// tree build, tip init, optimise, top-down, marginal, selection, write.
pub fn run(options: &RunOptions) -> Result<()> {
    let start = Instant::now();
    log_info!(options, "MODEL:\t{}\n", options.model);
    log_info!(
        options,
        "ANCESTRAL STATE PREDICTION METHOD:\t{}\n",
        options.method
    );

    let annotation = Annotation::from_file(&options.annotation_path)?;
    let k = annotation.num_states();
    if k == 0 {
        return Err(PastmlError::BadInput(
            "the annotation file contains no observed states".to_string(),
        ));
    }

    let metadata = fs::metadata(&options.tree_path)
        .map_err(|e| PastmlError::not_found(&options.tree_path, e))?;
    if metadata.len() > MAX_TREELENGTH {
        return Err(PastmlError::TooLarge(
            options.tree_path.display().to_string(),
            MAX_TREELENGTH,
        ));
    }
    let newick = fs::read_to_string(&options.tree_path)
        .map_err(|e| PastmlError::not_found(&options.tree_path, e))?;
    let mut tree: Tree = newick.parse()?;
    if let Some(threshold) = options.collapse_threshold {
        tree.rescale_branch_lengths(1.0, threshold);
        log_info!(
            options,
            "COLLAPSED BRANCHES SHORTER THAN {:e}\n",
            threshold
        );
    }
    if annotation.num_rows() != tree.num_tips {
        eprintln!(
            "Warning: the annotation file has {} rows but the tree has {} tips",
            annotation.num_rows(),
            tree.num_tips
        );
    }

    tree.allocate_state_buffers(k)?;
    annotation.initialise_tip_probabilities(&mut tree)?;

    let mut params = Parameters {
        frequencies: initial_frequencies(&annotation, options.model),
        scale: if options.scaling {
            1.0 / tree.avg_branch_len
        } else {
            1.0
        },
        epsilon: tree.min_branch_len,
    };
    log_info!(options, "INITIAL FREQUENCIES:\n");
    for (a, pi) in params.frequencies.iter().enumerate() {
        log_info!(options, "\t{}:\t{:.10}", annotation.label(a), pi);
    }
    log_info!(options, "");

    let bounds = ParameterBounds::from_tree(&tree);
    let initial_log_likelihood = tree.calculate_bottom_up_likelihood(&params);
    if !initial_log_likelihood.is_finite() {
        return Err(PastmlError::NumericFailure(
            "the bottom-up likelihood collapsed to zero; does every inner \
             node of the tree have at least two children?"
                .to_string(),
        ));
    }
    log_info!(
        options,
        "INITIAL LOG LIKELIHOOD:\t{:.10}\n",
        initial_log_likelihood
    );

    let mut log_likelihood = initial_log_likelihood;
    if initial_log_likelihood == 0.0 {
        log_info!(
            options,
            "INITIAL LIKELIHOOD IS PERFECT, CANNOT DO BETTER THAN THAT.\n"
        );
    } else {
        log_info!(options, "OPTIMISING PARAMETERS...\n");
        log_likelihood = minimise_parameters(
            &mut tree,
            &mut params,
            &bounds,
            options.model == Model::F81,
            options.scaling,
            options.quiet,
        );
        log_info!(options, "\nOPTIMISED PARAMETERS:\n");
        if options.model == Model::F81 {
            for (a, pi) in params.frequencies.iter().enumerate() {
                log_info!(
                    options,
                    "\tFrequency of {}:\t{:.10}",
                    annotation.label(a),
                    pi
                );
            }
        }
        log_info!(options, "\tScaling factor:\t{:.10}", params.scale);
        log_info!(options, "\tEpsilon:\t{:e}\n", params.epsilon);
        log_info!(options, "OPTIMISED LOG LIKELIHOOD:\t{:.10}\n", log_likelihood);
    }

    output::write_file(
        &options.out_parameters_path,
        &output::parameters_csv(
            &params,
            &annotation,
            log_likelihood,
            &options.model.to_string(),
            &options.method.to_string(),
            options.model == Model::F81,
        ),
    )?;
    log_info!(
        options,
        "\tOptimised parameters are written to {} in csv format.\n",
        options.out_parameters_path.display()
    );

    match options.method {
        Method::Joint => {
            log_info!(options, "PREDICTING MOST LIKELY ANCESTRAL STATES...\n");
            tree.choose_joint_states(&params);
        }
        method => {
            log_info!(options, "CALCULATING TOP-DOWN LIKELIHOOD...\n");
            tree.calculate_top_down_likelihood(&params);
            log_info!(options, "CALCULATING MARGINAL PROBABILITIES...\n");
            tree.calculate_marginal_probabilities();
            tree.normalise_marginal_probabilities()?;
            log_info!(options, "PREDICTING MOST LIKELY ANCESTRAL STATES...\n");
            if method == Method::MarginalApprox {
                tree.choose_likely_states();
            } else {
                tree.choose_best_marginal_states();
            }
        }
    }

    // the output tree carries the optimised scaling, floored at ε
    tree.rescale_branch_lengths(params.scale, params.epsilon);
    output::write_file(&options.out_tree_path, &output::to_newick(&tree))?;
    log_info!(options, "SAVING THE RESULTS...\n");
    log_info!(
        options,
        "\tScaled tree with internal node ids is written to {}.",
        options.out_tree_path.display()
    );
    output::write_file(
        &options.out_annotation_path,
        &output::ancestral_states_csv(&tree, &annotation),
    )?;
    log_info!(
        options,
        "\tState predictions are written to {} in csv format.\n",
        options.out_annotation_path.display()
    );

    let elapsed = start.elapsed().as_secs_f64();
    let minutes = (elapsed / 60.0) as u64;
    log_info!(
        options,
        "TOTAL EXECUTION TIME:\t{} minute{} {:.2} seconds\n",
        minutes,
        if minutes == 1 { "" } else { "s" },
        elapsed - 60.0 * minutes as f64
    );
    Ok(())
}
