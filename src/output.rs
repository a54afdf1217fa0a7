//! Output assembly: the annotated newick tree, the per-node state table
//! and the optimised parameter table. Everything is rendered to a string
//! first and written in one go, so a failed run leaves no partial files.

use crate::annotation::Annotation;
use crate::errors::{PastmlError, Result};
use crate::tree::likelihood::Parameters;
use crate::tree::Tree;
use std::fs;
use std::path::Path;

/// Tips keep their taxon name; internal nodes are named n<id>.
pub fn node_display_name(tree: &Tree, u: usize) -> String {
    match &tree.nodes[u].name {
        Some(name) if tree.nodes[u].is_tip() => name.clone(),
        _ => format!("n{}", u),
    }
}

/// Renders the tree as a single newick expression with deterministic
/// internal node names. Branch lengths are written as they are stored, so
/// rescaling must happen before this call.
pub fn to_newick(tree: &Tree) -> String {
    fn write_subtree(tree: &Tree, u: usize, out: &mut String) {
        let node = &tree.nodes[u];
        if !node.children.is_empty() {
            out.push('(');
            for (i, &c) in node.children.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_subtree(tree, c, out);
            }
            out.push(')');
        }
        out.push_str(&node_display_name(tree, u));
        if u != tree.root {
            out.push_str(&format!(":{}", node.branch_length));
        }
    }
    let mut out = String::new();
    write_subtree(tree, tree.root, &mut out);
    out.push_str(";\n");
    out
}

/// One row per node: its marginal probability for every state, plus the
/// selected state set joined with `|`.
pub fn ancestral_states_csv(tree: &Tree, annotation: &Annotation) -> String {
    let mut out = String::from("node");
    for label in annotation.labels() {
        out.push(',');
        out.push_str(label);
    }
    out.push_str(",predicted_states\n");
    for u in 0..tree.num_nodes() {
        out.push_str(&node_display_name(tree, u));
        for a in 0..annotation.num_states() {
            out.push_str(&format!(",{:.10}", tree.nodes[u].marginal[a]));
        }
        let predicted: Vec<&str> = tree.nodes[u]
            .best_states
            .iter()
            .map(|&a| annotation.label(a))
            .collect();
        out.push(',');
        out.push_str(&predicted.join("|"));
        out.push('\n');
    }
    out
}

/// The optimised parameter table: model, method, frequencies (F81 only),
/// scaling factor, ε and the final log-likelihood.
pub fn parameters_csv(
    params: &Parameters,
    annotation: &Annotation,
    log_likelihood: f64,
    model: &str,
    method: &str,
    with_frequencies: bool,
) -> String {
    let mut out = String::from("parameter,value\n");
    out.push_str(&format!("model,{}\n", model));
    out.push_str(&format!("method,{}\n", method));
    if with_frequencies {
        for (a, pi) in params.frequencies.iter().enumerate() {
            out.push_str(&format!("frequency_{},{:.10}\n", annotation.label(a), pi));
        }
    }
    out.push_str(&format!("scaling_factor,{:.10}\n", params.scale));
    out.push_str(&format!("epsilon,{:e}\n", params.epsilon));
    out.push_str(&format!("log_likelihood,{:.10}\n", log_likelihood));
    out
}

pub fn write_file(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).map_err(|e| {
        PastmlError::BadInput(format!("could not write {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepared(newick: &str, csv: &str) -> (Tree, Annotation) {
        let mut tree: Tree = newick.parse().unwrap();
        let annotation = Annotation::from_csv(csv).unwrap();
        tree.allocate_state_buffers(annotation.num_states()).unwrap();
        annotation.initialise_tip_probabilities(&mut tree).unwrap();
        (tree, annotation)
    }

    #[test]
    fn test_newick_names_internal_nodes_by_id() {
        let (tree, _) = prepared("((A:0.1,B:0.1):0.1,C:0.2);", "A,0\nB,1\nC,0\n");
        assert_eq!(to_newick(&tree), "((A:0.1,B:0.1)n1:0.1,C:0.2)n0;\n");
    }

    #[test]
    fn test_newick_round_trips_through_the_parser() {
        let (tree, _) = prepared("((A:0.1,B:0.1):0.1,C:0.2);", "A,0\nB,1\nC,0\n");
        let rendered = to_newick(&tree);
        let reparsed: Tree = rendered.parse().unwrap();
        assert_eq!(reparsed.num_nodes(), tree.num_nodes());
        assert_eq!(to_newick(&reparsed), rendered);
    }

    #[test]
    fn test_states_csv_layout() {
        let (mut tree, annotation) = prepared("(A:0.5,B:0.5);", "A,red\nB,blue\n");
        for u in 0..tree.num_nodes() {
            tree.nodes[u].marginal[0] = 0.25;
            tree.nodes[u].marginal[1] = 0.75;
            tree.nodes[u].best_states = vec![1, 0];
        }
        let csv = ancestral_states_csv(&tree, &annotation);
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("node,red,blue,predicted_states"));
        assert_eq!(
            lines.next(),
            Some("n0,0.2500000000,0.7500000000,blue|red")
        );
        assert_eq!(
            lines.next(),
            Some("A,0.2500000000,0.7500000000,blue|red")
        );
    }

    #[test]
    fn test_parameters_csv_layout() {
        let (_, annotation) = prepared("(A:0.5,B:0.5);", "A,red\nB,blue\n");
        let params = Parameters {
            frequencies: vec![0.7, 0.3],
            scale: 2.0,
            epsilon: 1e-5,
        };
        let csv = parameters_csv(&params, &annotation, -3.5, "F81", "marginal_approx", true);
        assert!(csv.starts_with("parameter,value\nmodel,F81\nmethod,marginal_approx\n"));
        assert!(csv.contains("frequency_red,0.7000000000\n"));
        assert!(csv.contains("frequency_blue,0.3000000000\n"));
        assert!(csv.contains("scaling_factor,2.0000000000\n"));
        assert!(csv.contains("log_likelihood,-3.5000000000\n"));
    }
}
