mod annotation;
mod errors;
mod optimise;
mod output;
mod run;
mod tree;

use clap::{App, Arg, ErrorKind};
use errors::{PastmlError, Result};
use run::{Method, Model, RunOptions};
use std::path::PathBuf;
use std::process;

fn main() {
    if let Err(error) = parse_options().and_then(|options| run::run(&options)) {
        eprintln!("{}", error);
        process::exit(error.exit_code());
    }
}

fn parse_options() -> Result<RunOptions> {
    let app = App::new("pastml")
        .about("Ancestral character state reconstruction on a rooted phylogeny by maximum likelihood")
        .arg(
            Arg::with_name("annotation")
                .short("a")
                .value_name("ANNOTATION_FILE")
                .help("path to the annotation csv file containing tip states")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("tree")
                .short("t")
                .value_name("TREE_NWK")
                .help("path to the tree file (in newick format)")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("out_annotation")
                .short("o")
                .value_name("OUTPUT_ANNOTATION_FILE")
                .help("path where the output annotation csv file with node states will be created")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("out_tree")
                .short("n")
                .value_name("OUTPUT_TREE_NWK")
                .help("path where the output tree file will be created (in newick format)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("out_parameters")
                .short("p")
                .value_name("OUTPUT_PARAMETERS_FILE")
                .help("path where the optimised parameter csv file will be created")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("model")
                .short("m")
                .value_name("MODEL")
                .help("state evolution model (JC or F81)")
                .takes_value(true)
                .default_value("JC"),
        )
        .arg(
            Arg::with_name("scaling")
                .short("s")
                .value_name("SCALING_ON_OFF")
                .help("branch length scaling on (T, by default) or off (F)")
                .takes_value(true)
                .default_value("T"),
        )
        .arg(
            Arg::with_name("collapse")
                .short("B")
                .value_name("THRESHOLD_OF_BRANCH_COLLAPSE")
                .help("define X to collapse branches shorter than 1.0e-X (default: no collapse)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("method")
                .long("method")
                .value_name("METHOD")
                .help("prediction method: marginal_approx, marginal, max_posteriori or joint")
                .takes_value(true)
                .default_value("marginal_approx"),
        )
        .arg(
            Arg::with_name("quiet")
                .short("q")
                .help("do not print progress information"),
        );

    let matches = match app.get_matches_safe() {
        Ok(matches) => matches,
        Err(e) => {
            if e.kind == ErrorKind::HelpDisplayed || e.kind == ErrorKind::VersionDisplayed {
                println!("{}", e.message);
                process::exit(0);
            }
            return Err(PastmlError::BadInput(e.message));
        }
    };

    let annotation_path = PathBuf::from(matches.value_of("annotation").unwrap());
    let tree_path = PathBuf::from(matches.value_of("tree").unwrap());
    let model: Model = matches.value_of("model").unwrap().parse()?;
    let method: Method = matches.value_of("method").unwrap().parse()?;
    let scaling = match matches.value_of("scaling").unwrap() {
        "T" => true,
        "F" => false,
        other => {
            return Err(PastmlError::BadInput(format!(
                "branch length scaling (-s) must be T or F, not {}",
                other
            )))
        }
    };
    let collapse_threshold = match matches.value_of("collapse") {
        Some(value) => {
            let exponent: f64 = value.parse().map_err(|_| {
                PastmlError::BadInput(format!(
                    "the branch collapse threshold (-B) must be a number, not {}",
                    value
                ))
            })?;
            Some(0.1f64.powf(exponent))
        }
        None => None,
    };

    let out_annotation_path = matches
        .value_of("out_annotation")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("{}.pastml.out.csv", annotation_path.display())));
    let out_tree_path = matches
        .value_of("out_tree")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("{}.pastml.out.nwk", tree_path.display())));
    let out_parameters_path = matches
        .value_of("out_parameters")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            PathBuf::from(format!("{}.pastml.parameters.csv", annotation_path.display()))
        });

    Ok(RunOptions {
        annotation_path,
        tree_path,
        out_annotation_path,
        out_tree_path,
        out_parameters_path,
        model,
        method,
        scaling,
        collapse_threshold,
        quiet: matches.is_present("quiet"),
    })
}
