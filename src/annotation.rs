//! Annotation intake: reads the two-column tip/state csv, discovers the
//! state alphabet in first-occurrence order, and initialises the tip
//! likelihood vectors.

use crate::errors::{PastmlError, Result};
use crate::tree::Tree;
use integeriser::{HashIntegeriser, Integeriser};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Observed tip states plus the alphabet discovered from them. Labels are
/// interned into dense indices; the inverse mapping is kept for output.
pub struct Annotation {
    /// tip name -> observed state index, `None` for missing data
    states: HashMap<String, Option<usize>>,
    /// tip names in file order, for deterministic mismatch reports
    row_names: Vec<String>,
    alphabet: HashIntegeriser<String>,
}

impl Annotation {
    pub fn from_file(path: &Path) -> Result<Annotation> {
        let content = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PastmlError::not_found(path, e)
            } else {
                PastmlError::BadInput(format!(
                    "could not read the annotation file {}: {}",
                    path.display(),
                    e
                ))
            }
        })?;
        Annotation::from_csv(&content)
    }

    /// Parses csv rows of the form `tip_name,state_label`. An empty label
    /// or `?` marks missing data; every other label is compared by exact
    /// byte equality and numbered by first occurrence.
    pub fn from_csv(content: &str) -> Result<Annotation> {
        let mut states = HashMap::new();
        let mut row_names = Vec::new();
        let mut alphabet = HashIntegeriser::new();
        for (row, line) in content.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let columns: Vec<&str> = line.split(',').collect();
            if columns.len() != 2 {
                return Err(PastmlError::BadInput(format!(
                    "annotation row {} has {} columns instead of 2: {}",
                    row + 1,
                    columns.len(),
                    line
                )));
            }
            let name = columns[0];
            if name.is_empty() {
                return Err(PastmlError::BadInput(format!(
                    "annotation row {} has an empty tip name",
                    row + 1
                )));
            }
            let state = match columns[1] {
                "" | "?" => None,
                label => Some(alphabet.integerise(label.to_string())),
            };
            if states.insert(name.to_string(), state).is_some() {
                return Err(PastmlError::BadInput(format!(
                    "tip {} appears more than once in the annotation file",
                    name
                )));
            }
            row_names.push(name.to_string());
        }
        Ok(Annotation {
            states,
            row_names,
            alphabet,
        })
    }

    /// Number of distinct observed states K.
    pub fn num_states(&self) -> usize {
        self.alphabet.size()
    }

    pub fn num_rows(&self) -> usize {
        self.row_names.len()
    }

    pub fn label(&self, state: usize) -> &str {
        self.alphabet
            .find_value(state)
            .map(|s| s.as_str())
            .unwrap_or("?")
    }

    pub fn labels(&self) -> Vec<&str> {
        (0..self.num_states()).map(|a| self.label(a)).collect()
    }

    pub fn state_index(&self, label: &str) -> Option<usize> {
        self.alphabet.find_key(&label.to_string())
    }

    /// How often each state is observed, for the initial F81 frequencies.
    pub fn state_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.num_states()];
        for state in self.states.values() {
            if let Some(a) = state {
                counts[*a] += 1;
            }
        }
        counts
    }

    /// Sets every tip's bottom-up vector: a one-hot for an observed state,
    /// all ones for missing data. Tips absent from the annotation table are
    /// treated as missing; annotation rows naming no tree tip are an error,
    /// surfaced here rather than silently ignored.
    pub fn initialise_tip_probabilities(&self, tree: &mut Tree) -> Result<()> {
        let k = self.num_states();
        let mut seen: HashSet<&str> = HashSet::new();
        for u in tree.tip_ids() {
            let name = match &tree.nodes[u].name {
                Some(name) => name.clone(),
                None => {
                    return Err(PastmlError::BadInput(format!(
                        "tip n{} has no name to look up in the annotation file",
                        u
                    )))
                }
            };
            let state = self.states.get(name.as_str()).copied().flatten();
            let node = &mut tree.nodes[u];
            node.fixed_state = state;
            node.log_scaler = 0.0;
            match state {
                Some(a) => {
                    node.bottom_up.fill(0.0);
                    node.bottom_up[a] = 1.0;
                }
                None => node.bottom_up.fill(1.0),
            }
            debug_assert_eq!(node.bottom_up.len(), k);
            if let Some((key, _)) = self.states.get_key_value(name.as_str()) {
                seen.insert(key.as_str());
            }
        }
        for name in &self.row_names {
            if !seen.contains(name.as_str()) {
                return Err(PastmlError::BadInput(format!(
                    "tip {} from the annotation file is not present in the tree",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alphabet_first_occurrence_order() {
        let ann = Annotation::from_csv("t1,red\nt2,blue\nt3,red\nt4,green\n").unwrap();
        assert_eq!(ann.num_states(), 3);
        assert_eq!(ann.labels(), vec!["red", "blue", "green"]);
        assert_eq!(ann.state_index("blue"), Some(1));
        assert_eq!(ann.state_counts(), vec![2, 1, 1]);
    }

    #[test]
    fn test_missing_markers() {
        let ann = Annotation::from_csv("t1,a\nt2,?\nt3,\n").unwrap();
        assert_eq!(ann.num_states(), 1);
        assert_eq!(ann.num_rows(), 3);
        assert_eq!(ann.state_counts(), vec![1]);
    }

    #[test]
    fn test_malformed_rows() {
        assert!(Annotation::from_csv("t1,a,b\n").is_err());
        assert!(Annotation::from_csv("t1\n").is_err());
        assert!(Annotation::from_csv(",a\n").is_err());
        assert!(Annotation::from_csv("t1,a\nt1,b\n").is_err());
    }

    #[test]
    fn test_tip_initialisation() {
        let mut tree: Tree = "((A:0.1,B:0.1):0.1,C:0.2);".parse().unwrap();
        let ann = Annotation::from_csv("A,0\nB,?\nC,1\n").unwrap();
        tree.allocate_state_buffers(ann.num_states()).unwrap();
        ann.initialise_tip_probabilities(&mut tree).unwrap();

        let a = tree
            .tip_ids()
            .into_iter()
            .find(|&u| tree.nodes[u].name.as_deref() == Some("A"))
            .unwrap();
        let b = tree
            .tip_ids()
            .into_iter()
            .find(|&u| tree.nodes[u].name.as_deref() == Some("B"))
            .unwrap();
        assert_eq!(tree.nodes[a].bottom_up.as_slice(), &[1.0, 0.0]);
        assert_eq!(tree.nodes[a].fixed_state, Some(0));
        // missing data: every state equally compatible
        assert_eq!(tree.nodes[b].bottom_up.as_slice(), &[1.0, 1.0]);
        assert_eq!(tree.nodes[b].fixed_state, None);
    }

    #[test]
    fn test_unannotated_tip_is_missing() {
        let mut tree: Tree = "(A:0.1,B:0.1);".parse().unwrap();
        let ann = Annotation::from_csv("A,x\n").unwrap();
        tree.allocate_state_buffers(ann.num_states()).unwrap();
        ann.initialise_tip_probabilities(&mut tree).unwrap();
        let b = 2;
        assert_eq!(tree.nodes[b].fixed_state, None);
        assert_eq!(tree.nodes[b].bottom_up.as_slice(), &[1.0]);
    }

    #[test]
    fn test_annotation_tip_missing_from_tree() {
        let mut tree: Tree = "(A:0.1,B:0.1);".parse().unwrap();
        let ann = Annotation::from_csv("A,x\nB,y\nGHOST,x\n").unwrap();
        tree.allocate_state_buffers(ann.num_states()).unwrap();
        let err = ann.initialise_tip_probabilities(&mut tree).unwrap_err();
        assert!(err.to_string().contains("GHOST"));
    }
}
