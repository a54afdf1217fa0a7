use crate::errors::PastmlError;
use crate::tree::Tree;
use nom::{
    alt, char, complete, do_parse, is_a, is_not, map, map_res, named, opt,
    preceded, separated_nonempty_list,
};
use std::str::{from_utf8, FromStr};

/// Longest accepted taxon name.
const MAX_NAMELENGTH: usize = 255;

/// Parse tree before it is flattened into the arena.
struct Subtree {
    name: Option<String>,
    branch_length: f64,
    children: Vec<Subtree>,
}

named!(
    label<&[u8], String>,
    map!(map_res!(is_not!("(),:;"), from_utf8), String::from)
);

named!(
    branch_length<&[u8], f64>,
    map_res!(
        map_res!(is_a!("0123456789+-.eE"), from_utf8),
        FromStr::from_str
    )
);

named!(
    leaf<&[u8], Subtree>,
    do_parse!(
        name: label
            >> length: opt!(complete!(preceded!(char!(':'), branch_length)))
            >> (Subtree {
                name: Some(name),
                branch_length: length.unwrap_or(0.0),
                children: Vec::new(),
            })
    )
);

named!(
    internal<&[u8], Subtree>,
    do_parse!(
        char!('(')
            >> children: separated_nonempty_list!(char!(','), subtree)
            >> char!(')')
            >> name: opt!(label)
            >> length: opt!(complete!(preceded!(char!(':'), branch_length)))
            >> (Subtree {
                name,
                branch_length: length.unwrap_or(0.0),
                children,
            })
    )
);

named!(subtree<&[u8], Subtree>, alt!(internal | leaf));

named!(
    newick<&[u8], Subtree>,
    do_parse!(tree: subtree >> char!(';') >> (tree))
);

impl FromStr for Tree {
    type Err = PastmlError;

    /// Parses a single `;`-terminated newick expression. Whitespace is
    /// ignored everywhere; a trifurcation at the root is re-rooted by
    /// promoting the first internal child.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        match newick(compact.as_bytes()) {
            Ok((rest, parsed)) => {
                if !rest.is_empty() {
                    return Err(PastmlError::BadInput(format!(
                        "unexpected characters after the closing ';' of the newick tree: {}",
                        String::from_utf8_lossy(rest)
                    )));
                }
                let mut tree = Tree::new();
                flatten(&mut tree, parsed, None)?;
                tree.promote_root_if_unrooted();
                tree.update_aggregates();
                Ok(tree)
            }
            Err(_) => Err(PastmlError::BadInput(
                "malformed newick tree".to_string(),
            )),
        }
    }
}

/// Moves a parsed subtree into the arena, assigning dense pre-order ids.
fn flatten(
    tree: &mut Tree,
    subtree: Subtree,
    parent: Option<usize>,
) -> Result<(), PastmlError> {
    if let Some(name) = &subtree.name {
        if name.len() > MAX_NAMELENGTH {
            return Err(PastmlError::BadInput(format!(
                "taxon name longer than {} characters ({} bytes)",
                MAX_NAMELENGTH,
                name.len()
            )));
        }
    }
    if subtree.children.is_empty() && subtree.name.is_none() {
        return Err(PastmlError::BadInput(
            "the newick tree contains an unnamed tip".to_string(),
        ));
    }
    if subtree.branch_length < 0.0 {
        return Err(PastmlError::BadInput(format!(
            "negative branch length {}",
            subtree.branch_length
        )));
    }
    // the root edge carries no length
    let length = if parent.is_none() {
        0.0
    } else {
        subtree.branch_length
    };
    let id = tree.add_node(subtree.name, length, parent);
    for child in subtree.children {
        flatten(tree, child, Some(id))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_parse_two_tips() {
        let tree: Tree = "(A:0.5,B:0.5);".parse().unwrap();
        assert_eq!(tree.num_nodes(), 3);
        assert_eq!(tree.num_tips, 2);
        assert_eq!(tree.root, 0);
        assert_eq!(tree.nodes[1].name.as_deref(), Some("A"));
        assert_eq!(tree.nodes[2].name.as_deref(), Some("B"));
        assert_relative_eq!(tree.nodes[1].branch_length, 0.5);
        assert_relative_eq!(tree.nodes[tree.root].branch_length, 0.0);
    }

    #[test]
    fn test_parse_nested_with_whitespace() {
        let tree: Tree = "( (A : 0.1, B:0.1) : 0.1,\n C:0.2) ;".parse().unwrap();
        assert_eq!(tree.num_nodes(), 5);
        assert_eq!(tree.num_tips, 3);
        let inner = tree.nodes[tree.root].children[0];
        assert_eq!(tree.nodes[inner].children.len(), 2);
        assert_relative_eq!(tree.nodes[inner].branch_length, 0.1);
    }

    #[test]
    fn test_parse_scientific_lengths_and_labels() {
        let tree: Tree = "((A:1e-7,B:0.1)ab:2.5e-1,C:0.2)r;".parse().unwrap();
        let inner = tree.nodes[tree.root].children[0];
        assert_relative_eq!(tree.nodes[inner].branch_length, 0.25);
        assert_eq!(tree.nodes[inner].name.as_deref(), Some("ab"));
        let a = tree.nodes[inner].children[0];
        assert_relative_eq!(tree.nodes[a].branch_length, 1e-7);
    }

    #[test]
    fn test_missing_length_defaults_to_zero() {
        let tree: Tree = "(A,B:0.5);".parse().unwrap();
        assert_relative_eq!(tree.nodes[1].branch_length, 0.0);
    }

    #[test]
    fn test_unrooted_input_is_promoted() {
        let tree: Tree = "(A:0.1,(B:0.2,C:0.3):0.4,D:0.5);".parse().unwrap();
        let root = &tree.nodes[tree.root];
        assert!(root.parent.is_none());
        assert_eq!(root.branch_length, 0.0);
        assert_eq!(root.children.len(), 3);
        // the old trifurcating root now hangs below with the folded length
        let folded = root
            .children
            .iter()
            .find(|&&c| !tree.nodes[c].is_tip())
            .copied()
            .unwrap();
        assert_relative_eq!(tree.nodes[folded].branch_length, 0.4);
    }

    #[test]
    fn test_malformed_inputs() {
        assert!("(A:0.5,B:0.5)".parse::<Tree>().is_err());
        assert!("(A:0.5,);".parse::<Tree>().is_err());
        assert!("((A:0.5,B:0.5);".parse::<Tree>().is_err());
        assert!("(A:0.5,B:0.5);tail".parse::<Tree>().is_err());
        assert!("(A:-0.5,B:0.5);".parse::<Tree>().is_err());
    }
}
