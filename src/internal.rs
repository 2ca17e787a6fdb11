// Shared fixtures for the test modules.

use crate::model::{F81, SubModel};
use crate::msa::Msa;
use crate::newick::NewickNode;
use crate::tree::PhyloTree;

//-----------------------------------------------------------------------------

pub(crate) fn uniform_f81() -> SubModel {
    SubModel::F81(F81::new([0.25; 4]).unwrap())
}

pub(crate) fn three_taxon_msa() -> Msa {
    let msa = Msa::new("three-taxon", &[("t1", "AAAA"), ("t2", "AAAC"), ("t3", "AACC")]);
    assert!(msa.is_ok(), "Failed to build the fixture alignment: {}", msa.unwrap_err());
    msa.unwrap()
}

// Three taxa under a uniform F81 model, bound to the fixture alignment.
pub(crate) fn three_taxon_tree() -> PhyloTree {
    let ntree = NewickNode::parse("((t1:0.1,t2:0.2)n1:0.05,t3:0.3)root;");
    assert!(ntree.is_ok(), "Failed to parse the fixture tree: {}", ntree.unwrap_err());
    let mut tree = PhyloTree::from_newick(&ntree.unwrap());
    let bound = tree.load_msa(&three_taxon_msa());
    assert!(bound.is_ok(), "Failed to bind the fixture alignment: {}", bound.unwrap_err());
    assert_eq!(bound.unwrap(), 3, "All three leaves should bind");
    tree.set_model(uniform_f81());
    tree
}

pub(crate) fn node_id(tree: &PhyloTree, name: &str) -> usize {
    match tree.find_node(name) {
        Some(id) => id,
        None => panic!("Fixture tree has no node named {}", name),
    }
}

//-----------------------------------------------------------------------------
