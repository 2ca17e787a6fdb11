use super::*;

use crate::gamma;
use crate::internal;
use crate::utils;

//-----------------------------------------------------------------------------

fn two_leaf_tree() -> PhyloTree {
    let ntree = NewickNode::parse("(t1:0.1,t2:0.1)root;").unwrap();
    let mut tree = PhyloTree::from_newick(&ntree);
    let msa = Msa::new("pair", &[("t1", "A"), ("t2", "A")]).unwrap();
    tree.load_msa(&msa).unwrap();
    tree.set_model(internal::uniform_f81());
    tree
}

fn evaluate_all_directions(tree: &mut PhyloTree) {
    let old_root = tree.root();
    for id in 0..tree.num_nodes() {
        tree.set_root(id);
        tree.evaluate();
    }
    tree.set_root(old_root);
    tree.evaluate();
}

//-----------------------------------------------------------------------------

#[test]
fn topology_from_newick() {
    let tree = internal::three_taxon_tree();
    assert_eq!(tree.num_nodes(), 5);
    assert_eq!(tree.num_edges(), 4);
    assert_eq!(tree.num_leaves(), 3);

    let root = tree.root();
    assert_eq!(tree.node(root).name(), "root");
    assert_eq!(tree.parent(root), None);

    let n1 = internal::node_id(&tree, "n1");
    let t1 = internal::node_id(&tree, "t1");
    let t3 = internal::node_id(&tree, "t3");
    assert_eq!(tree.children(root), vec![n1, t3]);
    assert!(tree.is_parent(n1, t1));
    assert!((tree.branch_length(t1, n1) - 0.1).abs() < 1e-12);
    assert!((tree.branch_length(n1, root) - 0.05).abs() < 1e-12);
    assert!(tree.node(t1).is_leaf());
    assert!(!tree.node(n1).is_leaf());
    assert_eq!(tree.leaves().len(), 3);
}

#[test]
fn msa_binding() {
    let tree = internal::three_taxon_tree();
    assert_eq!(tree.cs_len(), 4);
    let t2 = internal::node_id(&tree, "t2");
    assert_eq!(tree.node(t2).seq().to_string(), "AAAC");
    assert_eq!(tree.node_for_msa_row(1), Some(t2));
    assert_eq!(tree.node_for_msa_row(7), None);

    // Internal nodes have no bound sequence.
    let n1 = internal::node_id(&tree, "n1");
    assert!(tree.node(n1).seq().is_empty());
}

#[test]
fn msa_binding_rejects_duplicate_names() {
    let ntree = NewickNode::parse("(t1:0.1,t2:0.2)root;").unwrap();
    let mut tree = PhyloTree::from_newick(&ntree);
    let msa = Msa::new("dup", &[("t1", "AC"), ("t1", "AG")]).unwrap();
    assert!(tree.load_msa(&msa).is_err(), "Duplicate names should be rejected");
}

#[test]
fn rerooting_rewrites_parents() {
    let mut tree = internal::three_taxon_tree();
    let root = tree.root();
    let (n1, t1) = (internal::node_id(&tree, "n1"), internal::node_id(&tree, "t1"));

    let old_root = tree.set_root(t1);
    assert_eq!(old_root, root);
    assert_eq!(tree.root(), t1);
    assert_eq!(tree.parent(t1), None);
    assert_eq!(tree.parent(n1), Some(t1));
    assert_eq!(tree.parent(root), Some(n1));
    assert_eq!(tree.children(t1), vec![n1]);

    // Setting the same root again is a no-op.
    assert_eq!(tree.set_root(t1), t1);
}

//-----------------------------------------------------------------------------

#[test]
fn scaled_kernels_match_naive() {
    let pi = [0.1, 0.2, 0.3, 0.4];
    let x: [f64; 4] = [-1.0, -2.5, -0.5, -4.0];
    let naive = (0..4).map(|i| pi[i] * x[i].exp()).sum::<f64>().ln();
    assert!((dot_product_scaled(&pi, &x) - naive).abs() < 1e-12);

    // Gap columns with log pi entries stay finite.
    let logs = [0.25f64.ln(); 4];
    assert!(dot_product_scaled(&pi, &logs).is_finite());

    // Impossible states underflow to negative infinity without NaN.
    let impossible = [f64::NEG_INFINITY; 4];
    assert_eq!(dot_product_scaled(&pi, &impossible), f64::NEG_INFINITY);

    let p = internal::uniform_f81().pr(0.3);
    let result = matrix_dot_scaled(&p, &x);
    for i in 0..4 {
        let naive = (0..4).map(|j| p[i][j] * x[j].exp()).sum::<f64>().ln();
        assert!((result[i] - naive).abs() < 1e-12, "Row {} is {}", i, result[i]);
    }

    let columns = [[-1.0, -2.0, -3.0, -4.0], [-2.0, -1.0, -4.0, -3.0]];
    let mixed = row_mean_exp_scaled(&columns);
    for i in 0..4 {
        let naive = (0.5 * (columns[0][i].exp() + columns[1][i].exp())).ln();
        assert!((mixed[i] - naive).abs() < 1e-12);
    }
}

#[test]
fn two_leaf_likelihood_matches_closed_form() {
    let mut tree = two_leaf_tree();
    let pr = tree.model().pr(0.1);
    let expected: f64 = (0..4).map(|s| 0.25 * pr[s][0] * pr[s][0]).sum::<f64>().ln();
    let loglik = tree.tree_loglik();
    assert!(
        (loglik - expected).abs() < 1e-12,
        "Engine gives {}, closed form gives {}", loglik, expected
    );
}

#[test]
fn identical_sequences_optimize_to_zero_length() {
    let mut tree = two_leaf_tree();
    let root = tree.root();
    let t1 = internal::node_id(&tree, "t1");
    tree.evaluate();
    tree.set_root(t1);
    tree.evaluate();

    let w = tree.optimize_branch_length(root, t1, 0, 0);
    assert!(w <= BRANCH_EPS, "Optimized length is {}", w);
    assert!((tree.branch_length(root, t1) - w).abs() < 1e-12);
}

#[test]
fn tree_loglik_is_root_invariant() {
    let mut tree = internal::three_taxon_tree();
    tree.evaluate();
    let reference = tree.tree_loglik();
    assert!(reference.is_finite() && reference < 0.0);

    for id in 0..tree.num_nodes() {
        tree.set_root(id);
        tree.evaluate();
        let loglik = tree.tree_loglik();
        assert!(
            (loglik - reference).abs() < 1e-9,
            "Loglik at root {} is {}, expected {}", id, loglik, reference
        );
    }
}

#[test]
fn windowed_loglik_sums_to_total() {
    let mut tree = internal::three_taxon_tree();
    let total = tree.tree_loglik();
    let first = tree.tree_loglik_window(0, 1);
    let second = tree.tree_loglik_window(2, 3);
    assert!((first + second - total).abs() < 1e-10);
}

#[test]
fn gap_columns_contribute_stationary_probability() {
    let ntree = NewickNode::parse("(t1:0.1,t2:0.2)root;").unwrap();
    let mut tree = PhyloTree::from_newick(&ntree);
    let msa = Msa::new("gappy", &[("t1", "AC"), ("t2", "A-")]).unwrap();
    tree.load_msa(&msa).unwrap();
    tree.set_model(internal::uniform_f81());

    let loglik = tree.tree_loglik();
    assert!(loglik.is_finite());

    // The gap leaf contributes its stationary weight, so the site
    // reduces to sum_s pi_s^2 P(C | s, 0.1) = 1/16 under a uniform pi
    // (the t2 term collapses to pi_s by stationarity).
    let pr = tree.model().pr(0.1);
    let expected_site1: f64 = (0..4).map(|s| 0.25 * 0.25 * pr[s][1]).sum();
    let site1 = tree.tree_loglik_window(1, 1);
    assert!(
        (site1 - expected_site1.ln()).abs() < 1e-10,
        "Gap column likelihood is {}", site1
    );
}

#[test]
fn discrete_gamma_star_tree_matches_mixture() {
    let ntree = NewickNode::parse("(t1:0.1,t2:0.2,t3:0.3)root;").unwrap();
    let mut tree = PhyloTree::from_newick(&ntree);
    tree.load_msa(&internal::three_taxon_msa()).unwrap();
    tree.set_model(internal::uniform_f81());
    let plain = tree.tree_loglik();

    let dg = gamma::DiscreteGamma::new(4, 0.5).unwrap();
    let rates = dg.rates().to_vec();
    tree.set_rate_model(dg);
    let mixed = tree.tree_loglik();
    assert!(mixed.is_finite());
    assert!((mixed - plain).abs() > 1e-6, "Rate mixing should change the likelihood");

    // On a star tree the per-node mixing is the exact mixture.
    let msa = internal::three_taxon_msa();
    let lengths = [0.1, 0.2, 0.3];
    let model = internal::uniform_f81();
    let mut expected = 0.0;
    for j in 0..msa.cs_len() {
        let mut site = 0.0;
        for &rate in rates.iter() {
            for s in 0..4 {
                let mut product = 0.25;
                for (row, &length) in lengths.iter().enumerate() {
                    let pr = model.pr(length * rate);
                    let observed = msa.ds_at(row).get(j) as usize;
                    product *= pr[s][observed];
                }
                site += product / rates.len() as f64;
            }
        }
        expected += site.ln();
    }
    assert!(
        (mixed - expected).abs() < 1e-10,
        "Engine gives {}, manual mixture gives {}", mixed, expected
    );
}

//-----------------------------------------------------------------------------

#[test]
fn caches_survive_unrelated_changes() {
    let mut tree = internal::three_taxon_tree();
    let root = tree.root();
    let (n1, t1) = (internal::node_id(&tree, "n1"), internal::node_id(&tree, "t1"));
    tree.evaluate();
    let baseline = tree.tree_loglik();
    assert!(tree.is_evaluated(t1, n1));
    assert!(tree.is_evaluated(n1, root));

    // Changing a branch length does not touch the caches; the direction
    // below the edge remains valid, the direction above must be reset
    // explicitly.
    tree.set_branch_length(t1, n1, 0.4);
    assert!(tree.is_evaluated(t1, n1), "The subtree below the edge is unaffected");
    assert!((tree.tree_loglik() - baseline).abs() < 1e-12, "Stale caches reproduce the old value");

    tree.reset_loglik(n1, root);
    assert!(!tree.is_evaluated(n1, root));
    let updated = tree.tree_loglik();
    assert!((updated - baseline).abs() > 1e-9, "The new length should change the likelihood");

    // Re-evaluation after the targeted reset matches a full rebuild.
    let mut rebuilt = tree.clone();
    rebuilt.reset_all_loglik();
    assert!((rebuilt.tree_loglik() - updated).abs() < 1e-9);
}

#[test]
fn set_model_invalidates_caches() {
    let mut tree = internal::three_taxon_tree();
    let root = tree.root();
    let n1 = internal::node_id(&tree, "n1");
    tree.evaluate();
    assert!(tree.is_evaluated(n1, root));
    tree.set_model(internal::uniform_f81());
    assert!(!tree.is_evaluated(n1, root));
}

//-----------------------------------------------------------------------------

#[test]
fn ancestral_states() {
    let mut tree = internal::three_taxon_tree();
    let (t1, n1) = (internal::node_id(&tree, "t1"), internal::node_id(&tree, "n1"));
    let root = tree.root();

    // Leaves report their observed states, including the raw codes.
    assert_eq!(tree.infer_state(t1, 0), 0);
    assert_eq!(tree.infer_state(t1, 3), 0);

    // All three leaves agree at the first site.
    assert_eq!(tree.infer_state(n1, 0), 0);
    assert_eq!(tree.infer_state(root, 0), 0);

    // At the last site t1 carries A, t2 and t3 carry C.
    assert_eq!(tree.infer_state(n1, 3), 0, "The short branch to t1 dominates");
}

#[test]
fn mutation_counts_per_site() {
    let mut tree = internal::three_taxon_tree();
    assert_eq!(tree.estimate_num_mutations(0), 0, "A conserved site has no changes");
    assert!(tree.estimate_num_mutations(3) >= 1, "A variable site has changes");

    // The per-site counts feed the shape estimator.
    let sample: Vec<f64> = (0..tree.cs_len()).map(|j| tree.estimate_num_mutations(j) as f64).collect();
    let alpha = gamma::estimate_shape(&sample, "moment");
    assert!(alpha > 0.0);
}

//-----------------------------------------------------------------------------

#[test]
fn placement_prefers_the_nearest_edge() {
    let base = internal::three_taxon_tree();
    let query = DigitalSeq::from_aligned("query", b"AAAA").unwrap();
    let (t1, n1) = (internal::node_id(&base, "t1"), internal::node_id(&base, "n1"));
    let (t3, root) = (internal::node_id(&base, "t3"), base.root());

    let mut near = base.clone();
    let near_loglik = near.place_seq(&query, t1, n1, 0, 3).unwrap();
    let mut far = base.clone();
    let far_loglik = far.place_seq(&query, t3, root, 0, 3).unwrap();
    assert!(
        near_loglik > far_loglik,
        "Placement next to an identical leaf should win: {} vs {}", near_loglik, far_loglik
    );
}

#[test]
fn placement_grows_the_tree_consistently() {
    let base = internal::three_taxon_tree();
    let query = DigitalSeq::from_aligned("query", b"AAAA").unwrap();
    let (t1, n1) = (internal::node_id(&base, "t1"), internal::node_id(&base, "n1"));
    let w0 = base.branch_length(t1, n1);

    let mut tree = base.clone();
    let r = base.num_nodes();
    let n = r + 1;
    tree.place_seq(&query, t1, n1, 0, 3).unwrap();

    assert_eq!(tree.num_nodes(), base.num_nodes() + 2);
    assert_eq!(tree.num_edges(), base.num_edges() + 2, "One edge removed, three added");
    assert_eq!(tree.root(), r, "Placement leaves the tree rooted at the splice point");
    assert_eq!(tree.node(n).seq().to_string(), "AAAA");
    assert!(tree.node(n).is_leaf());

    // Every directed edge incident to the new nodes is evaluated.
    for (a, b) in [(t1, r), (r, t1), (n1, r), (r, n1), (n, r), (r, n)] {
        assert!(tree.is_evaluated(a, b), "Edge ({}, {}) is not evaluated", a, b);
    }

    // The split halves preserve the original branch length, and the
    // pendant branch to an identical sequence stays short.
    let split = tree.branch_length(t1, r) + tree.branch_length(n1, r);
    assert!((split - w0).abs() < 1e-9, "Split lengths sum to {}", split);
    assert!(tree.branch_length(n, r) <= 0.1, "Pendant length is {}", tree.branch_length(n, r));
}

#[test]
fn placement_rejects_bad_input() {
    let base = internal::three_taxon_tree();
    let (t1, n1) = (internal::node_id(&base, "t1"), internal::node_id(&base, "n1"));

    let mut tree = base.clone();
    let short = DigitalSeq::from_aligned("short", b"AA").unwrap();
    assert!(tree.place_seq(&short, t1, n1, 0, 1).is_err(), "Length mismatch should fail");

    let query = DigitalSeq::from_aligned("query", b"AAAA").unwrap();
    assert!(
        tree.place_seq(&query, n1, t1, 0, 3).is_err(),
        "The direction must match the current parent relation"
    );
}

#[test]
fn estimate_seq_screens_edges() {
    let mut tree = internal::three_taxon_tree();
    evaluate_all_directions(&mut tree);
    let query = DigitalSeq::from_aligned("query", b"AAAA").unwrap();
    let (t1, n1) = (internal::node_id(&tree, "t1"), internal::node_id(&tree, "n1"));
    let (t3, root) = (internal::node_id(&tree, "t3"), tree.root());

    let near = tree.estimate_seq(&query, t1, n1, 0, 3);
    let far = tree.estimate_seq(&query, t3, root, 0, 3);
    assert!(near > far, "Midpoint scoring should prefer the near edge: {} vs {}", near, far);
}

#[test]
fn copied_subtree_keeps_the_branch() {
    let mut tree = internal::three_taxon_tree();
    evaluate_all_directions(&mut tree);
    let (t1, n1) = (internal::node_id(&tree, "t1"), internal::node_id(&tree, "n1"));

    let copy = tree.copy_subtree(t1, n1);
    assert_eq!(copy.num_nodes(), 2);
    assert_eq!(copy.num_edges(), 1);
    assert_eq!(copy.node(0).name(), "n1");
    assert_eq!(copy.node(1).name(), "t1");
    assert_eq!(copy.root(), 0);
    assert!((copy.branch_length(0, 1) - tree.branch_length(t1, n1)).abs() < 1e-12);
    assert!(copy.is_evaluated(1, 0), "The upward cache should be copied");
    assert_eq!(copy.node(1).seq().to_string(), "AAAA");
}

#[test]
fn leaf_hit_filters() {
    let tree = internal::three_taxon_tree();
    let query = DigitalSeq::from_aligned("query", b"AAAA").unwrap();
    let (t1, t2, t3) = (
        internal::node_id(&tree, "t1"),
        internal::node_id(&tree, "t2"),
        internal::node_id(&tree, "t3"),
    );

    // p-distances to the query: t1 = 0, t2 = 0.25, t3 = 0.5.
    let hits = tree.leaf_hits_by_pdist(&[], &query, 0.3, 0, 3);
    assert_eq!(hits, vec![t1, t2]);
    let hits = tree.leaf_hits_by_pdist(&[], &query, 0.0, 0, 3);
    assert_eq!(hits, vec![t1]);
    let hits = tree.leaf_hits_by_pdist(&[t2, t3], &query, 0.3, 0, 3);
    assert_eq!(hits, vec![t2], "An explicit candidate list restricts the search");

    // The corrected distance is larger than the p-distance.
    let hits = tree.leaf_hits_by_sub_dist(&[], &query, 0.5, 0, 3);
    assert_eq!(hits, vec![t1, t2]);
}

//-----------------------------------------------------------------------------

#[test]
fn annotation_collects_canonical_ancestors() {
    let text = "((((t1:0.1)s1:0.1)p1:0.2)k1:0.3)base;";
    let mut tree = PhyloTree::from_newick(&NewickNode::parse(text).unwrap());
    let annotation = "s1\ts__foo\np1\tp__Firmicutes\nk1\tk__Bacteria\n";
    let renamed = tree.load_annotation(&mut annotation.as_bytes()).unwrap();
    assert_eq!(renamed, 3);

    tree.annotate();
    let t1 = internal::node_id(&tree, "t1");
    assert_eq!(tree.node(t1).anno(), "k__Bacteria;p__Firmicutes;s__foo");
    assert!((tree.node(t1).anno_dist() - 0.7).abs() < 1e-12);
}

#[test]
fn annotation_stops_at_full_canonical_names() {
    let full = "k__A;p__B;c__C;o__D;f__E;g__F;s__G";
    let text = "((t1:0.25)anc:0.5)'g__Above';";
    let mut tree = PhyloTree::from_newick(&NewickNode::parse(text).unwrap());
    let annotation = format!("anc\t{}\n", full);
    tree.load_annotation(&mut annotation.as_bytes()).unwrap();

    tree.annotate();
    let t1 = internal::node_id(&tree, "t1");
    assert_eq!(tree.node(t1).anno(), full, "The walk stops at the first full name");
    assert!((tree.node(t1).anno_dist() - 0.25).abs() < 1e-12);
}

#[test]
fn annotation_falls_back_to_other() {
    let text = "((t1:0.1)inner:0.2)top;";
    let mut tree = PhyloTree::from_newick(&NewickNode::parse(text).unwrap());
    tree.annotate();
    let t1 = internal::node_id(&tree, "t1");
    assert_eq!(tree.node(t1).anno(), "Other");
}

#[test]
fn canonical_name_predicates() {
    assert!(is_canonical_name("k__Bacteria"));
    assert!(is_canonical_name("s__foo"));
    assert!(!is_canonical_name("k__"), "An empty level is not canonical");
    assert!(!is_canonical_name("Bacteria"));

    assert!(is_full_canonical_name("k__A;p__B;c__C;o__D;f__E;g__F;s__G"));
    assert!(!is_full_canonical_name("k__A;p__B"), "All seven levels are required");
    assert!(!is_full_canonical_name("p__B;k__A;c__C;o__D;f__E;g__F;s__G"));

    assert!(is_partial_canonical_name("k__A;p__B"));
    assert!(is_partial_canonical_name("g__F"));
    assert!(!is_partial_canonical_name("unnamed"));
    assert!(!is_partial_canonical_name(""));
}

//-----------------------------------------------------------------------------

#[test]
fn newick_round_trip() {
    let tree = internal::three_taxon_tree();
    let text = tree.to_newick();
    assert_eq!(text, "((t1:0.1,t2:0.2)n1:0.05,t3:0.3)root;");

    let reparsed = PhyloTree::from_newick(&NewickNode::parse(&text).unwrap());
    assert_eq!(reparsed.num_nodes(), tree.num_nodes());
    assert_eq!(reparsed.to_newick(), text);
}

#[test]
fn newick_output_quotes_names() {
    let ntree = NewickNode::parse("(t1:0.1,t2:0.2)root;").unwrap();
    let mut tree = PhyloTree::from_newick(&ntree);
    tree.load_annotation(&mut "t1\tk__Bacteria;s__x\n".as_bytes()).unwrap();
    let text = tree.to_newick();
    assert_eq!(text, "('k__Bacteria;s__x':0.1,t2:0.2)root;");
}

//-----------------------------------------------------------------------------

#[test]
fn save_and_load_round_trip() {
    let mut tree = internal::three_taxon_tree();
    tree.set_rate_model(gamma::DiscreteGamma::new(4, 0.5).unwrap());
    tree.annotate();
    tree.evaluate();
    let loglik = tree.tree_loglik();

    let filename = utils::temp_file_name("phylotree");
    tree.save(&filename).unwrap();
    let mut loaded = PhyloTree::load(&filename).unwrap();
    std::fs::remove_file(&filename).ok();

    assert_eq!(loaded, tree, "The loaded tree should be identical");
    assert!((loaded.tree_loglik() - loglik).abs() < 1e-12);

    // The loaded tree keeps working: placement still runs.
    let query = DigitalSeq::from_aligned("query", b"AAAA").unwrap();
    let t1 = internal::node_id(&loaded, "t1");
    let n1 = internal::node_id(&loaded, "n1");
    assert!(loaded.place_seq(&query, t1, n1, 0, 3).is_ok());
}

#[test]
fn load_rejects_bad_header() {
    let tree = internal::three_taxon_tree();
    let mut blob: Vec<u8> = Vec::new();
    tree.save_to(&mut blob).unwrap();

    let mut corrupted = blob.clone();
    corrupted[0] ^= 0xFF;
    assert!(PhyloTree::load_from(&mut corrupted.as_slice()).is_err());

    let mut newer = blob.clone();
    newer[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
    assert!(PhyloTree::load_from(&mut newer.as_slice()).is_err());

    let truncated = &blob[..blob.len() / 2];
    assert!(PhyloTree::load_from(&mut &truncated[..]).is_err());
}

//-----------------------------------------------------------------------------
