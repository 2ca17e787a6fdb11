//! The unrooted phylogenetic tree and its likelihood engine.
//!
//! The tree is an arena of nodes indexed by id, with undirected adjacency
//! lists and a distinguished root that imposes a directed view through
//! parent pointers. Re-rooting rewrites the parent pointers with a full
//! DFS and leaves the per-edge caches untouched: every directed edge
//! `(u, v)` carries a branch record with the shared branch length and an
//! optional conditional log-likelihood matrix for the subtree under `u`
//! when `v` is its parent.
//!
//! Likelihoods are computed with Felsenstein pruning in scaled log space,
//! optionally mixed over discrete-Gamma rate categories. On top of the
//! pruning kernel sit Felsenstein's iterative branch-length optimizer,
//! the joint three-way optimizer used during placement, and
//! [`PhyloTree::place_seq`], which splices a new leaf onto an existing
//! edge.
//!
//! The tree is single-threaded: placement, optimization, and re-rooting
//! all mutate the shared caches. Replicate the tree per worker for
//! parallel placement.

use crate::alphabet::DigitalSeq;
use crate::gamma::DiscreteGamma;
use crate::model::{self, Matrix4, SubModel, Vector4};
use crate::msa::Msa;
use crate::newick::{self, NewickNode};

use serde::{Deserialize, Serialize};

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

#[cfg(test)]
mod tests;

//-----------------------------------------------------------------------------

/// Convergence threshold for branch-length optimization.
pub const BRANCH_EPS: f64 = 1e-5;

// Lower clamp for the shift used in scaled log-space sums; half of the
// smallest normal exponent keeps products of two clamped terms normal.
const MIN_LOGLIK_EXP: f64 = (f64::MIN_EXP as f64) / 2.0;

// "PPLTREE" + format byte.
const MAGIC: u64 = 0x5050_4C54_5245_4501;
const FORMAT_VERSION: u32 = 1;

/// Identifier of a node in the tree arena.
pub type NodeId = usize;

// One conditional log-likelihood column per alignment site.
type LoglikMatrix = Vec<Vector4>;

//-----------------------------------------------------------------------------

/// A node of the phylogenetic tree.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    id: NodeId,
    name: String,
    seq: DigitalSeq,
    anno: String,
    anno_dist: f64,
    neighbors: Vec<NodeId>,
    parent: Option<NodeId>,
}

impl Node {
    fn new(id: NodeId, name: &str) -> Self {
        Node {
            id,
            name: String::from(name),
            seq: DigitalSeq::default(),
            anno: String::new(),
            anno_dist: 0.0,
            neighbors: Vec::new(),
            parent: None,
        }
    }

    /// Returns the id of the node.
    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Returns the name of the node.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the aligned sequence bound to the node; empty if unbound.
    pub fn seq(&self) -> &DigitalSeq {
        &self.seq
    }

    /// Returns the taxonomic annotation of the node.
    pub fn anno(&self) -> &str {
        &self.anno
    }

    /// Returns the distance to the nearest annotated ancestor.
    #[inline]
    pub fn anno_dist(&self) -> f64 {
        self.anno_dist
    }

    /// Returns `true` if the node has exactly one neighbor.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.neighbors.len() == 1
    }
}

// A directed branch record: the length is shared by both directions, the
// cache is the conditional log-likelihood of the subtree under the source
// node when the target node is its parent.
#[derive(Clone, Debug, PartialEq)]
struct Branch {
    length: f64,
    loglik: Option<LoglikMatrix>,
}

impl Branch {
    fn new(length: f64) -> Self {
        Branch { length, loglik: None }
    }
}

//-----------------------------------------------------------------------------

/// An unrooted phylogenetic tree with cached per-edge conditional
/// likelihoods.
#[derive(Clone, Debug, PartialEq)]
pub struct PhyloTree {
    nodes: Vec<Node>,
    branches: HashMap<(NodeId, NodeId), Branch>,
    root: NodeId,
    cs_len: usize,
    // Likelihood contributions of the five observable leaf states
    // (A, C, G, T, gap), one column per state.
    leaf_loglik: Option<[Vector4; 5]>,
    msa_index: BTreeMap<usize, NodeId>,
    model: Option<SubModel>,
    dg: Option<DiscreteGamma>,
}

//-----------------------------------------------------------------------------

/// Construction and topology.
impl PhyloTree {
    /// Builds a tree from a parsed Newick tree.
    ///
    /// Node ids are assigned in discovery order starting from the Newick
    /// root, which becomes the root of the directed view.
    pub fn from_newick(ntree: &NewickNode) -> Self {
        let mut tree = PhyloTree {
            nodes: Vec::new(),
            branches: HashMap::new(),
            root: 0,
            cs_len: 0,
            leaf_loglik: None,
            msa_index: BTreeMap::new(),
            model: None,
            dg: None,
        };

        let mut stack: Vec<(&NewickNode, Option<NodeId>)> = vec![(ntree, None)];
        while let Some((nnode, parent)) = stack.pop() {
            let id = tree.nodes.len();
            let mut node = Node::new(id, &nnode.name);
            node.parent = parent;
            tree.nodes.push(node);
            if let Some(parent) = parent {
                tree.nodes[parent].neighbors.push(id);
                tree.nodes[id].neighbors.push(parent);
                tree.branches.insert((parent, id), Branch::new(nnode.length));
                tree.branches.insert((id, parent), Branch::new(nnode.length));
            }
            for child in nnode.children.iter().rev() {
                stack.push((child, Some(id)));
            }
        }
        tree
    }

    /// Returns the number of nodes.
    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the number of undirected edges.
    #[inline]
    pub fn num_edges(&self) -> usize {
        self.branches.len() / 2
    }

    /// Returns the number of leaves.
    pub fn num_leaves(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_leaf()).count()
    }

    /// Returns the consensus length of the bound alignment.
    #[inline]
    pub fn cs_len(&self) -> usize {
        self.cs_len
    }

    /// Returns the current root.
    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Returns the node with the given id.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Returns the parent of the node in the current directed view.
    #[inline]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    /// Returns `true` if `parent` is the parent of `node`.
    #[inline]
    pub fn is_parent(&self, parent: NodeId, node: NodeId) -> bool {
        self.nodes[node].parent == Some(parent)
    }

    /// Returns the children of the node in the current directed view.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes[id].neighbors.iter().copied()
            .filter(|&v| self.nodes[v].parent == Some(id))
            .collect()
    }

    /// Returns the node bound to the given MSA row.
    pub fn node_for_msa_row(&self, row: usize) -> Option<NodeId> {
        self.msa_index.get(&row).copied()
    }

    /// Returns the first node with the given name.
    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|node| node.name == name)
    }

    /// Returns the leaf nodes of the tree.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.nodes.iter().filter(|node| node.is_leaf()).map(|node| node.id).collect()
    }
}

//-----------------------------------------------------------------------------

/// Binding reference data to the tree.
impl PhyloTree {
    /// Binds MSA rows to the tree nodes with matching names and records
    /// the row-to-node index.
    ///
    /// Returns the number of newly bound nodes. Non-unique sequence names
    /// in the MSA are a hard error. Nodes whose name does not occur in
    /// the MSA are skipped.
    pub fn load_msa(&mut self, msa: &Msa) -> Result<usize, String> {
        let mut name_to_row: HashMap<&str, usize> = HashMap::with_capacity(msa.num_seq());
        for row in 0..msa.num_seq() {
            let name = msa.seq_name_at(row);
            if name_to_row.insert(name, row).is_some() {
                return Err(format!(
                    "Non-unique sequence name {} in the alignment {}", name, msa.name()
                ));
            }
        }

        self.cs_len = msa.cs_len();
        let before = self.msa_index.len();
        for id in 0..self.nodes.len() {
            if let Some(&row) = name_to_row.get(self.nodes[id].name.as_str()) {
                self.nodes[id].seq = msa.ds_at(row).clone();
                self.msa_index.insert(row, id);
            }
        }
        Ok(self.msa_index.len() - before)
    }

    /// Reads `name<TAB>annotation` lines and replaces the names of the
    /// matching nodes with their annotation strings.
    ///
    /// Returns the number of renamed nodes.
    pub fn load_annotation<R: BufRead>(&mut self, reader: &mut R) -> Result<usize, String> {
        let mut name_to_anno: HashMap<String, String> = HashMap::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line.map_err(|err| {
                format!("Failed to read annotation line {}: {}", number + 1, err)
            })?;
            if line.is_empty() {
                continue;
            }
            let (name, anno) = line.split_once(ANNO_FIELD_SEP).ok_or_else(|| {
                format!("Invalid annotation line {}: {}", number + 1, line)
            })?;
            name_to_anno.insert(String::from(name), String::from(anno));
        }

        let mut renamed = 0;
        for node in self.nodes.iter_mut() {
            if let Some(anno) = name_to_anno.get(&node.name) {
                node.name = anno.clone();
                renamed += 1;
            }
        }
        Ok(renamed)
    }

    /// Attaches the substitution model, rebuilding the leaf likelihood
    /// table and invalidating every cache.
    pub fn set_model(&mut self, model: SubModel) {
        let pi = model.pi();
        let mut table = [[f64::NEG_INFINITY; 4]; 5];
        for state in 0..4 {
            table[state][state] = 0.0;
        }
        for state in 0..4 {
            table[4][state] = pi[state].ln();
        }
        self.leaf_loglik = Some(table);
        self.model = Some(model);
        self.reset_all_loglik();
    }

    /// Attaches a discrete-Gamma rate model, invalidating every cache.
    pub fn set_rate_model(&mut self, dg: DiscreteGamma) {
        self.dg = Some(dg);
        self.reset_all_loglik();
    }

    /// Returns the attached substitution model.
    ///
    /// # Panics
    ///
    /// Panics if no model has been attached; attaching one is a
    /// precondition of every likelihood operation.
    pub fn model(&self) -> &SubModel {
        match &self.model {
            Some(model) => model,
            None => panic!("No substitution model attached to the tree"),
        }
    }

    /// Returns the attached rate model, if any.
    pub fn rate_model(&self) -> Option<&DiscreteGamma> {
        self.dg.as_ref()
    }
}

//-----------------------------------------------------------------------------

/// Rooting.
impl PhyloTree {
    /// Makes the given node the root, rewriting all parent pointers with
    /// a DFS. Per-edge caches are unaffected.
    ///
    /// Returns the previous root.
    pub fn set_root(&mut self, new_root: NodeId) -> NodeId {
        let old_root = self.root;
        if new_root == old_root {
            return old_root;
        }
        self.nodes[new_root].parent = None;
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![new_root];
        visited[new_root] = true;
        while let Some(u) = stack.pop() {
            for i in 0..self.nodes[u].neighbors.len() {
                let v = self.nodes[u].neighbors[i];
                if !visited[v] {
                    visited[v] = true;
                    self.nodes[v].parent = Some(u);
                    stack.push(v);
                }
            }
        }
        self.root = new_root;
        old_root
    }
}

//-----------------------------------------------------------------------------

/// Branch lengths and per-edge caches.
impl PhyloTree {
    /// Returns the length of the branch between two adjacent nodes.
    ///
    /// # Panics
    ///
    /// Panics if the nodes are not adjacent.
    #[inline]
    pub fn branch_length(&self, u: NodeId, v: NodeId) -> f64 {
        self.branches[&(u, v)].length
    }

    /// Sets the length of the branch between two adjacent nodes, in both
    /// directional records. Caches are not invalidated; invalidation is
    /// explicit through [`PhyloTree::reset_loglik`].
    pub fn set_branch_length(&mut self, u: NodeId, v: NodeId, length: f64) {
        for key in [(u, v), (v, u)] {
            match self.branches.get_mut(&key) {
                Some(branch) => branch.length = length,
                None => panic!("No edge between nodes {} and {}", u, v),
            }
        }
    }

    /// Returns `true` if the conditional likelihood of the directed edge
    /// `(u, v)` is cached.
    #[inline]
    pub fn is_evaluated(&self, u: NodeId, v: NodeId) -> bool {
        self.branches.get(&(u, v)).map_or(false, |branch| branch.loglik.is_some())
    }

    /// Invalidates the cache of the directed edge `(u, v)`.
    pub fn reset_loglik(&mut self, u: NodeId, v: NodeId) {
        if let Some(branch) = self.branches.get_mut(&(u, v)) {
            branch.loglik = None;
        }
    }

    /// Invalidates every cache in the tree.
    pub fn reset_all_loglik(&mut self) {
        for branch in self.branches.values_mut() {
            branch.loglik = None;
        }
    }

    // Returns the cached matrix of the directed edge, which must be
    // evaluated.
    fn branch_loglik(&self, u: NodeId, v: NodeId) -> &LoglikMatrix {
        match self.branches[&(u, v)].loglik.as_ref() {
            Some(matrix) => matrix,
            None => panic!("The conditional likelihood of edge ({}, {}) is not evaluated", u, v),
        }
    }
}

//-----------------------------------------------------------------------------

// Scaled log-space kernels. All likelihood combinations stay in log
// space; sums of exponentials are shifted by the maximum term, with the
// shift clamped from below to avoid underflow cascades on all-gap
// columns.

// log(sum_i pi_i * exp(x_i)).
fn dot_product_scaled(pi: &Vector4, x: &Vector4) -> f64 {
    let mut scale = f64::NEG_INFINITY;
    for &value in x.iter() {
        scale = scale.max(value);
    }
    let scale = scale.max(MIN_LOGLIK_EXP);
    let mut sum = 0.0;
    for i in 0..4 {
        sum += pi[i] * (x[i] - scale).exp();
    }
    scale + sum.ln()
}

// Per target state i: log(sum_j P_ij * exp(x_j)).
fn matrix_dot_scaled(p: &Matrix4, x: &Vector4) -> Vector4 {
    let mut scale = f64::NEG_INFINITY;
    for &value in x.iter() {
        scale = scale.max(value);
    }
    let scale = scale.max(MIN_LOGLIK_EXP);
    let mut shifted = [0.0; 4];
    for j in 0..4 {
        shifted[j] = (x[j] - scale).exp();
    }
    let mut result = [0.0; 4];
    for i in 0..4 {
        let mut sum = 0.0;
        for j in 0..4 {
            sum += p[i][j] * shifted[j];
        }
        result[i] = scale + sum.ln();
    }
    result
}

// Per row i: log of the mean of exp over the rate-category columns.
fn row_mean_exp_scaled(columns: &[Vector4]) -> Vector4 {
    let mut result = [0.0; 4];
    for (i, value) in result.iter_mut().enumerate() {
        let mut scale = f64::NEG_INFINITY;
        for column in columns.iter() {
            scale = scale.max(column[i]);
        }
        let scale = scale.max(MIN_LOGLIK_EXP);
        let mut sum = 0.0;
        for column in columns.iter() {
            sum += (column[i] - scale).exp();
        }
        *value = scale + (sum / columns.len() as f64).ln();
    }
    result
}

//-----------------------------------------------------------------------------

/// Likelihood evaluation.
impl PhyloTree {
    /// Evaluates every missing conditional likelihood below the current
    /// root, bottom-up. Subtrees with a valid cache are not revisited.
    pub fn evaluate(&mut self) {
        let mut stack = vec![(self.root, false)];
        while let Some((u, children_done)) = stack.pop() {
            if children_done {
                if let Some(parent) = self.nodes[u].parent {
                    if !self.is_evaluated(u, parent) {
                        let matrix = self.compute_node_loglik(u);
                        if let Some(branch) = self.branches.get_mut(&(u, parent)) {
                            branch.loglik = Some(matrix);
                        }
                    }
                }
            } else {
                stack.push((u, true));
                for child in self.children(u) {
                    if !self.is_evaluated(child, u) {
                        stack.push((child, false));
                    }
                }
            }
        }
    }

    // Combines the cached child matrices (and the leaf contribution)
    // into the conditional likelihood of `u` toward its current parent.
    // With K > 1 rate categories the per-rate results are mixed with
    // a scaled log-mean-exp per site.
    fn compute_node_loglik(&self, u: NodeId) -> LoglikMatrix {
        let model = self.model();
        let children = self.children(u);
        let rates: Vec<f64> = match &self.dg {
            Some(dg) => dg.rates().to_vec(),
            None => vec![1.0],
        };

        // Transition matrices per child and rate category.
        let transitions: Vec<Vec<Matrix4>> = children.iter().map(|&child| {
            let length = self.branch_length(u, child);
            rates.iter().map(|&rate| model.pr(length * rate)).collect()
        }).collect();

        let leaf_column = |j: usize| -> Option<&Vector4> {
            let node = &self.nodes[u];
            if node.is_leaf() && !node.seq.is_empty() {
                let table = match self.leaf_loglik.as_ref() {
                    Some(table) => table,
                    None => panic!("The leaf likelihood table is not initialized"),
                };
                let code = node.seq.get(j);
                let state = if code >= 0 { code as usize } else { 4 };
                Some(&table[state])
            } else {
                None
            }
        };

        let mut matrix = Vec::with_capacity(self.cs_len);
        let mut per_rate: Vec<Vector4> = vec![[0.0; 4]; rates.len()];
        for j in 0..self.cs_len {
            for (k, column) in per_rate.iter_mut().enumerate() {
                let mut value = [0.0; 4];
                for (child_idx, &child) in children.iter().enumerate() {
                    let child_loglik = &self.branch_loglik(child, u)[j];
                    let convolved = matrix_dot_scaled(&transitions[child_idx][k], child_loglik);
                    for s in 0..4 {
                        value[s] += convolved[s];
                    }
                }
                if let Some(leaf) = leaf_column(j) {
                    for s in 0..4 {
                        value[s] += leaf[s];
                    }
                }
                *column = value;
            }
            let column = if per_rate.len() == 1 {
                per_rate[0]
            } else {
                row_mean_exp_scaled(&per_rate)
            };
            matrix.push(column);
        }
        matrix
    }

    // The conditional likelihood matrix of the current root, computed
    // fresh from its children after making sure they are evaluated.
    fn root_loglik(&mut self) -> LoglikMatrix {
        self.evaluate();
        self.compute_node_loglik(self.root)
    }

    /// Returns the whole-tree log-likelihood at the current root.
    pub fn tree_loglik(&mut self) -> f64 {
        let end = self.cs_len - 1;
        self.tree_loglik_window(0, end)
    }

    /// Returns the tree log-likelihood restricted to the site window
    /// `[start, end]`.
    pub fn tree_loglik_window(&mut self, start: usize, end: usize) -> f64 {
        let matrix = self.root_loglik();
        let pi = self.model().pi();
        let mut loglik = 0.0;
        for column in matrix.iter().take(end + 1).skip(start) {
            loglik += dot_product_scaled(&pi, column);
        }
        loglik
    }

    /// Returns the most likely state of the node at the given site: the
    /// observed state for a leaf with a bound sequence, the argmax of the
    /// conditional likelihood otherwise.
    pub fn infer_state(&mut self, id: NodeId, j: usize) -> i8 {
        if !self.nodes[id].seq.is_empty() {
            return self.nodes[id].seq.get(j);
        }
        self.evaluate();
        let column = if id == self.root {
            self.compute_node_loglik(id)[j]
        } else {
            let parent = self.nodes[id].parent.unwrap_or(self.root);
            self.branch_loglik(id, parent)[j]
        };
        let mut best = 0;
        for state in 1..4 {
            if column[state] > column[best] {
                best = state;
            }
        }
        best as i8
    }

    /// Counts the branches whose endpoints have different inferred states
    /// at the given site, an input to shape estimation.
    pub fn estimate_num_mutations(&mut self, j: usize) -> usize {
        let mut changes = 0;
        for id in 0..self.nodes.len() {
            if let Some(parent) = self.nodes[id].parent {
                if self.infer_state(id, j) != self.infer_state(parent, j) {
                    changes += 1;
                }
            }
        }
        changes
    }
}

//-----------------------------------------------------------------------------

/// Branch-length optimization.
impl PhyloTree {
    /// Single-pass estimate of the branch length between `u` and its
    /// parent `v` over the site window: the mean posterior probability
    /// that the two subtrees differ at a site. Used to seed the
    /// iterative optimizer.
    ///
    /// Both directional caches of the edge must be evaluated. Sites where
    /// either term is NaN are skipped.
    pub fn estimate_branch_length(&self, u: NodeId, v: NodeId, start: usize, end: usize) -> f64 {
        debug_assert!(self.is_parent(v, u));
        // With a flat prior the posterior reduces to b / (a + b).
        self.substitution_posterior(u, v, start, end, 1.0, 1.0)
    }

    /// Optimizes the length of the branch between `u` and its parent `v`
    /// with Felsenstein's iterative algorithm, seeded by
    /// [`PhyloTree::estimate_branch_length`]. Returns the optimized
    /// length and stores it on the edge.
    pub fn optimize_branch_length(&mut self, u: NodeId, v: NodeId, start: usize, end: usize) -> f64 {
        debug_assert!(self.is_parent(v, u));
        let w0 = self.estimate_branch_length(u, v, start, end);
        let mut q0 = (-w0).exp();
        let mut p0 = 1.0 - q0;
        let mut p = p0;
        let mut q = q0;

        while (0.0..=1.0).contains(&p) {
            p = self.substitution_posterior(u, v, start, end, p0, q0);
            q = 1.0 - p;
            if (q.ln() - q0.ln()).abs() < BRANCH_EPS {
                break;
            }
            p0 = p;
            q0 = q;
        }

        let w = -q.ln();
        self.set_branch_length(u, v, w);
        w
    }

    /// The length-capped variant: starts from the current branch length,
    /// iterates on the raw no-substitution probability, and clamps the
    /// result to `max_length`.
    pub fn optimize_branch_length_capped(
        &mut self, u: NodeId, v: NodeId, max_length: f64, start: usize, end: usize,
    ) -> f64 {
        debug_assert!(self.is_parent(v, u));
        let w0 = self.branch_length(u, v);
        let mut q0 = (-w0).exp();
        let mut p0 = 1.0 - q0;
        let mut p = p0;
        let mut q = q0;

        while (0.0..=1.0).contains(&p) {
            p = self.substitution_posterior(u, v, start, end, p0, q0);
            q = 1.0 - p;
            if (q - q0).abs() < BRANCH_EPS {
                break;
            }
            p0 = p;
            q0 = q;
        }

        let mut w = -q.ln();
        if w > max_length {
            w = max_length;
        }
        self.set_branch_length(u, v, w);
        w
    }

    // One EM step: the mean posterior probability of substitution along
    // the edge, given the prior (p0, q0). NaN sites are skipped.
    fn substitution_posterior(
        &self, u: NodeId, v: NodeId, start: usize, end: usize, p0: f64, q0: f64,
    ) -> f64 {
        let pi = self.model().pi();
        let loglik_u = self.branch_loglik(u, v);
        let loglik_v = self.branch_loglik(v, u);
        let mut p = 0.0;
        let mut sites = 0;
        for j in start..=end {
            let mut combined = [0.0; 4];
            for s in 0..4 {
                combined[s] = loglik_u[j][s] + loglik_v[j][s];
            }
            let log_a = dot_product_scaled(&pi, &combined);
            let log_b = dot_product_scaled(&pi, &loglik_u[j])
                + dot_product_scaled(&pi, &loglik_v[j]);
            if log_a.is_nan() || log_b.is_nan() {
                continue;
            }
            let scale = log_a.max(log_b);
            let (a, b) = ((log_a - scale).exp(), (log_b - scale).exp());
            p += b * p0 / (a * q0 + b * p0);
            sites += 1;
        }
        p / sites as f64
    }

    /// Jointly optimizes the two branch lengths around the middle node
    /// `r`, holding their sum constant: `u` is a child of `r` and `v` is
    /// the parent of `r`. Returns the optimized fraction
    /// `w(u, r) / (w(u, r) + w(v, r))`.
    ///
    /// With `do_update`, every affected cache is refreshed after each
    /// half-step; otherwise only the cache the next half-step depends on
    /// is invalidated and re-evaluated.
    pub fn optimize_three_way(
        &mut self, u: NodeId, r: NodeId, v: NodeId, start: usize, end: usize, do_update: bool,
    ) -> f64 {
        debug_assert!(self.is_parent(r, u) && self.is_parent(v, r));
        let old_root = self.root;

        let mut wur0 = self.branch_length(u, r);
        let wvr0 = self.branch_length(v, r);
        let total = wur0 + wvr0;
        let mut wur = wur0;

        while (0.0..=total).contains(&wur) {
            self.set_root(r);
            wur = self.optimize_branch_length_capped(u, r, total, start, end);

            if do_update {
                self.reset_loglik(r, v);
                self.set_root(v);
                self.evaluate();
            }

            let wvr = total - wur;
            self.set_branch_length(v, r, wvr);

            self.set_root(r);
            self.reset_loglik(r, u);
            self.set_root(u);
            self.evaluate();

            if (wur - wur0).abs() < BRANCH_EPS {
                break;
            }
            wur0 = wur;
        }
        self.set_root(old_root);

        wur / total
    }
}

//-----------------------------------------------------------------------------

/// Sequence placement.
impl PhyloTree {
    /// Scores the placement of an aligned sequence at the midpoint of the
    /// edge between `u` and its parent `v` without mutating the tree.
    ///
    /// Both directional caches of the edge must be evaluated.
    pub fn estimate_seq(&self, seq: &DigitalSeq, u: NodeId, v: NodeId, start: usize, end: usize) -> f64 {
        debug_assert_eq!(seq.len(), self.cs_len);
        debug_assert!(self.is_parent(v, u));
        let model = self.model();
        let pi = model.pi();
        let half = model.pr(self.branch_length(u, v) / 2.0);
        let table = match self.leaf_loglik.as_ref() {
            Some(table) => table,
            None => panic!("The leaf likelihood table is not initialized"),
        };
        let loglik_u = self.branch_loglik(u, v);
        let loglik_v = self.branch_loglik(v, u);

        let mut loglik = 0.0;
        for j in start..=end {
            let from_u = matrix_dot_scaled(&half, &loglik_u[j]);
            let from_v = matrix_dot_scaled(&half, &loglik_v[j]);
            let code = seq.get(j);
            let state = if code >= 0 { code as usize } else { 4 };
            let mut column = [0.0; 4];
            for s in 0..4 {
                column[s] = from_u[s] + from_v[s] + table[state][s];
            }
            loglik += dot_product_scaled(&pi, &column);
        }
        loglik
    }

    /// Places an aligned sequence onto the edge between `u` and its
    /// parent `v`: splices a new interior node `r` into the edge, hangs a
    /// new leaf `n` bound to the sequence from it, evaluates the new
    /// caches, and optimizes the three incident branch lengths.
    ///
    /// Leaves the tree rooted at `r` and returns the tree log-likelihood
    /// over the site window. The ids of `r` and `n` are the next two
    /// fresh ids.
    pub fn place_seq(
        &mut self, seq: &DigitalSeq, u: NodeId, v: NodeId, start: usize, end: usize,
    ) -> Result<f64, String> {
        if seq.len() != self.cs_len {
            return Err(format!(
                "Aligned sequence length {} does not match the consensus length {}",
                seq.len(), self.cs_len
            ));
        }
        if !self.is_parent(v, u) {
            return Err(format!("Node {} is not the parent of node {}", v, u));
        }

        // Detach the edge, keeping its branch records.
        let w0 = self.branch_length(u, v);
        let (branch_uv, branch_vu) = self.remove_edge(u, v);

        // A new interior node in the middle of the edge and a new leaf
        // with the query sequence.
        let name = self.nodes[v].name.clone();
        let r = self.add_node(&name);
        let n = self.add_node(&name);
        self.nodes[n].seq = seq.clone();
        self.nodes[n].parent = Some(r);
        self.nodes[u].parent = Some(r);
        self.nodes[r].parent = Some(v);

        // Re-attach at the midpoint, reusing the detached caches for the
        // directions that are still valid.
        self.add_edge(u, r, branch_uv, Branch::new(w0));
        self.add_edge(v, r, branch_vu, Branch::new(w0));
        self.set_branch_length(u, r, w0 * 0.5);
        self.set_branch_length(v, r, w0 * 0.5);
        self.add_edge(n, r, Branch::new(0.0), Branch::new(0.0));

        // Evaluate the new caches and optimize the pendant branch, then
        // the two halves of the split edge.
        self.set_root(n);
        self.evaluate();
        self.set_root(r);
        self.evaluate();
        self.optimize_branch_length(n, r, start, end);
        self.set_root(u);
        self.evaluate();
        self.set_root(v);
        self.evaluate();
        self.optimize_three_way(u, r, v, start, end, false);
        self.set_root(r);

        Ok(self.tree_loglik_window(start, end))
    }

    /// Extracts a two-node tree over the branch between `u` and its
    /// parent `v`, copying both directional records, the models, and the
    /// leaf table. The copy is rooted at the copy of `v`.
    pub fn copy_subtree(&self, u: NodeId, v: NodeId) -> PhyloTree {
        debug_assert!(self.is_parent(v, u));
        let mut tree = PhyloTree {
            nodes: Vec::new(),
            branches: HashMap::new(),
            root: 0,
            cs_len: self.cs_len,
            leaf_loglik: self.leaf_loglik,
            msa_index: BTreeMap::new(),
            model: self.model.clone(),
            dg: self.dg.clone(),
        };

        let mut v2 = Node::new(0, &self.nodes[v].name);
        v2.seq = self.nodes[v].seq.clone();
        v2.anno = self.nodes[v].anno.clone();
        v2.anno_dist = self.nodes[v].anno_dist;
        let mut u2 = Node::new(1, &self.nodes[u].name);
        u2.seq = self.nodes[u].seq.clone();
        u2.anno = self.nodes[u].anno.clone();
        u2.anno_dist = self.nodes[u].anno_dist;
        u2.parent = Some(0);
        v2.neighbors.push(1);
        u2.neighbors.push(0);
        tree.nodes.push(v2);
        tree.nodes.push(u2);

        tree.branches.insert((1, 0), self.branches[&(u, v)].clone());
        tree.branches.insert((0, 1), self.branches[&(v, u)].clone());
        tree
    }

    /// Returns the leaves whose bound sequence is within `max_dist`
    /// p-distance of the query over the site window. An empty candidate
    /// list means all nodes.
    pub fn leaf_hits_by_pdist(
        &self, candidates: &[NodeId], seq: &DigitalSeq, max_dist: f64, start: usize, end: usize,
    ) -> Vec<NodeId> {
        self.leaf_hits(candidates, |leaf_seq| model::p_dist(leaf_seq, seq, start, end) <= max_dist)
    }

    /// Returns the leaves whose bound sequence is within `max_dist`
    /// model-corrected distance of the query over the site window. An
    /// empty candidate list means all nodes.
    pub fn leaf_hits_by_sub_dist(
        &self, candidates: &[NodeId], seq: &DigitalSeq, max_dist: f64, start: usize, end: usize,
    ) -> Vec<NodeId> {
        let model = self.model();
        self.leaf_hits(candidates, |leaf_seq| model.sub_dist(leaf_seq, seq, start, end) <= max_dist)
    }

    fn leaf_hits<F: Fn(&DigitalSeq) -> bool>(&self, candidates: &[NodeId], accept: F) -> Vec<NodeId> {
        let all: Vec<NodeId>;
        let candidates = if candidates.is_empty() {
            all = (0..self.nodes.len()).collect();
            &all
        } else {
            candidates
        };
        candidates.iter().copied()
            .filter(|&id| self.nodes[id].is_leaf() && !self.nodes[id].seq.is_empty())
            .filter(|&id| accept(&self.nodes[id].seq))
            .collect()
    }

    // Removes the edge between two adjacent nodes, returning the branch
    // records for the directions (u, v) and (v, u).
    fn remove_edge(&mut self, u: NodeId, v: NodeId) -> (Branch, Branch) {
        self.nodes[u].neighbors.retain(|&x| x != v);
        self.nodes[v].neighbors.retain(|&x| x != u);
        let forward = match self.branches.remove(&(u, v)) {
            Some(branch) => branch,
            None => panic!("No edge between nodes {} and {}", u, v),
        };
        let backward = match self.branches.remove(&(v, u)) {
            Some(branch) => branch,
            None => panic!("No edge between nodes {} and {}", v, u),
        };
        (forward, backward)
    }

    fn add_node(&mut self, name: &str) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node::new(id, name));
        id
    }

    fn add_edge(&mut self, u: NodeId, v: NodeId, forward: Branch, backward: Branch) {
        self.nodes[u].neighbors.push(v);
        self.nodes[v].neighbors.push(u);
        self.branches.insert((u, v), forward);
        self.branches.insert((v, u), backward);
    }
}

//-----------------------------------------------------------------------------

// Taxonomic annotation.

/// Separator between the name and the annotation in an annotation file.
pub const ANNO_FIELD_SEP: char = '\t';

const TAXA_PREFIXES: [&str; 7] = ["k__", "p__", "c__", "o__", "f__", "g__", "s__"];
const TAXA_SEP: &[char] = &[';', ':', ' '];

fn split_taxa(name: &str) -> Vec<&str> {
    name.split(TAXA_SEP).filter(|field| !field.is_empty()).collect()
}

/// Returns `true` if the field carries any canonical taxonomic prefix.
pub fn is_canonical_name(field: &str) -> bool {
    TAXA_PREFIXES.iter().any(|prefix| field.starts_with(prefix) && field.len() > prefix.len())
}

/// Returns `true` if the name is fully canonical: all seven levels
/// present, each with the prefix of its rank.
pub fn is_full_canonical_name(name: &str) -> bool {
    let fields = split_taxa(name);
    fields.len() == TAXA_PREFIXES.len()
        && fields.iter().zip(TAXA_PREFIXES.iter()).all(|(field, prefix)| {
            field.starts_with(prefix) && field.len() > prefix.len()
        })
}

/// Returns `true` if the name is a non-empty run of canonical fields.
pub fn is_partial_canonical_name(name: &str) -> bool {
    let fields = split_taxa(name);
    !fields.is_empty() && fields.iter().all(|field| is_canonical_name(field))
}

/// Annotation.
impl PhyloTree {
    /// Annotates every node of the tree. See
    /// [`PhyloTree::annotate_node`].
    pub fn annotate(&mut self) {
        for id in 0..self.nodes.len() {
            self.annotate_node(id);
        }
    }

    /// Annotates a node by walking toward the root, accumulating branch
    /// length into the annotation distance and collecting canonical
    /// names, until the first fully canonical ancestor or the root. A
    /// node with no canonical names on its path is annotated `"Other"`.
    pub fn annotate_node(&mut self, id: NodeId) {
        let mut path: Vec<String> = Vec::new();
        let mut distance = 0.0;
        let mut current = id;
        while !is_full_canonical_name(&self.nodes[current].name) {
            let parent = match self.nodes[current].parent {
                Some(parent) => parent,
                None => break,
            };
            distance += self.branch_length(current, parent);
            if is_partial_canonical_name(&self.nodes[current].name) {
                path.push(self.nodes[current].name.clone());
            }
            current = parent;
        }
        if is_full_canonical_name(&self.nodes[current].name) {
            path.push(self.nodes[current].name.clone());
        }
        path.reverse();
        self.nodes[id].anno_dist = distance;
        self.nodes[id].anno = if path.is_empty() {
            String::from("Other")
        } else {
            path.join(";")
        };
    }
}

//-----------------------------------------------------------------------------

/// Newick output.
impl PhyloTree {
    /// Returns the tree in Newick format, rooted at the current root.
    /// Names with structural characters or whitespace are single-quoted.
    pub fn to_newick(&self) -> String {
        let mut out = String::new();
        self.write_newick_node(&mut out, self.root);
        out.push(';');
        out
    }

    fn write_newick_node(&self, out: &mut String, id: NodeId) {
        let children = self.children(id);
        if !children.is_empty() {
            out.push('(');
            for (i, &child) in children.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                self.write_newick_node(out, child);
            }
            out.push(')');
        }
        newick::write_name(out, &self.nodes[id].name);
        if let Some(parent) = self.nodes[id].parent {
            let length = self.branch_length(id, parent);
            if length > 0.0 {
                out.push(':');
                out.push_str(&format!("{}", length));
            }
        }
    }
}

//-----------------------------------------------------------------------------

// Persistence records; the adjacency lists and parent pointers are
// rebuilt from the directed edge records.

#[derive(Serialize, Deserialize)]
struct NodeRecord {
    id: u64,
    name: String,
    seq: DigitalSeq,
    anno: String,
    anno_dist: f64,
}

#[derive(Serialize, Deserialize)]
struct EdgeRecord {
    id1: u64,
    id2: u64,
    is_parent: bool,
    length: f64,
    loglik: Option<Vec<Vector4>>,
}

#[derive(Serialize, Deserialize)]
struct TreeFile {
    cs_len: u64,
    nodes: Vec<NodeRecord>,
    edges: Vec<EdgeRecord>,
    leaf_loglik: Option<[Vector4; 5]>,
    root: u64,
    msa_index: Vec<(u64, u64)>,
    model: Option<String>,
    dg: Option<DiscreteGamma>,
}

/// Persistence.
impl PhyloTree {
    /// Serializes the tree into the writer as a versioned binary blob.
    pub fn save_to<W: Write>(&self, writer: &mut W) -> Result<(), String> {
        writer.write_all(&MAGIC.to_le_bytes()).map_err(|err| {
            format!("Failed to write the tree header: {}", err)
        })?;
        writer.write_all(&FORMAT_VERSION.to_le_bytes()).map_err(|err| {
            format!("Failed to write the tree header: {}", err)
        })?;

        let nodes = self.nodes.iter().map(|node| NodeRecord {
            id: node.id as u64,
            name: node.name.clone(),
            seq: node.seq.clone(),
            anno: node.anno.clone(),
            anno_dist: node.anno_dist,
        }).collect();

        let mut edges = Vec::with_capacity(self.branches.len());
        for node in self.nodes.iter() {
            for &neighbor in node.neighbors.iter() {
                let branch = &self.branches[&(node.id, neighbor)];
                edges.push(EdgeRecord {
                    id1: node.id as u64,
                    id2: neighbor as u64,
                    is_parent: self.nodes[neighbor].parent == Some(node.id),
                    length: branch.length,
                    loglik: branch.loglik.clone(),
                });
            }
        }

        let file = TreeFile {
            cs_len: self.cs_len as u64,
            nodes,
            edges,
            leaf_loglik: self.leaf_loglik,
            root: self.root as u64,
            msa_index: self.msa_index.iter().map(|(&row, &id)| (row as u64, id as u64)).collect(),
            model: self.model.as_ref().map(|model| model.to_text()),
            dg: self.dg.clone(),
        };
        bincode::serialize_into(writer, &file).map_err(|err| {
            format!("Failed to serialize the tree: {}", err)
        })
    }

    /// Loads a tree from the reader, checking the header first.
    ///
    /// Fails if the magic number is wrong or the blob was written by a
    /// newer version of the format.
    pub fn load_from<R: Read>(reader: &mut R) -> Result<Self, String> {
        let mut magic = [0u8; 8];
        let mut version = [0u8; 4];
        reader.read_exact(&mut magic).map_err(|err| {
            format!("Failed to read the tree header: {}", err)
        })?;
        if u64::from_le_bytes(magic) != MAGIC {
            return Err(String::from("Not a phylogenetic tree file"));
        }
        reader.read_exact(&mut version).map_err(|err| {
            format!("Failed to read the tree header: {}", err)
        })?;
        let version = u32::from_le_bytes(version);
        if version > FORMAT_VERSION {
            return Err(format!(
                "The tree was written by a newer version of the format ({} > {})",
                version, FORMAT_VERSION
            ));
        }

        let file: TreeFile = bincode::deserialize_from(reader).map_err(|err| {
            format!("Failed to deserialize the tree: {}", err)
        })?;

        let num_nodes = file.nodes.len();
        let mut nodes: Vec<Node> = Vec::with_capacity(num_nodes);
        for (offset, record) in file.nodes.into_iter().enumerate() {
            if record.id as usize != offset {
                return Err(format!("Node record {} has id {}", offset, record.id));
            }
            let mut node = Node::new(offset, &record.name);
            node.seq = record.seq;
            node.anno = record.anno;
            node.anno_dist = record.anno_dist;
            nodes.push(node);
        }

        let mut branches = HashMap::with_capacity(file.edges.len());
        for record in file.edges.into_iter() {
            let (id1, id2) = (record.id1 as usize, record.id2 as usize);
            if id1 >= num_nodes || id2 >= num_nodes {
                return Err(format!("Edge record between invalid nodes {} and {}", id1, id2));
            }
            nodes[id1].neighbors.push(id2);
            if record.is_parent {
                nodes[id2].parent = Some(id1);
            }
            branches.insert((id1, id2), Branch {
                length: record.length,
                loglik: record.loglik,
            });
        }

        let root = file.root as usize;
        if root >= num_nodes {
            return Err(format!("Invalid root id {}", root));
        }
        let mut msa_index = BTreeMap::new();
        for (row, id) in file.msa_index.into_iter() {
            if id as usize >= num_nodes {
                return Err(format!("MSA row {} bound to invalid node {}", row, id));
            }
            msa_index.insert(row as usize, id as usize);
        }
        let model = match file.model {
            Some(text) => Some(model::read_model(&text)?),
            None => None,
        };

        Ok(PhyloTree {
            nodes,
            branches,
            root,
            cs_len: file.cs_len as usize,
            leaf_loglik: file.leaf_loglik,
            msa_index,
            model,
            dg: file.dg,
        })
    }

    /// Saves the tree to the given file.
    pub fn save<P: AsRef<Path>>(&self, filename: P) -> Result<(), String> {
        let file = File::create(&filename).map_err(|err| {
            format!("Failed to create {}: {}", filename.as_ref().display(), err)
        })?;
        let mut writer = BufWriter::new(file);
        self.save_to(&mut writer)
    }

    /// Loads a tree from the given file.
    pub fn load<P: AsRef<Path>>(filename: P) -> Result<Self, String> {
        let file = File::open(&filename).map_err(|err| {
            format!("Failed to open {}: {}", filename.as_ref().display(), err)
        })?;
        let mut reader = BufReader::new(file);
        Self::load_from(&mut reader)
    }
}

//-----------------------------------------------------------------------------
