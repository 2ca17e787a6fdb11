//! # phyloplace: taxonomic placement of marker-gene reads.
//!
//! This crate is the computational core of a taxonomic-assignment system
//! for microbial marker-gene (e.g. 16S rRNA) sequencing reads. Given a
//! reference multiple sequence alignment with a phylogenetic tree and a
//! substitution model, it answers exact-substring queries over the
//! references in alignment coordinates and places new aligned reads onto
//! the tree by maximum likelihood.
//!
//! Two subsystems carry the engine:
//!
//! * The **consensus-space FM-index** ([`CsfmIndex`]): a compressed
//!   self-index over the concatenated ungapped reference sequences, with
//!   an auxiliary mapping back to consensus columns. Pattern matches are
//!   reported in alignment coordinates, and matched substrings can be
//!   reconstructed in aligned form. Built from a rank-enabled bit vector
//!   ([`bits::BitVector`]), a wavelet tree over the BWT
//!   ([`wavelet::WaveletTree`]), and a linear-time suffix array
//!   ([`suffix::suffix_array`]).
//!
//! * The **phylogenetic likelihood engine** ([`PhyloTree`]): an unrooted
//!   tree with per-directed-edge conditional likelihood caches,
//!   Felsenstein pruning in scaled log space with optional
//!   discrete-Gamma rate heterogeneity ([`DiscreteGamma`]), iterative
//!   branch-length optimization, and sequence placement by splicing a
//!   new leaf onto an existing edge.
//!
//! A typical pipeline indexes the alignment once, persists the index and
//! the tree as versioned binary blobs, and at query time locates
//! candidate regions with the index, places the read with the engine,
//! and reports the nearest canonical taxonomy along the placed branch.
//!
//! Both structures are immutable after construction in the read path:
//! concurrent searches over a frozen index are safe, while placement
//! mutates per-edge caches and needs one tree replica per worker.

pub mod alphabet;
pub mod bits;
pub mod csfm;
pub mod gamma;
pub mod model;
pub mod msa;
pub mod newick;
pub mod suffix;
pub mod tree;
pub mod utils;
pub mod wavelet;

#[cfg(test)]
pub(crate) mod internal;

pub use alphabet::DigitalSeq;
pub use csfm::{CsLoc, CsfmIndex};
pub use gamma::DiscreteGamma;
pub use model::{create_model, read_model, SubModel};
pub use msa::Msa;
pub use newick::NewickNode;
pub use tree::PhyloTree;
