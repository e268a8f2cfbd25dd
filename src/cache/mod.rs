//! Family cache + manifest (component C).
//!
//! A content-addressed directory of gene-family FASTA files and their
//! alignment outputs, protected by an append-only `manifest` ledger so a
//! restart can tell a partially written file from a tampered one.

mod manifest;

pub use manifest::{FamilyCache, ALIGNMENT_SUFFIXES};
