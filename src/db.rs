//! Reference-DB adapter (component G).
//!
//! The reference-database file format and lookup API are out of scope for
//! this crate (see `spec.md` §1): this module only defines the read-only
//! contract the coordinator depends on, plus one minimal file-backed
//! implementation usable in tests or as a starting point for a real
//! adapter.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

/// Static facts about the reference database a run was built against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbDescriptor {
    pub species: String,
    pub release: u32,
    pub filename: String,
    pub checksum: String,
}

/// Read-only queries against the family database. Implementations are
/// expected to be cheap to clone/share (e.g. an `Arc` around an in-memory
/// index) since the coordinator calls `family_of` once per resolved gene.
pub trait FamilyDatabase: Send + Sync {
    fn descriptor(&self) -> &DbDescriptor;

    /// Resolve a gene id to the family id it belongs to. Returns `None`
    /// for a gene id the database does not recognize.
    fn family_of(&self, gene_id: &str) -> Option<String>;
}

/// A minimal `FamilyDatabase` backed by a two-column TSV (`gene_id\t
/// family_id`) with the descriptor fields given explicitly at
/// construction. Not required reading for the coordinator, which only
/// ever depends on the [`FamilyDatabase`] trait; provided for tests and as
/// a starting point for a real adapter.
#[derive(Debug, Clone)]
pub struct TsvFamilyDb {
    descriptor: DbDescriptor,
    gene_to_family: HashMap<String, String>,
}

impl TsvFamilyDb {
    pub fn load(path: impl AsRef<Path>, descriptor: DbDescriptor) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut gene_to_family = HashMap::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some((gene, family)) = line.split_once('\t') {
                gene_to_family.insert(gene.to_string(), family.to_string());
            }
        }

        Ok(Self {
            descriptor,
            gene_to_family,
        })
    }

    pub fn from_pairs(descriptor: DbDescriptor, pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            descriptor,
            gene_to_family: pairs.into_iter().collect(),
        }
    }
}

impl FamilyDatabase for TsvFamilyDb {
    fn descriptor(&self) -> &DbDescriptor {
        &self.descriptor
    }

    fn family_of(&self, gene_id: &str) -> Option<String> {
        self.gene_to_family.get(gene_id).cloned()
    }
}
