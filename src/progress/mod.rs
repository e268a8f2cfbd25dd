//! Durable, crash-safe progress store (component E).
//!
//! Holds the four persistent maps described in `spec.md` §3 plus `params`,
//! backed by four JSON files in the alignment directory. Every operation
//! is serialized through a single mutex; methods are written so none of
//! them needs to re-enter that lock (see DESIGN.md for why this crate
//! does not need a reentrant mutex the way the system it was distilled
//! from did).

mod model;

pub use model::{Params, FAIL};

use crate::config::InputFile;
use crate::db::{DbDescriptor, FamilyDatabase};
use crate::error::{PipelineError, ProgressError};
use crate::hash::{atomic_write, hash_file};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const PARAM_FILE: &str = "parameters.json";
const CONTIG_FILE: &str = "contigs.json";
const BLAST_FILE: &str = "blastx.json";
const PAGAN_FILE: &str = "pagan.json";

const QUERY_PREFIX: &str = "query";

struct Inner {
    params: Option<Params>,
    contig_query: HashMap<String, HashMap<String, String>>,
    query_gene: HashMap<String, String>,
    family_file: HashMap<String, String>,
    query_id_counter: Option<u64>,
    reverse_index: Option<HashMap<String, (String, String)>>,
}

/// The durable record of all stage-to-stage mappings and input parameters.
pub struct ProgressStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl ProgressStore {
    /// Open the progress store in `dir`, performing the restart check
    /// against `db` and `inputs`.
    ///
    /// If the stored `params` is empty this is treated as a fresh run and
    /// the current db/inputs become authoritative. Otherwise the sorted
    /// checksum fingerprints must match exactly; a mismatch is
    /// [`PipelineError::ConfigMismatch`]. File paths are always taken from
    /// the current `inputs`, even when checksums match, since only
    /// content identity (not location) is required to stay stable.
    pub fn open(dir: impl Into<PathBuf>, db: &dyn FamilyDatabase, inputs: &[InputFile]) -> Result<Self, PipelineError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| ProgressError::Io {
            path: dir.clone(),
            source,
        })?;

        let params = load_json::<Params>(&dir.join(PARAM_FILE))?;
        let contig_query = load_json(&dir.join(CONTIG_FILE))?.unwrap_or_default();
        let query_gene = load_json(&dir.join(BLAST_FILE))?.unwrap_or_default();
        let family_file = load_json(&dir.join(PAGAN_FILE))?.unwrap_or_default();

        let current = build_current_params(db, inputs)?;

        let resolved = match params {
            None => current,
            Some(stored) => {
                if stored.checksum_fingerprint() != current.checksum_fingerprint() {
                    return Err(PipelineError::ConfigMismatch {
                        original: stored.describe(),
                        current: current.describe(),
                    });
                }
                current
            }
        };

        Ok(Self {
            dir,
            inner: Mutex::new(Inner {
                params: Some(resolved),
                contig_query,
                query_gene,
                family_file,
                query_id_counter: None,
                reverse_index: None,
            }),
        })
    }

    /// Write all four progress files. A map that is still empty is left
    /// unwritten, matching the prior implementation's behavior of never
    /// creating a progress file until there is something to record in it.
    pub fn flush(&self) -> Result<(), PipelineError> {
        let inner = self.inner.lock().unwrap();

        if let Some(params) = &inner.params {
            write_json(&self.dir.join(PARAM_FILE), params)?;
        }
        if !inner.contig_query.is_empty() {
            write_json(&self.dir.join(CONTIG_FILE), &inner.contig_query)?;
        }
        if !inner.query_gene.is_empty() {
            write_json(&self.dir.join(BLAST_FILE), &inner.query_gene)?;
        }
        if !inner.family_file.is_empty() {
            write_json(&self.dir.join(PAGAN_FILE), &inner.family_file)?;
        }

        log::info!("progress store flushed");
        Ok(())
    }

    /// Return the existing query id for `(label, contig_id)`, or mint a
    /// fresh `query<N>` where `N` starts at `1 + max` of every existing
    /// `query<N>` suffix on first mint.
    pub fn query_for(&self, label: &str, contig_id: &str) -> String {
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner
            .contig_query
            .get(label)
            .and_then(|m| m.get(contig_id))
        {
            return existing.clone();
        }

        if inner.query_id_counter.is_none() {
            let max = inner
                .contig_query
                .values()
                .flat_map(|m| m.values())
                .filter_map(|q| q.strip_prefix(QUERY_PREFIX))
                .filter_map(|n| n.parse::<u64>().ok())
                .max()
                .unwrap_or(0);
            inner.query_id_counter = Some(max + 1);
        }

        let next = inner.query_id_counter.unwrap();
        inner.query_id_counter = Some(next + 1);
        let query_id = format!("{QUERY_PREFIX}{next}");

        inner
            .contig_query
            .entry(label.to_string())
            .or_default()
            .insert(contig_id.to_string(), query_id.clone());
        inner.reverse_index = None;

        query_id
    }

    /// Bulk-merge search results into `query_gene`.
    pub fn update_query_gene(&self, batch: HashMap<String, String>) {
        self.inner.lock().unwrap().query_gene.extend(batch);
    }

    /// Record a family's alignment outcome.
    pub fn put_family_file(&self, family_id: &str, filename_or_fail: &str) {
        self.inner
            .lock()
            .unwrap()
            .family_file
            .insert(family_id.to_string(), filename_or_fail.to_string());
    }

    /// Every minted query id that has not yet produced a search verdict.
    pub fn pending_queries(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .contig_query
            .values()
            .flat_map(|m| m.values())
            .filter(|q| !inner.query_gene.contains_key(q.as_str()))
            .cloned()
            .collect()
    }

    /// Invert `query_gene` (excluding `FAIL`) through the family database,
    /// bucketing query ids by family id. Lines whose gene id the database
    /// does not recognize are skipped with a warning, never stored.
    pub fn families_to_align(&self, db: &dyn FamilyDatabase) -> HashMap<String, Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let mut buckets: HashMap<String, Vec<String>> = HashMap::new();

        for (query_id, gene_id) in inner.query_gene.iter() {
            if gene_id == FAIL {
                continue;
            }

            match db.family_of(gene_id) {
                Some(family_id) => buckets.entry(family_id).or_default().push(query_id.clone()),
                None => log::warn!("gene id {gene_id} for {query_id} has no known family"),
            }
        }

        buckets
    }

    /// `(not_done, failed)` over every family known to `families_to_align`.
    pub fn alignments_remaining(&self, db: &dyn FamilyDatabase) -> (usize, usize) {
        let families = self.families_to_align(db);
        let inner = self.inner.lock().unwrap();

        let mut not_done = 0;
        let mut failed = 0;

        for family_id in families.keys() {
            match inner.family_file.get(family_id) {
                None => not_done += 1,
                Some(v) if v == FAIL => failed += 1,
                Some(_) => {}
            }
        }

        (not_done, failed)
    }

    /// `family_file` entry for `family_id`, if any attempt has completed.
    pub fn family_file(&self, family_id: &str) -> Option<String> {
        self.inner.lock().unwrap().family_file.get(family_id).cloned()
    }

    /// Whether `contig_id` in `label` has had a query id minted.
    pub fn contig_has_query(&self, label: &str, contig_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .contig_query
            .get(label)
            .is_some_and(|m| m.contains_key(contig_id))
    }

    /// Whether `contig_id` in `label` resolved to a real gene (not `FAIL`,
    /// not still pending).
    pub fn contig_is_assigned(&self, label: &str, contig_id: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        let Some(query_id) = inner.contig_query.get(label).and_then(|m| m.get(contig_id)) else {
            return false;
        };

        matches!(inner.query_gene.get(query_id), Some(g) if g != FAIL)
    }

    /// Lazy reverse lookup from query id to `(contig_id, label)`, rebuilt
    /// on first call after any mutation of `contig_query`.
    pub fn contig_from_query(&self, query_id: &str) -> Option<(String, String)> {
        let mut inner = self.inner.lock().unwrap();

        if inner.reverse_index.is_none() {
            let mut index = HashMap::new();
            for (label, contigs) in inner.contig_query.iter() {
                for (contig_id, q) in contigs {
                    index.insert(q.clone(), (contig_id.clone(), label.clone()));
                }
            }
            inner.reverse_index = Some(index);
        }

        inner.reverse_index.as_ref().unwrap().get(query_id).cloned()
    }
}

fn build_current_params(db: &dyn FamilyDatabase, inputs: &[InputFile]) -> Result<Params, PipelineError> {
    let mut contig_files = HashMap::new();

    for input in inputs {
        let checksum = hash_file(&input.path).map_err(|source| PipelineError::InputMissing {
            path: input.path.clone(),
            source,
        })?;

        let abs_path = input
            .path
            .canonicalize()
            .unwrap_or_else(|_| input.path.clone())
            .to_string_lossy()
            .to_string();

        contig_files.insert(abs_path, (input.label.clone(), input.species.clone(), checksum));
    }

    let d: &DbDescriptor = db.descriptor();
    Ok(Params {
        db_species: d.species.clone(),
        db_release: d.release,
        db_filename: d.filename.clone(),
        db_checksum: d.checksum.clone(),
        contig_files,
    })
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, ProgressError> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|source| ProgressError::Json {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ProgressError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), ProgressError> {
    let bytes = serde_json::to_vec(value).map_err(|source| ProgressError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    atomic_write(path, &bytes).map_err(|source| ProgressError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TsvFamilyDb;
    use tempfile::tempdir;

    fn descriptor(checksum: &str) -> DbDescriptor {
        DbDescriptor {
            species: "human".into(),
            release: 1,
            filename: "db".into(),
            checksum: checksum.into(),
        }
    }

    fn write_input(dir: &Path, name: &str, contents: &str) -> InputFile {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        InputFile::new(path, name, "human")
    }

    #[test]
    fn query_for_mints_stable_sequential_ids() {
        let dir = tempdir().unwrap();
        let input = write_input(dir.path(), "a.fa", ">c1\nACGT\n");
        let db = TsvFamilyDb::from_pairs(descriptor("x"), []);

        let store = ProgressStore::open(dir.path().join("align"), &db, &[input]).unwrap();

        let q1 = store.query_for("a.fa", "c1");
        let q2 = store.query_for("a.fa", "c2");
        let q1_again = store.query_for("a.fa", "c1");

        assert_eq!(q1, q1_again);
        assert_ne!(q1, q2);
        assert!(q1.starts_with("query"));
    }

    #[test]
    fn fresh_run_treats_current_inputs_as_authoritative() {
        let dir = tempdir().unwrap();
        let input = write_input(dir.path(), "a.fa", ">c1\nACGT\n");
        let db = TsvFamilyDb::from_pairs(descriptor("x"), []);

        let store = ProgressStore::open(dir.path().join("align"), &db, &[input]).unwrap();
        store.flush().unwrap();

        assert!(dir.path().join("align").join(PARAM_FILE).exists());
    }

    #[test]
    fn restart_with_same_inputs_is_a_no_op() {
        let dir = tempdir().unwrap();
        let input = write_input(dir.path(), "a.fa", ">c1\nACGT\n");
        let db = TsvFamilyDb::from_pairs(descriptor("x"), []);

        let align_dir = dir.path().join("align");
        let store = ProgressStore::open(&align_dir, &db, &[input.clone()]).unwrap();
        store.query_for("a.fa", "c1");
        store.flush().unwrap();

        let store2 = ProgressStore::open(&align_dir, &db, &[input]).unwrap();
        assert_eq!(store2.query_for("a.fa", "c1"), "query1");
    }

    #[test]
    fn changed_input_checksum_is_fatal_config_mismatch() {
        let dir = tempdir().unwrap();
        let input = write_input(dir.path(), "a.fa", ">c1\nACGT\n");
        let db = TsvFamilyDb::from_pairs(descriptor("x"), []);

        let align_dir = dir.path().join("align");
        let store = ProgressStore::open(&align_dir, &db, &[input.clone()]).unwrap();
        store.flush().unwrap();
        drop(store);

        std::fs::write(&input.path, ">c1\nTTTT\n").unwrap();

        let result = ProgressStore::open(&align_dir, &db, &[input]);
        assert!(matches!(result, Err(PipelineError::ConfigMismatch { .. })));
    }

    #[test]
    fn missing_input_file_is_fatal_with_hint() {
        let dir = tempdir().unwrap();
        let db = TsvFamilyDb::from_pairs(descriptor("x"), []);
        let missing = InputFile::new(dir.path().join("nope.fa"), "a", "human");

        let result = ProgressStore::open(dir.path().join("align"), &db, &[missing]);
        let err = result.unwrap_err();
        assert!(matches!(err, PipelineError::InputMissing { .. }));
        assert!(err.to_string().contains("re-specify inputs"));
    }

    #[test]
    fn pending_queries_excludes_resolved_ones() {
        let dir = tempdir().unwrap();
        let input = write_input(dir.path(), "a.fa", ">c1\nACGT\n");
        let db = TsvFamilyDb::from_pairs(descriptor("x"), []);
        let store = ProgressStore::open(dir.path().join("align"), &db, &[input]).unwrap();

        let q1 = store.query_for("a.fa", "c1");
        let q2 = store.query_for("a.fa", "c2");
        store.update_query_gene(HashMap::from([(q1.clone(), "geneA".to_string())]));

        let pending = store.pending_queries();
        assert_eq!(pending, vec![q2]);
    }

    #[test]
    fn families_to_align_buckets_by_family_and_skips_fail() {
        let dir = tempdir().unwrap();
        let input = write_input(dir.path(), "a.fa", ">c1\nACGT\n");
        let db = TsvFamilyDb::from_pairs(
            descriptor("x"),
            [("geneA".to_string(), "fam1".to_string())],
        );
        let store = ProgressStore::open(dir.path().join("align"), &db, &[input]).unwrap();

        let q1 = store.query_for("a.fa", "c1");
        let q2 = store.query_for("a.fa", "c2");
        let q3 = store.query_for("a.fa", "c3");
        store.update_query_gene(HashMap::from([
            (q1.clone(), "geneA".to_string()),
            (q2, FAIL.to_string()),
            (q3, "unknown-gene".to_string()),
        ]));

        let buckets = store.families_to_align(&db);
        assert_eq!(buckets.get("fam1"), Some(&vec![q1]));
        assert_eq!(buckets.len(), 1);
    }

    #[test]
    fn alignments_remaining_counts_not_done_and_failed() {
        let dir = tempdir().unwrap();
        let input = write_input(dir.path(), "a.fa", ">c1\nACGT\n");
        let db = TsvFamilyDb::from_pairs(
            descriptor("x"),
            [
                ("geneA".to_string(), "fam1".to_string()),
                ("geneB".to_string(), "fam2".to_string()),
            ],
        );
        let store = ProgressStore::open(dir.path().join("align"), &db, &[input]).unwrap();

        let q1 = store.query_for("a.fa", "c1");
        let q2 = store.query_for("a.fa", "c2");
        store.update_query_gene(HashMap::from([
            (q1, "geneA".to_string()),
            (q2, "geneB".to_string()),
        ]));
        store.put_family_file("fam1", FAIL);

        let (not_done, failed) = store.alignments_remaining(&db);
        assert_eq!((not_done, failed), (1, 1));
    }

    #[test]
    fn contig_from_query_reverse_lookup() {
        let dir = tempdir().unwrap();
        let input = write_input(dir.path(), "a.fa", ">c1\nACGT\n");
        let db = TsvFamilyDb::from_pairs(descriptor("x"), []);
        let store = ProgressStore::open(dir.path().join("align"), &db, &[input]).unwrap();

        let q1 = store.query_for("a.fa", "c1");
        assert_eq!(
            store.contig_from_query(&q1),
            Some(("c1".to_string(), "a.fa".to_string()))
        );
        assert_eq!(store.contig_from_query("query999"), None);
    }
}
