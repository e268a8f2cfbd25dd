//! The manifest ledger and validation protocol for [`FamilyCache`].

use crate::error::CacheError;
use crate::hash::hash_bytes;
use rand::Rng;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Fixed suffixes appended to a family's basename for its six alignment
/// output files.
pub const ALIGNMENT_SUFFIXES: [&str; 6] = [
    ".1.dnd",
    ".2.dnd",
    ".nuc.1.fas",
    ".nuc.2.fas",
    ".pep.1.fas",
    ".pep.2.fas",
];

const MANIFEST_NAME: &str = "manifest";
const SUFFIX_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_";

struct CacheState {
    /// basename -> hash, for every file currently believed committed.
    known: HashMap<String, String>,
    /// gene names scanned from the headers of valid family files.
    genes: HashSet<String>,
    /// families whose alignment outputs failed validation and need redoing.
    realign: HashSet<String>,
}

/// Content-addressed directory of gene-family files and their alignments.
pub struct FamilyCache {
    dir: PathBuf,
    prefix: String,
    manifest_path: PathBuf,
    manifest_line_pat: Regex,
    family_name_pat: Regex,
    state: Mutex<CacheState>,
}

impl FamilyCache {
    /// Open (creating if necessary) a family cache rooted at `dir`, using
    /// `prefix` for newly minted family basenames, and run the validation
    /// protocol once.
    pub fn open(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self, CacheError> {
        let dir = dir.into();
        let prefix = prefix.into();
        fs::create_dir_all(&dir)?;

        let manifest_path = dir.join(MANIFEST_NAME);
        let manifest_line_pat = Regex::new(r"^(.+) ([0-9a-z]{32})$").unwrap();
        let family_name_pat = Regex::new(&format!("^{}[A-Za-z0-9_]{{6}}$", regex::escape(&prefix))).unwrap();

        let cache = Self {
            dir,
            prefix,
            manifest_path,
            manifest_line_pat,
            family_name_pat,
            state: Mutex::new(CacheState {
                known: HashMap::new(),
                genes: HashSet::new(),
                realign: HashSet::new(),
            }),
        };

        cache.validate()?;
        Ok(cache)
    }

    /// Gene names found across every currently valid family file.
    pub fn genes(&self) -> HashSet<String> {
        self.state.lock().unwrap().genes.clone()
    }

    /// Families whose alignment outputs were found missing/corrupt and
    /// need to be realigned.
    pub fn families_needing_realignment(&self) -> HashSet<String> {
        self.state.lock().unwrap().realign.clone()
    }

    /// Whether `basename` is tracked as committed, with a matching hash.
    pub fn contains(&self, basename: &str) -> bool {
        self.state.lock().unwrap().known.contains_key(basename)
    }

    /// Full path of `basename` inside this cache directory. Does not imply
    /// the file exists or is tracked; callers needing that should check
    /// [`FamilyCache::contains`] first.
    pub fn path_of(&self, basename: &str) -> PathBuf {
        self.dir.join(basename)
    }

    /// Read the committed contents of `basename`. Returns
    /// [`CacheError::UnknownFamily`] if `basename` has no valid manifest
    /// entry (never appended, or dropped by the last validation pass as
    /// corrupt/untracked) rather than letting an ordinary "file not found"
    /// I/O error stand in for "this was never a file this cache vouches
    /// for".
    pub fn read(&self, basename: &str) -> Result<Vec<u8>, CacheError> {
        if !self.contains(basename) {
            return Err(CacheError::UnknownFamily(basename.to_string()));
        }

        Ok(fs::read(self.path_of(basename))?)
    }

    /// A family basename is a reserved-prefix "paralog" placement. Not
    /// consumed by any pipeline stage; exposed for callers that care about
    /// the distinction the prior system tracked.
    pub fn is_paralog(&self, basename: &str) -> bool {
        basename.starts_with("paralog_")
    }

    /// Mint a fresh, unused family basename: `<prefix><6 random chars>`.
    pub fn new_family_name(&self) -> String {
        loop {
            let suffix = random_suffix(6);
            let candidate = format!("{}{}", self.prefix, suffix);
            if !self.dir.join(&candidate).exists() {
                return candidate;
            }
        }
    }

    /// Append protocol: record `basename`'s hash in the manifest (fsync'd)
    /// before writing the content file itself. If a crash happens between
    /// the two, the next [`FamilyCache::open`] sees a manifest entry with
    /// no (or mismatched) content and treats it as needing redo, not as
    /// corrupt.
    pub fn append(&self, basename: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let hash = hash_bytes(bytes);

        {
            let mut state = self.state.lock().unwrap();

            let mut f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.manifest_path)?;
            writeln!(f, "{basename} {hash}")?;
            f.sync_all()?;

            state.known.insert(basename.to_string(), hash);
        }

        fs::write(self.dir.join(basename), bytes)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), CacheError> {
        let manifest_entries = self.load_manifest()?;

        let mut valid: HashMap<String, String> = HashMap::new();
        let mut family_basenames = Vec::new();

        for (basename, recorded_hash) in &manifest_entries {
            if !self.family_name_pat.is_match(basename) {
                continue;
            }

            match fs::read(self.dir.join(basename)) {
                Ok(bytes) if &hash_bytes(&bytes) == recorded_hash => {
                    valid.insert(basename.clone(), recorded_hash.clone());
                    family_basenames.push(basename.clone());
                }
                Ok(_) => log::warn!("manifest hash mismatch for family file {basename}"),
                Err(_) => log::warn!("manifest entry for {basename} has no file on disk"),
            }
        }

        let mut realign = HashSet::new();

        for family in &family_basenames {
            let path = self.dir.join(family);
            let count = count_fasta_records(&path)?;
            if count < 2 {
                continue;
            }

            let mut all_ok = true;
            for suffix in ALIGNMENT_SUFFIXES {
                let align_name = format!("{family}{suffix}");
                let matched = manifest_entries.get(&align_name).and_then(|recorded| {
                    match fs::read(self.dir.join(&align_name)) {
                        Ok(bytes) if &hash_bytes(&bytes) == recorded => Some(recorded.clone()),
                        _ => None,
                    }
                });

                match matched {
                    Some(recorded) => {
                        valid.insert(align_name, recorded);
                    }
                    None => all_ok = false,
                }
            }

            if !all_ok {
                log::warn!("alignment outputs for {family} need to be redone");
                realign.insert(family.clone());
                for suffix in ALIGNMENT_SUFFIXES {
                    valid.remove(&format!("{family}{suffix}"));
                }
            }
        }

        self.rewrite_manifest(&valid)?;
        self.cleanup(&valid)?;

        let genes = self.scan_genes(&family_basenames, &valid);

        log::info!(
            "manifest validation complete ({} genes in {} families, {} need realignment)",
            genes.len(),
            family_basenames.len(),
            realign.len()
        );

        let mut state = self.state.lock().unwrap();
        state.known = valid;
        state.genes = genes;
        state.realign = realign;
        Ok(())
    }

    fn load_manifest(&self) -> Result<HashMap<String, String>, CacheError> {
        let mut entries = HashMap::new();

        let text = match fs::read_to_string(&self.manifest_path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::write(&self.manifest_path, b"")?;
                return Ok(entries);
            }
            Err(e) => return Err(e.into()),
        };

        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            match self.manifest_line_pat.captures(line) {
                Some(caps) => {
                    entries.insert(caps[1].to_string(), caps[2].to_string());
                }
                None => log::warn!("manifest line {} is malformed: {line:?}", lineno + 1),
            }
        }

        Ok(entries)
    }

    fn rewrite_manifest(&self, valid: &HashMap<String, String>) -> Result<(), CacheError> {
        let mut buf = String::new();
        for (basename, hash) in valid {
            buf.push_str(basename);
            buf.push(' ');
            buf.push_str(hash);
            buf.push('\n');
        }

        crate::hash::atomic_write(&self.manifest_path, buf.as_bytes())?;
        Ok(())
    }

    fn cleanup(&self, valid: &HashMap<String, String>) -> Result<(), CacheError> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();

            if name == MANIFEST_NAME || valid.contains_key(&name) {
                continue;
            }

            log::warn!("removing untracked cache file {name}");
            let _ = fs::remove_file(entry.path());
        }
        Ok(())
    }

    fn scan_genes(&self, families: &[String], valid: &HashMap<String, String>) -> HashSet<String> {
        let mut genes = HashSet::new();

        for family in families {
            if !valid.contains_key(family) {
                continue;
            }

            if let Ok(text) = fs::read_to_string(self.dir.join(family)) {
                for line in text.lines() {
                    if let Some(header) = line.strip_prefix('>') {
                        genes.insert(header.trim().to_string());
                    }
                }
            }
        }

        genes
    }
}

fn count_fasta_records(path: &Path) -> Result<usize, CacheError> {
    let text = fs::read_to_string(path)?;
    Ok(text.lines().filter(|l| l.starts_with('>')).count())
}

fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fasta(records: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = String::new();
        for (name, seq) in records {
            buf.push('>');
            buf.push_str(name);
            buf.push('\n');
            buf.push_str(seq);
            buf.push('\n');
        }
        buf.into_bytes()
    }

    #[test]
    fn read_returns_unknown_family_for_an_untracked_basename() {
        let dir = tempdir().unwrap();
        let cache = FamilyCache::open(dir.path(), "fam_").unwrap();

        let err = cache.read("fam_ZZZZZZ").unwrap_err();
        assert!(matches!(err, CacheError::UnknownFamily(name) if name == "fam_ZZZZZZ"));
    }

    #[test]
    fn read_returns_committed_bytes_for_a_tracked_family() {
        let dir = tempdir().unwrap();
        let cache = FamilyCache::open(dir.path(), "fam_").unwrap();

        let name = cache.new_family_name();
        let bytes = fasta(&[("geneA", "ACGT")]);
        cache.append(&name, &bytes).unwrap();

        assert_eq!(cache.read(&name).unwrap(), bytes);
    }

    #[test]
    fn append_then_validate_round_trips_single_sequence_family() {
        let dir = tempdir().unwrap();
        let cache = FamilyCache::open(dir.path(), "fam_").unwrap();

        let name = cache.new_family_name();
        cache.append(&name, &fasta(&[("geneA", "ACGT")])).unwrap();

        let cache2 = FamilyCache::open(dir.path(), "fam_").unwrap();
        assert!(cache2.contains(&name));
        assert!(cache2.genes().contains("geneA"));
    }

    #[test]
    fn tampered_family_file_is_dropped_and_removed() {
        let dir = tempdir().unwrap();
        let cache = FamilyCache::open(dir.path(), "fam_").unwrap();

        let name = cache.new_family_name();
        cache.append(&name, &fasta(&[("geneA", "ACGT")])).unwrap();
        drop(cache);

        fs::write(dir.path().join(&name), b">geneA\nTAMPERED\n").unwrap();

        let cache2 = FamilyCache::open(dir.path(), "fam_").unwrap();
        assert!(!cache2.contains(&name));
        assert!(!dir.path().join(&name).exists());
    }

    #[test]
    fn family_with_two_sequences_and_missing_alignments_is_flagged_for_realign() {
        let dir = tempdir().unwrap();
        let cache = FamilyCache::open(dir.path(), "fam_").unwrap();

        let name = cache.new_family_name();
        cache
            .append(&name, &fasta(&[("geneA", "ACGT"), ("geneB", "ACGG")]))
            .unwrap();
        drop(cache);

        let cache2 = FamilyCache::open(dir.path(), "fam_").unwrap();
        assert!(cache2.contains(&name));
        assert!(cache2.families_needing_realignment().contains(&name));
    }

    #[test]
    fn complete_family_with_valid_alignments_is_not_flagged() {
        let dir = tempdir().unwrap();
        let cache = FamilyCache::open(dir.path(), "fam_").unwrap();

        let name = cache.new_family_name();
        cache
            .append(&name, &fasta(&[("geneA", "ACGT"), ("geneB", "ACGG")]))
            .unwrap();

        for suffix in ALIGNMENT_SUFFIXES {
            cache
                .append(&format!("{name}{suffix}"), b"alignment output")
                .unwrap();
        }
        drop(cache);

        let cache2 = FamilyCache::open(dir.path(), "fam_").unwrap();
        assert!(!cache2.families_needing_realignment().contains(&name));
        for suffix in ALIGNMENT_SUFFIXES {
            assert!(cache2.contains(&format!("{name}{suffix}")));
        }
    }

    #[test]
    fn untracked_file_is_removed_but_manifest_is_preserved() {
        let dir = tempdir().unwrap();
        let cache = FamilyCache::open(dir.path(), "fam_").unwrap();
        drop(cache);

        fs::write(dir.path().join("garbage.txt"), b"not tracked").unwrap();

        let cache2 = FamilyCache::open(dir.path(), "fam_").unwrap();
        assert!(!dir.path().join("garbage.txt").exists());
        assert!(dir.path().join(MANIFEST_NAME).exists());
        let _ = cache2;
    }

    #[test]
    fn malformed_manifest_lines_are_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(dir.path().join(MANIFEST_NAME), "not a valid line\n\nfam_AAAAAA badhash\n").unwrap();

        let cache = FamilyCache::open(dir.path(), "fam_").unwrap();
        assert!(cache.genes().is_empty());
    }
}
