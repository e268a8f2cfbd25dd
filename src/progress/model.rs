//! JSON-serializable shapes of the four progress files.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Sentinel value recorded for a query with no search hit, or a family
/// whose alignment attempt failed.
pub const FAIL: &str = "FAIL";

/// Contents of `parameters.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Params {
    pub db_species: String,
    pub db_release: u32,
    pub db_filename: String,
    pub db_checksum: String,
    /// absolute path -> (label, species, content checksum)
    pub contig_files: HashMap<String, (String, String, String)>,
}

impl Params {
    /// `sorted([db_checksum] + [every input checksum])`, used to compare
    /// a stored and a current `Params` for the restart invariant.
    pub fn checksum_fingerprint(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .contig_files
            .values()
            .map(|(_, _, checksum)| checksum.clone())
            .collect();
        all.push(self.db_checksum.clone());
        all.sort();
        all
    }

    pub fn describe(&self) -> String {
        let mut out = format!("{}/{}\n", self.db_species, self.db_release);
        let mut paths: Vec<&String> = self.contig_files.keys().collect();
        paths.sort();
        for path in paths {
            let (label, species, checksum) = &self.contig_files[path];
            out.push_str(&format!(
                "\t{path} label={label} species={species} checksum={checksum}\n"
            ));
        }
        out
    }
}
