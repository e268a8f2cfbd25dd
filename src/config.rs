//! Configuration options for the pipeline coordinator (component F) and its
//! collaborators.
//!
//! Follows this crate's builder idiom: construct defaults with
//! [`Config::builder`], override what you need, call `.build()`.

use std::path::PathBuf;

/// One input file the pipeline should ingest contigs from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    /// Absolute path to the input FASTA file.
    pub path: PathBuf,
    /// Short user-supplied label, unique across all configured inputs.
    pub label: String,
    /// Species the contigs in this file were assembled from.
    pub species: String,
}

impl InputFile {
    pub fn new(path: impl Into<PathBuf>, label: impl Into<String>, species: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            label: label.into(),
            species: species.into(),
        }
    }
}

/// Configuration for a full pipeline run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the progress store's four JSON files.
    pub alignment_dir: PathBuf,

    /// Directory holding the family cache and its manifest.
    pub cache_dir: PathBuf,

    /// Scratch directory for intermediate query/family files.
    pub temp_dir: PathBuf,

    /// Reference gene-family database filename (opaque to the coordinator;
    /// passed through to component G).
    pub db_filename: PathBuf,

    /// Contig files to ingest.
    pub inputs: Vec<InputFile>,

    /// Worker thread count; `0` means "use logical core count".
    pub workers: usize,

    /// Prefix prepended to the random 6-character family file basenames.
    pub family_prefix: String,

    /// Program name or explicit path for the similarity-search tool.
    pub search_tool: ToolSpec,

    /// Program name or explicit path for the alignment tool.
    pub align_tool: ToolSpec,
}

/// Where to find an external tool: by name on `$PATH`, or an explicit path.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub program: String,
    pub explicit_path: Option<PathBuf>,
}

impl ToolSpec {
    pub fn named(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            explicit_path: None,
        }
    }

    pub fn at_path(program: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            explicit_path: Some(path.into()),
        }
    }
}

impl Config {
    /// Creates a new configuration builder.
    ///
    /// # Example
    /// ```
    /// use genefam_align::Config;
    ///
    /// let config = Config::builder()
    ///     .alignment_dir("/tmp/align")
    ///     .cache_dir("/tmp/cache")
    ///     .db_filename("/data/families.db")
    ///     .build();
    /// ```
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for constructing [`Config`] instances.
#[derive(Debug)]
pub struct ConfigBuilder {
    config: Config,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            config: Config {
                alignment_dir: PathBuf::from("./alignment"),
                cache_dir: PathBuf::from("./cache"),
                temp_dir: std::env::temp_dir(),
                db_filename: PathBuf::new(),
                inputs: Vec::new(),
                workers: num_cpus::get().max(1),
                family_prefix: "fam_".to_string(),
                search_tool: ToolSpec::named("blastx"),
                align_tool: ToolSpec::named("pagan"),
            },
        }
    }
}

impl ConfigBuilder {
    /// Directory for the progress store's JSON files.
    pub fn alignment_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.alignment_dir = path.into();
        self
    }

    /// Directory for the family cache and manifest.
    pub fn cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = path.into();
        self
    }

    /// Scratch directory for intermediate files.
    pub fn temp_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.temp_dir = path.into();
        self
    }

    /// Reference gene-family database filename.
    pub fn db_filename(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.db_filename = path.into();
        self
    }

    /// Add one input file descriptor.
    pub fn add_input(mut self, input: InputFile) -> Self {
        self.config.inputs.push(input);
        self
    }

    /// Replace the whole input-file list.
    pub fn inputs(mut self, inputs: Vec<InputFile>) -> Self {
        self.config.inputs = inputs;
        self
    }

    /// Worker thread count. `0` resolves to the logical core count at
    /// queue construction time.
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Prefix for family file basenames.
    pub fn family_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.family_prefix = prefix.into();
        self
    }

    /// Similarity-search tool program name or path.
    pub fn search_tool(mut self, tool: ToolSpec) -> Self {
        self.config.search_tool = tool;
        self
    }

    /// Alignment tool program name or path.
    pub fn align_tool(mut self, tool: ToolSpec) -> Self {
        self.config.align_tool = tool;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
