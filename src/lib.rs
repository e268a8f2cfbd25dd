//! # genefam-align: a restartable gene-family alignment pipeline
//!
//! This crate coordinates assigning assembled contigs to reference genes by
//! similarity search, grouping them by gene family, and commissioning a
//! multiple-sequence alignment per family — while surviving crashes and
//! restarts at any point.
//!
//! ## What it does
//!
//! - Mints stable internal query identifiers for every contig ([`progress`])
//! - Persists contig → query → gene → family → alignment-file mappings
//!   across restarts, validating on restart that the reference database and
//!   input files have not silently changed ([`progress`])
//! - Drives a bounded pool of worker threads that run external tools
//!   ([`queue`], [`tool`])
//! - Maintains a content-addressed, self-validating cache of gene-family
//!   files and their alignment outputs ([`cache`])
//! - Wires all of the above into five idempotent pipeline stages
//!   ([`coordinator`])
//!
//! ## What it does not do
//!
//! The reference-database file format, the similarity-search tool, and the
//! alignment tool are external collaborators: this crate only specifies the
//! contract they must satisfy ([`db::FamilyDatabase`], [`tool::ToolBinary`]).
//! Argument parsing, logging configuration, and packaging are left to the
//! caller; this crate logs through the [`log`] facade and reports errors
//! through [`error::PipelineError`] so a caller can wire in whichever
//! subscriber and reporting format it prefers.
//!
//! ## Example
//!
//! ```no_run
//! use genefam_align::{Config, InputFile, Coordinator};
//! use genefam_align::db::{DbDescriptor, TsvFamilyDb};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), genefam_align::error::PipelineError> {
//! let db = Arc::new(TsvFamilyDb::load(
//!     "families.tsv",
//!     DbDescriptor {
//!         species: "human".into(),
//!         release: 104,
//!         filename: "families.db".into(),
//!         checksum: "deadbeefdeadbeefdeadbeefdeadbeef".into(),
//!     },
//! )?);
//!
//! let config = Config::builder()
//!     .alignment_dir("./run/alignment")
//!     .cache_dir("./run/cache")
//!     .db_filename("families.db")
//!     .add_input(InputFile::new("contigs.fa", "sampleA", "human"))
//!     .build();
//!
//! let coordinator = Coordinator::new(config, db)?;
//! let report = coordinator.run()?;
//! println!("{report:?}");
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod hash;
pub mod progress;
pub mod queue;
pub mod tool;

pub use cache::FamilyCache;
pub use config::{Config, ConfigBuilder, InputFile, ToolSpec};
pub use coordinator::{Coordinator, RunReport};
pub use db::{DbDescriptor, FamilyDatabase, TsvFamilyDb};
pub use error::{PipelineError, Result};
pub use progress::ProgressStore;
pub use queue::{Job, JobOutcome, WorkQueue};
pub use tool::{GenericTool, ToolBinary};
