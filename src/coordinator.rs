//! Pipeline coordinator (component F).
//!
//! Wires the progress store, family cache, work queue, external-tool
//! driver, and reference-database adapter together into the five-stage
//! restartable pipeline: ingest, search, group, align, barrier. Every
//! stage only does the work the progress store does not already know
//! about, so calling [`Coordinator::run`] again after a crash resumes
//! rather than redoes.

use crate::cache::{FamilyCache, ALIGNMENT_SUFFIXES};
use crate::config::Config;
use crate::db::FamilyDatabase;
use crate::error::PipelineError;
use crate::hash;
use crate::progress::{ProgressStore, FAIL};
use crate::queue::{Job, JobOutcome, WorkQueue};
use crate::tool::{GenericTool, ToolBinary};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Outcome of one `run()` call: how many families have a committed
/// alignment, how many have given up with `FAIL`, and how many still have
/// no verdict at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub completed: usize,
    pub failed: usize,
    pub outstanding: usize,
}

/// Drives the pipeline's stages over one configured run.
pub struct Coordinator {
    config: Config,
    progress: Arc<ProgressStore>,
    cache: Arc<FamilyCache>,
    db: Arc<dyn FamilyDatabase>,
    search_tool: Arc<dyn ToolBinary + Send + Sync>,
    align_tool: Arc<dyn ToolBinary + Send + Sync>,
    queue: WorkQueue<PipelineJob>,
    launch_failure: Arc<Mutex<Option<String>>>,
}

impl Coordinator {
    /// Open every collaborator named in `config`, resolving the search and
    /// align tool binaries from `$PATH` or their configured explicit paths.
    pub fn new(config: Config, db: Arc<dyn FamilyDatabase>) -> Result<Self, PipelineError> {
        let search_tool = GenericTool::new(
            config.search_tool.program.clone(),
            config.search_tool.explicit_path.as_deref(),
        )?;
        let align_tool = GenericTool::new(
            config.align_tool.program.clone(),
            config.align_tool.explicit_path.as_deref(),
        )?;

        Self::with_tools(config, db, Arc::new(search_tool), Arc::new(align_tool))
    }

    /// Same as [`Coordinator::new`] but with the search/align tools
    /// supplied directly, bypassing `$PATH` resolution. Exists so tests and
    /// alternate deployments can swap in an in-process [`ToolBinary`]
    /// without shelling out to a real bioinformatics binary.
    pub fn with_tools(
        config: Config,
        db: Arc<dyn FamilyDatabase>,
        search_tool: Arc<dyn ToolBinary + Send + Sync>,
        align_tool: Arc<dyn ToolBinary + Send + Sync>,
    ) -> Result<Self, PipelineError> {
        let progress = Arc::new(ProgressStore::open(&config.alignment_dir, db.as_ref(), &config.inputs)?);
        let cache = Arc::new(FamilyCache::open(&config.cache_dir, config.family_prefix.clone())?);
        let queue = WorkQueue::new(config.workers);

        Ok(Self {
            config,
            progress,
            cache,
            db,
            search_tool,
            align_tool,
            queue,
            launch_failure: Arc::new(Mutex::new(None)),
        })
    }

    /// Run every stage once, doing only the work the progress store does
    /// not already record. Returns the families-aligned report, or a fatal
    /// [`PipelineError`] if a tool binary disappeared mid-run (the queue is
    /// always flushed to the progress store before this returns, success or
    /// failure).
    ///
    /// The barrier step (spec §4.F stage 5) drains the work queue and joins
    /// every worker thread before returning, on every exit path including
    /// an early stage error — a `Coordinator` is meant for a single `run()`
    /// call per process, mirroring this crate's restart model (a restart is
    /// a fresh process and a fresh `Coordinator`, not a second `run()` on
    /// the same instance).
    pub fn run(&self) -> Result<RunReport, PipelineError> {
        log::info!("pipeline run starting");

        let stages = (|| -> Result<(), PipelineError> {
            let sequences = self.ingest()?;
            self.search(&sequences)?;
            self.align(&sequences)?;
            Ok(())
        })();

        // Barrier: drain the queue and join every worker thread so none
        // outlives this run, regardless of whether the stages above
        // succeeded.
        self.queue.join();

        self.progress.flush()?;
        stages?;

        if let Some(reason) = self.launch_failure.lock().unwrap().take() {
            return Err(PipelineError::Other(format!(
                "tool launch failed, pipeline stopped: {reason}"
            )));
        }

        let report = self.report();
        log::info!("pipeline run finished: {report:?}");
        Ok(report)
    }

    /// Current `(completed, failed, outstanding)` counts without running
    /// any further work.
    pub fn report(&self) -> RunReport {
        let families = self.progress.families_to_align(self.db.as_ref());
        let (not_done, failed) = self.progress.alignments_remaining(self.db.as_ref());
        let completed = families.len().saturating_sub(not_done).saturating_sub(failed);

        RunReport {
            completed,
            failed,
            outstanding: not_done,
        }
    }

    /// Stage 1: mint/look up a query id for every contig in every input
    /// file. Returns every query id's sequence so later stages can
    /// materialize query and family files without re-reading the inputs.
    fn ingest(&self) -> Result<HashMap<String, String>, PipelineError> {
        let mut sequences = HashMap::new();

        for input in &self.config.inputs {
            let records = read_fasta(&input.path)?;
            for (contig_id, seq) in records {
                let query_id = self.progress.query_for(&input.label, &contig_id);
                sequences.insert(query_id, seq);
            }
        }

        Ok(sequences)
    }

    /// Stage 2: submit one search job covering every pending query, then
    /// fold its hit file back into the progress store.
    fn search(&self, sequences: &HashMap<String, String>) -> Result<(), PipelineError> {
        let pending = self.progress.pending_queries();
        if pending.is_empty() {
            return Ok(());
        }

        hash::ensure_dir(&self.config.temp_dir)?;
        let query_path = self.config.temp_dir.join("queries.fa");
        write_fasta(&query_path, &pending, sequences)?;

        let hit_path = self.config.temp_dir.join("hits.tsv");

        let job = PipelineJob::Search(SearchJob {
            tool: Arc::clone(&self.search_tool),
            query_path: query_path.clone(),
            db_filename: self.config.db_filename.clone(),
            hit_path: hit_path.clone(),
            launch_failure: Arc::clone(&self.launch_failure),
        });

        self.queue.submit(job)?;
        self.queue.wait();

        let hits = parse_hit_file(&hit_path)?;
        let pending_set: std::collections::HashSet<&String> = pending.iter().collect();

        let mut batch: HashMap<String, String> = HashMap::new();
        for (query_id, gene_id) in hits {
            if pending_set.contains(&query_id) {
                batch.entry(query_id).or_insert(gene_id);
            }
        }
        for q in &pending {
            batch.entry(q.clone()).or_insert_with(|| FAIL.to_string());
        }

        self.progress.update_query_gene(batch);
        Ok(())
    }

    /// Stages 3 & 4: bucket resolved genes into families, materialize any
    /// family not yet attempted into the cache, and enqueue its alignment
    /// job.
    fn align(&self, sequences: &HashMap<String, String>) -> Result<(), PipelineError> {
        let families = self.progress.families_to_align(self.db.as_ref());
        hash::ensure_dir(&self.config.temp_dir)?;

        for (family_id, query_ids) in families {
            if self.progress.family_file(&family_id).is_some() {
                continue;
            }

            let basename = self.cache.new_family_name();
            let fasta = render_fasta(&query_ids, sequences);
            self.cache.append(&basename, fasta.as_bytes())?;

            let job = PipelineJob::Align(AlignJob {
                tool: Arc::clone(&self.align_tool),
                family_id,
                basename,
                cache: Arc::clone(&self.cache),
                progress: Arc::clone(&self.progress),
                temp_dir: self.config.temp_dir.clone(),
                launch_failure: Arc::clone(&self.launch_failure),
            });

            self.queue.submit(job)?;
        }

        Ok(())
    }
}

impl Drop for Coordinator {
    /// Defensive cleanup for callers that construct a `Coordinator` and
    /// never call [`Coordinator::run`] (e.g. one that only calls
    /// [`Coordinator::report`]): without this, the worker pool's threads
    /// would loop forever past the `Coordinator`'s own lifetime. A no-op if
    /// `run()` already joined the pool.
    fn drop(&mut self) {
        self.queue.join();
    }
}

enum PipelineJob {
    Search(SearchJob),
    Align(AlignJob),
}

impl Job for PipelineJob {
    fn run(&self) -> JobOutcome {
        match self {
            PipelineJob::Search(job) => job.run(),
            PipelineJob::Align(job) => job.run(),
        }
    }

    fn describe(&self) -> String {
        match self {
            PipelineJob::Search(_) => "search".to_string(),
            PipelineJob::Align(job) => format!("align:{}", job.family_id),
        }
    }
}

struct SearchJob {
    tool: Arc<dyn ToolBinary + Send + Sync>,
    query_path: PathBuf,
    db_filename: PathBuf,
    hit_path: PathBuf,
    launch_failure: Arc<Mutex<Option<String>>>,
}

impl SearchJob {
    fn run(&self) -> JobOutcome {
        let args = vec![
            "-query".to_string(),
            self.query_path.display().to_string(),
            "-db".to_string(),
            self.db_filename.display().to_string(),
            "-out".to_string(),
            self.hit_path.display().to_string(),
            "-max_target_seqs".to_string(),
            "1".to_string(),
            "-outfmt".to_string(),
            "6".to_string(),
        ];

        match self.tool.run(&args, &[]) {
            Ok(out) if out.exit_code == 0 => JobOutcome::Ok,
            Ok(out) => {
                log::warn!("search tool exited with status {}", out.exit_code);
                JobOutcome::Failed
            }
            Err(e) => {
                log::error!("search tool failed to launch: {e}");
                *self.launch_failure.lock().unwrap() = Some(e.to_string());
                JobOutcome::Terminated
            }
        }
    }
}

struct AlignJob {
    tool: Arc<dyn ToolBinary + Send + Sync>,
    family_id: String,
    basename: String,
    cache: Arc<FamilyCache>,
    progress: Arc<ProgressStore>,
    temp_dir: PathBuf,
    launch_failure: Arc<Mutex<Option<String>>>,
}

impl AlignJob {
    fn run(&self) -> JobOutcome {
        let bytes = match self.cache.read(&self.basename) {
            Ok(b) => b,
            Err(e) => {
                log::warn!("could not read family file {}: {e}", self.basename);
                self.progress.put_family_file(&self.family_id, FAIL);
                return JobOutcome::Failed;
            }
        };

        let temp_input = self.temp_dir.join(&self.basename);
        if let Err(e) = fs::write(&temp_input, &bytes) {
            log::warn!("could not stage family file {}: {e}", self.basename);
            self.progress.put_family_file(&self.family_id, FAIL);
            return JobOutcome::Failed;
        }

        let args = vec![temp_input.display().to_string()];
        let output = match self.tool.run(&args, &[]) {
            Ok(out) => out,
            Err(e) => {
                log::error!("alignment tool failed to launch: {e}");
                *self.launch_failure.lock().unwrap() = Some(e.to_string());
                return JobOutcome::Terminated;
            }
        };

        if output.exit_code != 0 {
            log::warn!("alignment tool exited with status {} for {}", output.exit_code, self.family_id);
            self.progress.put_family_file(&self.family_id, FAIL);
            return JobOutcome::Failed;
        }

        for suffix in ALIGNMENT_SUFFIXES {
            let produced = PathBuf::from(format!("{}{suffix}", temp_input.display()));
            let artifact = match fs::read(&produced) {
                Ok(bytes) => bytes,
                Err(_) => {
                    log::warn!("alignment tool did not produce {produced:?}");
                    self.progress.put_family_file(&self.family_id, FAIL);
                    return JobOutcome::Failed;
                }
            };

            if let Err(e) = self.cache.append(&format!("{}{suffix}", self.basename), &artifact) {
                log::warn!("could not commit alignment artifact for {}: {e}", self.family_id);
                self.progress.put_family_file(&self.family_id, FAIL);
                return JobOutcome::Failed;
            }
        }

        self.progress.put_family_file(&self.family_id, &self.basename);
        JobOutcome::Ok
    }
}

fn read_fasta(path: &Path) -> io::Result<Vec<(String, String)>> {
    let text = fs::read_to_string(path)?;
    let mut records = Vec::new();
    let mut current_id: Option<String> = None;
    let mut current_seq = String::new();

    for line in text.lines() {
        if let Some(header) = line.strip_prefix('>') {
            if let Some(id) = current_id.take() {
                records.push((id, std::mem::take(&mut current_seq)));
            }
            current_id = Some(header.trim().to_string());
        } else {
            current_seq.push_str(line.trim());
        }
    }

    if let Some(id) = current_id.take() {
        records.push((id, current_seq));
    }

    Ok(records)
}

fn write_fasta(path: &Path, ids: &[String], sequences: &HashMap<String, String>) -> io::Result<()> {
    fs::write(path, render_fasta(ids, sequences))
}

fn render_fasta(ids: &[String], sequences: &HashMap<String, String>) -> String {
    let mut buf = String::new();
    for id in ids {
        if let Some(seq) = sequences.get(id) {
            buf.push('>');
            buf.push_str(id);
            buf.push('\n');
            buf.push_str(seq);
            buf.push('\n');
        }
    }
    buf
}

fn parse_hit_file(path: &Path) -> io::Result<Vec<(String, String)>> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut hits = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            log::warn!("hit file line {} is malformed: {line:?}", lineno + 1);
            continue;
        }

        hits.push((fields[0].to_string(), fields[1].to_string()));
    }

    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputFile;
    use crate::db::{DbDescriptor, TsvFamilyDb};
    use crate::tool::RunOutput;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use tempfile::tempdir;

    struct FakeSearchTool {
        hits: HashMap<String, String>,
    }

    impl ToolBinary for FakeSearchTool {
        fn name(&self) -> &str {
            "fakesearch"
        }

        fn binary_path(&self) -> &Path {
            Path::new("fakesearch")
        }

        fn run(&self, args: &[String], _stdin_bytes: &[u8]) -> Result<RunOutput, crate::error::ToolError> {
            let out_idx = args.iter().position(|a| a == "-out").unwrap() + 1;
            let out_path = PathBuf::from(&args[out_idx]);

            let mut buf = String::new();
            for (query_id, gene_id) in &self.hits {
                buf.push_str(&format!("{query_id}\t{gene_id}\t100.0\t50\n"));
            }
            fs::write(&out_path, buf).unwrap();

            Ok(RunOutput {
                exit_code: 0,
                combined_output: Vec::new(),
            })
        }
    }

    struct FakeAlignTool {
        should_fail: bool,
    }

    impl ToolBinary for FakeAlignTool {
        fn name(&self) -> &str {
            "fakealign"
        }

        fn binary_path(&self) -> &Path {
            Path::new("fakealign")
        }

        fn run(&self, args: &[String], _stdin_bytes: &[u8]) -> Result<RunOutput, crate::error::ToolError> {
            if self.should_fail {
                return Ok(RunOutput {
                    exit_code: 1,
                    combined_output: Vec::new(),
                });
            }

            let input_path = PathBuf::from(&args[0]);
            for suffix in ALIGNMENT_SUFFIXES {
                let out_path = PathBuf::from(format!("{}{suffix}", input_path.display()));
                fs::write(&out_path, b"aligned").unwrap();
            }

            Ok(RunOutput {
                exit_code: 0,
                combined_output: Vec::new(),
            })
        }
    }

    fn write_input(dir: &Path, name: &str, records: &[(&str, &str)]) -> InputFile {
        let mut buf = String::new();
        for (id, seq) in records {
            buf.push('>');
            buf.push_str(id);
            buf.push('\n');
            buf.push_str(seq);
            buf.push('\n');
        }
        let path = dir.join(name);
        fs::write(&path, buf).unwrap();
        InputFile::new(path, name.trim_end_matches(".fa"), "human")
    }

    fn descriptor() -> DbDescriptor {
        DbDescriptor {
            species: "human".into(),
            release: 1,
            filename: "families.db".into(),
            checksum: "dbsum".into(),
        }
    }

    #[test]
    fn fresh_run_resolves_and_aligns_one_family() {
        let _ = env_logger::try_init();
        let dir = tempdir().unwrap();
        let input = write_input(dir.path(), "A.fa", &[("c1", "ACGT"), ("c2", "ACGG")]);

        let db = Arc::new(TsvFamilyDb::from_pairs(
            descriptor(),
            [("gX".to_string(), "fam1".to_string())],
        ));

        let config = Config::builder()
            .alignment_dir(dir.path().join("align"))
            .cache_dir(dir.path().join("cache"))
            .temp_dir(dir.path().join("tmp"))
            .db_filename("families.db")
            .add_input(input)
            .workers(2)
            .build();

        let search_tool: Arc<dyn ToolBinary + Send + Sync> = Arc::new(FakeSearchTool {
            hits: HashMap::from([
                ("query1".to_string(), "gX".to_string()),
                ("query2".to_string(), "gX".to_string()),
            ]),
        });
        let align_tool: Arc<dyn ToolBinary + Send + Sync> = Arc::new(FakeAlignTool { should_fail: false });

        let coordinator = Coordinator::with_tools(config, db, search_tool, align_tool).unwrap();
        let report = coordinator.run().unwrap();

        assert_eq!(report, RunReport { completed: 1, failed: 0, outstanding: 0 });
    }

    #[test]
    fn alignment_failure_is_recorded_and_not_retried() {
        let dir = tempdir().unwrap();
        let input = write_input(dir.path(), "A.fa", &[("c1", "ACGT"), ("c2", "ACGG")]);

        let db = Arc::new(TsvFamilyDb::from_pairs(
            descriptor(),
            [("gX".to_string(), "fam1".to_string())],
        ));

        let config = Config::builder()
            .alignment_dir(dir.path().join("align"))
            .cache_dir(dir.path().join("cache"))
            .temp_dir(dir.path().join("tmp"))
            .db_filename("families.db")
            .add_input(input.clone())
            .workers(1)
            .build();

        let search_tool: Arc<dyn ToolBinary + Send + Sync> = Arc::new(FakeSearchTool {
            hits: HashMap::from([
                ("query1".to_string(), "gX".to_string()),
                ("query2".to_string(), "gX".to_string()),
            ]),
        });
        let align_tool: Arc<dyn ToolBinary + Send + Sync> = Arc::new(FakeAlignTool { should_fail: true });

        let coordinator = Coordinator::with_tools(config, Arc::clone(&db), search_tool, align_tool).unwrap();
        let report = coordinator.run().unwrap();
        assert_eq!(report, RunReport { completed: 0, failed: 1, outstanding: 0 });

        drop(coordinator);

        // restarting must not retry the failed family: a search tool that
        // would panic if invoked again proves the search stage is skipped
        // too, since every query already has a verdict.
        struct PanicTool;
        impl ToolBinary for PanicTool {
            fn name(&self) -> &str {
                "panic"
            }
            fn binary_path(&self) -> &Path {
                Path::new("panic")
            }
            fn run(&self, _args: &[String], _stdin_bytes: &[u8]) -> Result<RunOutput, crate::error::ToolError> {
                panic!("should not run on restart with nothing pending");
            }
        }

        let config2 = Config::builder()
            .alignment_dir(dir.path().join("align"))
            .cache_dir(dir.path().join("cache"))
            .temp_dir(dir.path().join("tmp"))
            .db_filename("families.db")
            .add_input(input)
            .workers(1)
            .build();

        let coordinator2 = Coordinator::with_tools(config2, db, Arc::new(PanicTool), Arc::new(PanicTool)).unwrap();
        let report2 = coordinator2.run().unwrap();
        assert_eq!(report2, RunReport { completed: 0, failed: 1, outstanding: 0 });
    }

    #[test]
    fn pending_queries_survive_a_restart_before_search_completes() {
        let dir = tempdir().unwrap();
        let input = write_input(dir.path(), "A.fa", &[("c1", "ACGT"), ("c2", "ACGG")]);

        let db = Arc::new(TsvFamilyDb::from_pairs(descriptor(), []));

        let config = Config::builder()
            .alignment_dir(dir.path().join("align"))
            .cache_dir(dir.path().join("cache"))
            .temp_dir(dir.path().join("tmp"))
            .db_filename("families.db")
            .add_input(input.clone())
            .workers(1)
            .build();

        let coordinator = Coordinator::with_tools(
            config,
            Arc::clone(&db),
            Arc::new(FakeSearchTool { hits: HashMap::new() }),
            Arc::new(FakeAlignTool { should_fail: false }),
        )
        .unwrap();

        // only ingest, as if the process crashed before the search job ran.
        let sequences = coordinator.ingest().unwrap();
        assert_eq!(sequences.len(), 2);

        let pending: HashSet<String> = coordinator.progress.pending_queries().into_iter().collect();
        assert_eq!(pending, HashSet::from(["query1".to_string(), "query2".to_string()]));

        drop(coordinator);

        let config2 = Config::builder()
            .alignment_dir(dir.path().join("align"))
            .cache_dir(dir.path().join("cache"))
            .temp_dir(dir.path().join("tmp"))
            .db_filename("families.db")
            .add_input(input)
            .workers(1)
            .build();

        let coordinator2 = Coordinator::with_tools(
            config2,
            db,
            Arc::new(FakeSearchTool { hits: HashMap::new() }),
            Arc::new(FakeAlignTool { should_fail: false }),
        )
        .unwrap();

        let pending2: HashSet<String> = coordinator2.progress.pending_queries().into_iter().collect();
        assert_eq!(pending2, pending);
    }
}
