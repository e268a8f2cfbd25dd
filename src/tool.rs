//! External-tool driver (component B).
//!
//! Wraps invocation of the similarity-search tool, the alignment tool, and
//! any other child process the pipeline depends on behind one small
//! capability trait so concrete tools differ only in their argument
//! vectors, not in how they are launched, waited on, or probed for a
//! version string.

use crate::error::ToolError;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Outcome of running a child process to completion.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit_code: i32,
    pub combined_output: Vec<u8>,
}

/// A capability set shared by every external tool this pipeline shells out
/// to. Concrete searchers/aligners implement this with their own name and
/// binary resolution, and inherit `run`/`version` from [`ExternalTool`].
pub trait ToolBinary {
    /// The tool's display name, e.g. `"blastx"`. Also the first token the
    /// version probe looks for in the probe's output.
    fn name(&self) -> &str;

    /// Path to the binary, resolved once at construction time.
    fn binary_path(&self) -> &std::path::Path;

    /// Argument that asks the tool to print its version, e.g. `"-version"`.
    fn version_flag(&self) -> &str {
        "-version"
    }

    /// Run the tool with `args`, feeding it `stdin_bytes`, and capture
    /// stdout+stderr combined. Never kills on non-zero exit; the caller
    /// classifies the result. Inherited file descriptors beyond the three
    /// standard streams are not passed to the child.
    fn run(&self, args: &[String], stdin_bytes: &[u8]) -> Result<RunOutput, ToolError> {
        use std::io::Write;

        let mut child = Command::new(self.binary_path())
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    ToolError::NotFound(self.name().to_string())
                } else {
                    ToolError::Launch {
                        name: self.name().to_string(),
                        source,
                    }
                }
            })?;

        if !stdin_bytes.is_empty() {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(stdin_bytes);
            }
        } else {
            drop(child.stdin.take());
        }

        let output = child.wait_with_output().map_err(ToolError::Io)?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);

        Ok(RunOutput {
            exit_code: output.status.code().unwrap_or(-1),
            combined_output: combined,
        })
    }

    /// Invoke the tool's version probe and parse the first output line
    /// that begins with [`ToolBinary::name`]; the version is the line's
    /// last whitespace-delimited token with one trailing punctuation
    /// character stripped.
    fn version(&self) -> Result<String, ToolError> {
        let flag = self.version_flag().to_string();
        let output = self.run(&[flag], &[])?;
        let text = String::from_utf8_lossy(&output.combined_output);

        for line in text.lines() {
            if line.starts_with(self.name()) {
                if let Some(token) = line.split_whitespace().last() {
                    let mut v = token.to_string();
                    if v.chars().last().is_some_and(|c| c.is_ascii_punctuation()) {
                        v.pop();
                    }
                    return Ok(v);
                }
            }
        }

        Err(ToolError::UnparseableVersion(self.name().to_string()))
    }
}

/// Resolve a tool binary: an explicit configured path wins, otherwise
/// fall back to a `$PATH` lookup by program name.
pub fn resolve_binary(name: &str, configured_path: Option<&std::path::Path>) -> Result<PathBuf, ToolError> {
    if let Some(path) = configured_path {
        return Ok(path.to_path_buf());
    }

    which::which(name).map_err(|_| ToolError::NotFound(name.to_string()))
}

/// A generic [`ToolBinary`] built from a resolved path and a name; used for
/// both the configured searcher and aligner so no bespoke struct is needed
/// per tool.
#[derive(Debug, Clone)]
pub struct GenericTool {
    name: String,
    path: PathBuf,
}

impl GenericTool {
    pub fn new(name: impl Into<String>, configured_path: Option<&std::path::Path>) -> Result<Self, ToolError> {
        let name = name.into();
        let path = resolve_binary(&name, configured_path)?;
        Ok(Self { name, path })
    }
}

impl ToolBinary for GenericTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn binary_path(&self) -> &std::path::Path {
        &self.path
    }
}
