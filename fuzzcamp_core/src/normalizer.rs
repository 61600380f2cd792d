//! Turns the transaction log written by the test harness into a JSON array.
//!
//! The harness appends one pretty-printed object per transaction with nothing
//! between records except a newline. Records are located with a streaming JSON
//! tokenizer rather than by matching `}\n{`, so a nested value that happens to
//! end one line with `}` and start the next with `{` cannot split a record.
//! Each record's bytes are copied through untouched.

use crate::executor::CapturedOutput;
use crate::registry::SetupRegistry;
use serde_json::value::RawValue;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum NormalizeError {
    /// The setup reference has no usable final path segment.
    #[error("Cannot derive a setup name from `{0}`")]
    InvalidSetupRef(String),

    /// Record `index` (0-based) is not valid JSON, or the log is truncated.
    #[error("Malformed transaction log record #{index}: {source}")]
    Malformed {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Record `index` parsed as JSON but is not an object.
    #[error("Transaction log record #{index} is not a JSON object")]
    NotAnObject { index: usize },

    #[error("Failed to launch test harness `{program}`: {source}")]
    HarnessLaunch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl NormalizeError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self {
        move |source| NormalizeError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Final path segment of `setup_ref` up to its first `.`, so
/// `fuzzing/setups/erc20.spec.js` gives `erc20`.
pub fn setup_name(setup_ref: &str) -> Option<&str> {
    let segment = setup_ref.rsplit(['/', '\\']).next()?;
    let name = segment.split('.').next()?;
    if name.is_empty() { None } else { Some(name) }
}

/// `{invariants}_{setup_name}`, the key shared by every file of a bundle.
pub fn base_name(invariants: &str, setup_ref: &str) -> Result<String, NormalizeError> {
    let setup = setup_name(setup_ref)
        .ok_or_else(|| NormalizeError::InvalidSetupRef(setup_ref.to_string()))?;
    Ok(format!("{invariants}_{setup}"))
}

/// The three co-located files of one invariants/setup pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePaths {
    /// `{base}.log`, appended to by the harness.
    pub raw_log: PathBuf,
    /// `{base}.json`, the normalized array.
    pub normalized: PathBuf,
    /// `{base}.yaml`. Reserved for the fuzzer config snapshot, which another
    /// tool writes; this pipeline only reports the location.
    pub config_snapshot: PathBuf,
}

impl BundlePaths {
    pub fn new(output_dir: &Path, base_name: &str) -> Self {
        Self {
            raw_log: output_dir.join(format!("{base_name}.log")),
            normalized: output_dir.join(format!("{base_name}.json")),
            config_snapshot: output_dir.join(format!("{base_name}.yaml")),
        }
    }
}

/// A normalized log held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedLog {
    pub text: String,
    pub records: usize,
}

/// Rewrites concatenated JSON objects into a JSON array, preserving order and
/// the exact text of every record.
///
/// An empty (or whitespace-only) log becomes `[]`. Truncated or non-object
/// records are errors.
pub fn normalize_log(raw: &str) -> Result<NormalizedLog, NormalizeError> {
    let mut records: Vec<&str> = Vec::new();
    let stream = serde_json::Deserializer::from_str(raw).into_iter::<&RawValue>();
    for (index, item) in stream.enumerate() {
        let record = item.map_err(|source| NormalizeError::Malformed { index, source })?;
        if !record.get().starts_with('{') {
            return Err(NormalizeError::NotAnObject { index });
        }
        records.push(record.get());
    }

    let text = if records.is_empty() {
        "[]\n".to_string()
    } else {
        format!("[\n{}\n]\n", records.join(",\n"))
    };
    Ok(NormalizedLog {
        text,
        records: records.len(),
    })
}

/// Runs the external test harness for one setup script, with the harness
/// appending transaction records to `tx_log`.
///
/// A harness that ran and exited unsuccessfully still returns `Ok`; only a
/// harness that could not be started is an error.
pub trait TestHarness {
    fn run_setup(&mut self, setup_ref: &str, tx_log: &Path)
    -> Result<CapturedOutput, NormalizeError>;
}

/// A `TestHarness` spawning a command such as `pnpm mocha <setup>` with the log
/// path passed through an environment variable.
#[derive(Debug, Clone)]
pub struct CommandHarness {
    command: Vec<String>,
    log_env: String,
}

impl CommandHarness {
    /// `command` must hold at least the program name.
    pub fn new(command: Vec<String>, log_env: impl Into<String>) -> Self {
        Self {
            command,
            log_env: log_env.into(),
        }
    }
}

impl TestHarness for CommandHarness {
    fn run_setup(
        &mut self,
        setup_ref: &str,
        tx_log: &Path,
    ) -> Result<CapturedOutput, NormalizeError> {
        let (program, args) = self.command.split_first().ok_or_else(|| {
            NormalizeError::HarnessLaunch {
                program: String::new(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty harness command"),
            }
        })?;
        debug!(%program, ?args, setup_ref, "running test harness");
        let output = Command::new(program)
            .args(args)
            .arg(setup_ref)
            .env(&self.log_env, tx_log)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| NormalizeError::HarnessLaunch {
                program: program.clone(),
                source,
            })?;

        let captured = CapturedOutput::from_output(output);
        captured.echo();
        Ok(captured)
    }
}

/// Outputs of one normalization run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedArtifactBundle {
    pub base_name: String,
    pub paths: BundlePaths,
    pub records: usize,
}

pub struct TxLogNormalizer {
    output_dir: PathBuf,
    harness: Box<dyn TestHarness>,
}

impl TxLogNormalizer {
    pub fn new(output_dir: impl Into<PathBuf>, harness: Box<dyn TestHarness>) -> Self {
        Self {
            output_dir: output_dir.into(),
            harness,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Runs the harness for one pairing and writes `{base}.json` next to the
    /// raw log.
    pub fn normalize(
        &mut self,
        invariants: &str,
        setup_ref: &str,
    ) -> Result<NormalizedArtifactBundle, NormalizeError> {
        let base_name = base_name(invariants, setup_ref)?;
        let paths = BundlePaths::new(&self.output_dir, &base_name);

        fs::create_dir_all(&self.output_dir).map_err(NormalizeError::io(&self.output_dir))?;
        // The harness appends, so a log left over from an earlier run would be
        // duplicated into this one.
        match fs::remove_file(&paths.raw_log) {
            Ok(()) => debug!(path = %paths.raw_log.display(), "removed stale raw log"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(NormalizeError::io(&paths.raw_log)(e)),
        }

        let captured = self.harness.run_setup(setup_ref, &paths.raw_log)?;
        if !captured.success() {
            // Records logged before a failing assertion are still valid.
            warn!(
                setup_ref,
                status = %captured.status(),
                "test harness exited unsuccessfully, normalizing its log anyway"
            );
        }

        // The harness only creates the log on its first write.
        let raw = match fs::read_to_string(&paths.raw_log) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(NormalizeError::io(&paths.raw_log)(e)),
        };
        let normalized = normalize_log(&raw)?;
        write_atomically(&self.output_dir, &paths.normalized, &normalized.text)?;

        info!(
            base_name = %base_name,
            records = normalized.records,
            path = %paths.normalized.display(),
            "normalized transaction log"
        );
        Ok(NormalizedArtifactBundle {
            base_name,
            paths,
            records: normalized.records,
        })
    }

    /// Normalizes every pairing in registry order, stopping at the first error.
    pub fn normalize_all(
        &mut self,
        setups: &SetupRegistry,
    ) -> Result<Vec<NormalizedArtifactBundle>, NormalizeError> {
        setups
            .iter()
            .map(|entry| self.normalize(&entry.invariants, &entry.setup_ref))
            .collect()
    }
}

fn write_atomically(dir: &Path, path: &Path, contents: &str) -> Result<(), NormalizeError> {
    let mut tmp = NamedTempFile::new_in(dir).map_err(NormalizeError::io(dir))?;
    tmp.write_all(contents.as_bytes())
        .map_err(NormalizeError::io(tmp.path()))?;
    tmp.persist(path)
        .map_err(|e| NormalizeError::io(path)(e.error))?;
    Ok(())
}
