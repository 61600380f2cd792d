use crate::job::JobInvocation;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use thiserror::Error;
use tracing::debug;

/// Errors from the container runtime itself, as opposed to a fuzz job that ran
/// and reported a failure.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The runtime program could not be started at all.
    #[error("Failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The image build ran and exited unsuccessfully. `output` holds everything
    /// the build printed.
    #[error("Image build for `{tag}` failed ({status})\n{output}")]
    BuildFailed {
        tag: String,
        status: String,
        output: String,
    },
}

/// Where and how to build the execution image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub build_file: PathBuf,
    pub context: PathBuf,
    pub tag: String,
}

/// A built image that jobs can be started from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    tag: String,
}

impl ImageHandle {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

/// Combined stdout and stderr of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub text: String,
    pub exit_code: Option<i32>,
}

impl CapturedOutput {
    pub fn new(text: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            text: text.into(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Human-readable exit status, for logs and error messages.
    pub fn status(&self) -> String {
        match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    }

    /// Writes the captured text to `out`, ending it with a newline.
    pub fn write_to(&self, out: &mut impl Write) -> std::io::Result<()> {
        out.write_all(self.text.as_bytes())?;
        if !self.text.is_empty() && !self.text.ends_with('\n') {
            out.write_all(b"\n")?;
        }
        out.flush()
    }

    /// Echoes the captured text to stdout. Write errors are ignored.
    pub fn echo(&self) {
        let _ = self.write_to(&mut std::io::stdout().lock());
    }

    pub(crate) fn from_output(output: Output) -> Self {
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Self {
            text,
            exit_code: output.status.code(),
        }
    }
}

/// The process-external capability the campaign needs: build one image, then
/// run isolated jobs from it. Calls block until the process exits.
pub trait ContainerRuntime {
    fn build(&mut self, spec: &BuildSpec) -> Result<ImageHandle, RuntimeError>;

    /// Runs one job to completion. A non-zero exit is not an error here; the
    /// caller classifies the output.
    fn run_job(&mut self, invocation: &JobInvocation) -> Result<CapturedOutput, RuntimeError>;
}

/// A `ContainerRuntime` driving a docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct CommandRuntime {
    program: String,
}

impl CommandRuntime {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn build_args(spec: &BuildSpec) -> Vec<String> {
        vec![
            "build".to_string(),
            "-f".to_string(),
            spec.build_file.display().to_string(),
            spec.context.display().to_string(),
            "-t".to_string(),
            spec.tag.clone(),
        ]
    }

    pub fn run_args(invocation: &JobInvocation) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        for (key, value) in &invocation.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for mount in &invocation.mounts {
            args.push("-v".to_string());
            args.push(format!(
                "{}:{}",
                mount.host.display(),
                mount.container.display()
            ));
        }
        args.push(invocation.image.tag().to_string());
        args.extend(invocation.args.iter().cloned());
        args
    }

    fn capture(&self, args: &[String]) -> Result<CapturedOutput, RuntimeError> {
        debug!(program = %self.program, ?args, "spawning runtime");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| RuntimeError::Launch {
                program: self.program.clone(),
                source,
            })?;
        Ok(CapturedOutput::from_output(output))
    }
}

impl Default for CommandRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl ContainerRuntime for CommandRuntime {
    fn build(&mut self, spec: &BuildSpec) -> Result<ImageHandle, RuntimeError> {
        let captured = self.capture(&Self::build_args(spec))?;
        if !captured.success() {
            return Err(RuntimeError::BuildFailed {
                tag: spec.tag.clone(),
                status: captured.status(),
                output: captured.text,
            });
        }
        Ok(ImageHandle::new(spec.tag.clone()))
    }

    fn run_job(&mut self, invocation: &JobInvocation) -> Result<CapturedOutput, RuntimeError> {
        self.capture(&Self::run_args(invocation))
    }
}
