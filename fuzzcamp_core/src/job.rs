use crate::executor::{ContainerRuntime, ImageHandle, RuntimeError};
use crate::oracle::{JobVerdict, OutcomeOracle};
use crate::registry::TargetEntry;
use std::num::NonZeroU64;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// A host directory bound read-write into the job's filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host: PathBuf,
    pub container: PathBuf,
}

/// Everything needed to start one fuzz job. Built per target and dropped once
/// the job finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInvocation {
    pub image: ImageHandle,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<VolumeMount>,
    /// Arguments for the fuzz tool, in the order it expects them.
    pub args: Vec<String>,
}

/// Per-campaign job settings. Host identity and paths are passed in rather than
/// read from the process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSettings {
    /// Absolute host path of the shared corpus directory.
    pub corpus_dir: PathBuf,
    pub container_corpus_dir: PathBuf,
    /// Name of the environment value carrying the host user identity.
    pub host_user_env: String,
    pub host_user: String,
    /// First positional argument handed to the fuzz tool.
    pub context_arg: String,
}

/// Result of one job: which target, what the oracle decided, and the raw exit
/// code for reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub target: String,
    pub verdict: JobVerdict,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct JobRunner {
    settings: JobSettings,
}

impl JobRunner {
    pub fn new(settings: JobSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    /// Builds the invocation for `target`. Tool arguments are always
    /// `context, --config <ref>, --contract <id>[, --test-limit <n>]`.
    pub fn invocation(
        &self,
        image: &ImageHandle,
        target: &TargetEntry,
        test_limit: Option<NonZeroU64>,
    ) -> JobInvocation {
        let mut args = vec![
            self.settings.context_arg.clone(),
            "--config".to_string(),
            target.config_ref.clone(),
            "--contract".to_string(),
            target.identifier.clone(),
        ];
        if let Some(limit) = test_limit {
            args.push("--test-limit".to_string());
            args.push(limit.to_string());
        }

        JobInvocation {
            image: image.clone(),
            env: vec![(
                self.settings.host_user_env.clone(),
                self.settings.host_user.clone(),
            )],
            mounts: vec![VolumeMount {
                host: self.settings.corpus_dir.clone(),
                container: self.settings.container_corpus_dir.clone(),
            }],
            args,
        }
    }

    /// Runs one job and classifies it.
    ///
    /// The captured output is always echoed to stdout, pass or fail. A runtime
    /// that cannot start the job returns `Err` and no classification happens.
    pub fn run(
        &self,
        runtime: &mut dyn ContainerRuntime,
        oracle: &dyn OutcomeOracle,
        image: &ImageHandle,
        target: &TargetEntry,
        test_limit: Option<NonZeroU64>,
    ) -> Result<JobReport, RuntimeError> {
        let invocation = self.invocation(image, target, test_limit);
        debug!(target_id = %target.identifier, ?invocation, "launching job");

        let captured = runtime.run_job(&invocation)?;
        captured.echo();

        let verdict = oracle.classify(&captured.text);
        match (verdict, captured.success()) {
            (JobVerdict::Passed, false) => warn!(
                target_id = %target.identifier,
                exit_code = ?captured.exit_code,
                "job reported a pass but exited unsuccessfully"
            ),
            (JobVerdict::Failed, true) => debug!(
                target_id = %target.identifier,
                "job exited cleanly without reporting a pass"
            ),
            _ => {}
        }
        info!(target_id = %target.identifier, ?verdict, "job finished");

        Ok(JobReport {
            target: target.identifier.clone(),
            verdict,
            exit_code: captured.exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{BuildSpec, CapturedOutput};
    use crate::oracle::PassMarkerOracle;
    use std::io;

    struct CannedRuntime {
        output: CapturedOutput,
        seen: Vec<JobInvocation>,
    }

    impl ContainerRuntime for CannedRuntime {
        fn build(&mut self, spec: &BuildSpec) -> Result<ImageHandle, RuntimeError> {
            Ok(ImageHandle::new(spec.tag.clone()))
        }

        fn run_job(&mut self, invocation: &JobInvocation) -> Result<CapturedOutput, RuntimeError> {
            self.seen.push(invocation.clone());
            Ok(self.output.clone())
        }
    }

    struct UnstartableRuntime;

    impl ContainerRuntime for UnstartableRuntime {
        fn build(&mut self, spec: &BuildSpec) -> Result<ImageHandle, RuntimeError> {
            Ok(ImageHandle::new(spec.tag.clone()))
        }

        fn run_job(&mut self, _invocation: &JobInvocation) -> Result<CapturedOutput, RuntimeError> {
            Err(RuntimeError::Launch {
                program: "docker".to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such image"),
            })
        }
    }

    fn runner() -> JobRunner {
        JobRunner::new(JobSettings {
            corpus_dir: PathBuf::from("/work/echidna-corpus"),
            container_corpus_dir: PathBuf::from("/root/echidna-corpus"),
            host_user_env: "HOST_USER".to_string(),
            host_user: "1000".to_string(),
            context_arg: ".".to_string(),
        })
    }

    fn canned(text: &str, exit_code: i32) -> CannedRuntime {
        CannedRuntime {
            output: CapturedOutput::new(text, Some(exit_code)),
            seen: Vec::new(),
        }
    }

    #[test]
    fn invocation_orders_tool_arguments() {
        let image = ImageHandle::new("fuzz_campaign");
        let target = TargetEntry::new("TokenA", "configs/a.yaml");

        let without_limit = runner().invocation(&image, &target, None);
        assert_eq!(
            without_limit.args,
            vec![".", "--config", "configs/a.yaml", "--contract", "TokenA"]
        );

        let with_limit = runner().invocation(&image, &target, NonZeroU64::new(50_000));
        assert_eq!(
            with_limit.args,
            vec![
                ".",
                "--config",
                "configs/a.yaml",
                "--contract",
                "TokenA",
                "--test-limit",
                "50000"
            ]
        );
    }

    #[test]
    fn invocation_binds_host_user_and_corpus() {
        let invocation = runner().invocation(
            &ImageHandle::new("fuzz_campaign"),
            &TargetEntry::new("TokenA", "configs/a.yaml"),
            None,
        );
        assert_eq!(invocation.image.tag(), "fuzz_campaign");
        assert_eq!(
            invocation.env,
            vec![("HOST_USER".to_string(), "1000".to_string())]
        );
        assert_eq!(
            invocation.mounts,
            vec![VolumeMount {
                host: PathBuf::from("/work/echidna-corpus"),
                container: PathBuf::from("/root/echidna-corpus"),
            }]
        );
    }

    #[test]
    fn pass_marker_wins_over_nonzero_exit() {
        let mut runtime = canned("prop_supply: passed! 🎉", 1);
        let report = runner()
            .run(
                &mut runtime,
                &PassMarkerOracle::default(),
                &ImageHandle::new("img"),
                &TargetEntry::new("TokenA", "configs/a.yaml"),
                None,
            )
            .unwrap();
        assert_eq!(report.verdict, JobVerdict::Passed);
        assert_eq!(report.exit_code, Some(1));
        assert_eq!(runtime.seen.len(), 1);
    }

    #[test]
    fn clean_exit_without_marker_fails() {
        let mut runtime = canned("prop_supply: failed!💥", 0);
        let report = runner()
            .run(
                &mut runtime,
                &PassMarkerOracle::default(),
                &ImageHandle::new("img"),
                &TargetEntry::new("TokenB", "configs/b.yaml"),
                None,
            )
            .unwrap();
        assert_eq!(report.target, "TokenB");
        assert_eq!(report.verdict, JobVerdict::Failed);
    }

    #[test]
    fn launch_failure_is_an_error_not_a_verdict() {
        let result = runner().run(
            &mut UnstartableRuntime,
            &PassMarkerOracle::default(),
            &ImageHandle::new("img"),
            &TargetEntry::new("TokenA", "configs/a.yaml"),
            None,
        );
        assert!(matches!(result, Err(RuntimeError::Launch { .. })));
    }
}
