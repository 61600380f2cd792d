use crate::config::ReclaimPolicy;
use crate::corpus::{ArtifactReclaimer, ReclaimError};
use crate::executor::{BuildSpec, ContainerRuntime, RuntimeError};
use crate::job::{JobReport, JobRunner, JobSettings};
use crate::oracle::OutcomeOracle;
use crate::registry::TargetRegistry;
use std::num::NonZeroU64;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, info, warn};

/// Failures that stop a campaign because something other than a fuzz property
/// went wrong. A job that ran and failed is a `CampaignOutcome`, not an error.
#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Corpus directory {0:?} does not exist")]
    CorpusMissing(PathBuf),

    #[error("Execution environment build failed: {0}")]
    Build(#[source] RuntimeError),

    #[error("Job for target `{target}` could not be launched: {source}")]
    Launch {
        target: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Artifact cleanup after target `{target}` failed: {source}")]
    Cleanup {
        target: String,
        #[source]
        source: ReclaimError,
    },
}

/// Everything a campaign needs besides the runtime and the oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignSettings {
    pub build: BuildSpec,
    pub job: JobSettings,
    pub reclaim_policy: ReclaimPolicy,
    pub strict_cleanup: bool,
}

/// How a campaign that ran to a verdict ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CampaignOutcome {
    /// Every target passed, in registry order.
    Succeeded { jobs: Vec<JobReport> },
    /// `failed` is the first failing job; `passed` are the jobs before it.
    Failed {
        failed: JobReport,
        passed: Vec<JobReport>,
    },
}

impl CampaignOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CampaignOutcome::Succeeded { .. })
    }

    /// Number of jobs that were started.
    pub fn attempted(&self) -> usize {
        match self {
            CampaignOutcome::Succeeded { jobs } => jobs.len(),
            CampaignOutcome::Failed { passed, .. } => passed.len() + 1,
        }
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_success() { 0 } else { 1 }
    }
}

/// Runs one fuzz job per target, strictly one after another.
///
/// The image is built once up front. Targets run in registry order and the
/// campaign stops at the first failing job. Jobs share one corpus directory,
/// which is why nothing here ever runs two jobs at once.
pub struct Campaign {
    runtime: Box<dyn ContainerRuntime>,
    oracle: Box<dyn OutcomeOracle>,
    runner: JobRunner,
    reclaimer: ArtifactReclaimer,
    build: BuildSpec,
    reclaim_policy: ReclaimPolicy,
    strict_cleanup: bool,
}

impl Campaign {
    pub fn new(
        settings: CampaignSettings,
        runtime: Box<dyn ContainerRuntime>,
        oracle: Box<dyn OutcomeOracle>,
    ) -> Self {
        Self {
            runtime,
            oracle,
            reclaimer: ArtifactReclaimer::new(settings.job.corpus_dir.clone()),
            runner: JobRunner::new(settings.job),
            build: settings.build,
            reclaim_policy: settings.reclaim_policy,
            strict_cleanup: settings.strict_cleanup,
        }
    }

    pub fn run(
        &mut self,
        registry: &TargetRegistry,
        test_limit: Option<NonZeroU64>,
    ) -> Result<CampaignOutcome, CampaignError> {
        let corpus_dir = self.reclaimer.corpus_dir();
        if !corpus_dir.is_dir() {
            return Err(CampaignError::CorpusMissing(corpus_dir.to_path_buf()));
        }

        info!(tag = %self.build.tag, "building execution environment");
        let image = self.runtime.build(&self.build).map_err(|e| {
            error!("execution environment build failed");
            CampaignError::Build(e)
        })?;

        if registry.is_empty() {
            warn!("target registry is empty, nothing to fuzz");
        }

        let total = registry.len();
        let mut passed = Vec::with_capacity(total);
        for (index, target) in registry.iter().enumerate() {
            info!(
                job = index + 1,
                total,
                target_id = %target.identifier,
                config = %target.config_ref,
                "starting job"
            );
            let report = self
                .runner
                .run(
                    self.runtime.as_mut(),
                    self.oracle.as_ref(),
                    &image,
                    target,
                    test_limit,
                )
                .map_err(|source| CampaignError::Launch {
                    target: target.identifier.clone(),
                    source,
                })?;

            let is_pass = report.verdict.is_pass();
            if is_pass || self.reclaim_policy == ReclaimPolicy::Always {
                self.reclaim(&target.identifier)?;
            }

            if !is_pass {
                error!(
                    target_id = %target.identifier,
                    remaining = total - index - 1,
                    "job failed, aborting campaign"
                );
                return Ok(CampaignOutcome::Failed {
                    failed: report,
                    passed,
                });
            }
            passed.push(report);
        }

        info!(jobs = passed.len(), "all targets passed");
        Ok(CampaignOutcome::Succeeded { jobs: passed })
    }

    fn reclaim(&self, target: &str) -> Result<(), CampaignError> {
        match self.reclaimer.clean() {
            Ok(_) => Ok(()),
            Err(source) if self.strict_cleanup => Err(CampaignError::Cleanup {
                target: target.to_string(),
                source,
            }),
            Err(e) => {
                warn!(target_id = %target, error = %e, "artifact cleanup failed, continuing");
                Ok(())
            }
        }
    }
}
