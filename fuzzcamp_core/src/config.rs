use crate::campaign::CampaignSettings;
use crate::executor::BuildSpec;
use crate::job::JobSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Config file picked up from the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "fuzzcamp.toml";

/// When the artifact reclaimer runs relative to a job's verdict.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReclaimPolicy {
    /// After every job, pass or fail.
    #[default]
    Always,
    /// Only after a passing job; a failing job's artifacts stay on disk.
    AfterPass,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_build_file")]
    pub build_file: PathBuf,
    #[serde(default = "default_build_context")]
    pub build_context: PathBuf,
    #[serde(default = "default_image_tag")]
    pub image_tag: String,
}

fn default_runtime() -> String {
    "docker".to_string()
}
fn default_build_file() -> PathBuf {
    PathBuf::from("fuzzing/docker/Dockerfile")
}
fn default_build_context() -> PathBuf {
    PathBuf::from(".")
}
fn default_image_tag() -> String {
    "fuzz_campaign".to_string()
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            build_file: default_build_file(),
            build_context: default_build_context(),
            image_tag: default_image_tag(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CampaignSection {
    #[serde(default = "default_targets_file")]
    pub targets_file: PathBuf,
    /// Host corpus directory. Relative paths are resolved against the
    /// working directory.
    #[serde(default = "default_corpus_dir")]
    pub corpus_dir: PathBuf,
    #[serde(default = "default_container_corpus_dir")]
    pub container_corpus_dir: PathBuf,
    #[serde(default = "default_host_user_env")]
    pub host_user_env: String,
    /// Host user identity passed into jobs. Detected with `id -u` when unset.
    #[serde(default)]
    pub host_user: Option<String>,
    #[serde(default = "default_context_arg")]
    pub context_arg: String,
    #[serde(default = "default_pass_marker")]
    pub pass_marker: String,
    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
    /// Treat a failed artifact cleanup as fatal instead of logging it.
    #[serde(default)]
    pub strict_cleanup: bool,
}

fn default_targets_file() -> PathBuf {
    PathBuf::from("fuzzing/config/fuzz.json")
}
pub fn default_corpus_dir() -> PathBuf {
    PathBuf::from("echidna-corpus")
}
fn default_container_corpus_dir() -> PathBuf {
    PathBuf::from("/root/echidna-corpus")
}
fn default_host_user_env() -> String {
    "HOST_USER".to_string()
}
fn default_context_arg() -> String {
    ".".to_string()
}
fn default_pass_marker() -> String {
    crate::oracle::DEFAULT_PASS_MARKER.to_string()
}

impl Default for CampaignSection {
    fn default() -> Self {
        Self {
            targets_file: default_targets_file(),
            corpus_dir: default_corpus_dir(),
            container_corpus_dir: default_container_corpus_dir(),
            host_user_env: default_host_user_env(),
            host_user: None,
            context_arg: default_context_arg(),
            pass_marker: default_pass_marker(),
            reclaim_policy: ReclaimPolicy::default(),
            strict_cleanup: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct NormalizerConfig {
    #[serde(default = "default_setups_file")]
    pub setups_file: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Test harness command; the setup reference is appended as last argument.
    #[serde(default = "default_harness_command")]
    pub harness_command: Vec<String>,
    /// Environment variable telling the harness where to append records.
    #[serde(default = "default_log_env")]
    pub log_env: String,
}

fn default_setups_file() -> PathBuf {
    PathBuf::from("fuzzing/scripts/targets.json")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("build/fuzzing")
}
fn default_harness_command() -> Vec<String> {
    vec!["pnpm".to_string(), "mocha".to_string()]
}
fn default_log_env() -> String {
    "TX_LOG_FILE".to_string()
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            setups_file: default_setups_file(),
            output_dir: default_output_dir(),
            harness_command: default_harness_command(),
            log_env: default_log_env(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub campaign: CampaignSection,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
}

impl CampaignConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: CampaignConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, or `fuzzcamp.toml` from the working directory, or falls
    /// back to built-in defaults when neither is given/present.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, anyhow::Error> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load_from_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let non_empty = [
            ("environment.runtime", self.environment.runtime.as_str()),
            ("environment.image-tag", self.environment.image_tag.as_str()),
            ("campaign.host-user-env", self.campaign.host_user_env.as_str()),
            ("campaign.pass-marker", self.campaign.pass_marker.as_str()),
            ("normalizer.log-env", self.normalizer.log_env.as_str()),
        ];
        for (key, value) in non_empty {
            if value.trim().is_empty() {
                anyhow::bail!("`{key}` must not be empty");
            }
        }
        if let Some(user) = &self.campaign.host_user {
            if user.trim().is_empty() {
                anyhow::bail!("`campaign.host-user` must not be empty when set");
            }
        }
        if !self.campaign.container_corpus_dir.is_absolute() {
            anyhow::bail!(
                "`campaign.container-corpus-dir` must be absolute, got {:?}",
                self.campaign.container_corpus_dir
            );
        }
        if self.normalizer.harness_command.is_empty() {
            anyhow::bail!("`normalizer.harness-command` must name a program");
        }
        Ok(())
    }

    pub fn build_spec(&self) -> BuildSpec {
        BuildSpec {
            build_file: self.environment.build_file.clone(),
            context: self.environment.build_context.clone(),
            tag: self.environment.image_tag.clone(),
        }
    }

    /// Host corpus directory as an absolute path, as required for bind mounts.
    pub fn resolved_corpus_dir(&self, cwd: &Path) -> PathBuf {
        if self.campaign.corpus_dir.is_absolute() {
            self.campaign.corpus_dir.clone()
        } else {
            cwd.join(&self.campaign.corpus_dir)
        }
    }

    pub fn job_settings(&self, cwd: &Path, host_user: String) -> JobSettings {
        JobSettings {
            corpus_dir: self.resolved_corpus_dir(cwd),
            container_corpus_dir: self.campaign.container_corpus_dir.clone(),
            host_user_env: self.campaign.host_user_env.clone(),
            host_user,
            context_arg: self.campaign.context_arg.clone(),
        }
    }

    pub fn campaign_settings(&self, cwd: &Path, host_user: String) -> CampaignSettings {
        CampaignSettings {
            build: self.build_spec(),
            job: self.job_settings(cwd, host_user),
            reclaim_policy: self.campaign.reclaim_policy,
            strict_cleanup: self.campaign.strict_cleanup,
        }
    }
}

/// Numeric id of the invoking user, via `id -u`.
pub fn detect_host_user() -> Result<String, anyhow::Error> {
    let output = Command::new("id")
        .arg("-u")
        .output()
        .map_err(|e| anyhow::anyhow!("Failed to run `id -u`: {}", e))?;
    if !output.status.success() {
        anyhow::bail!("`id -u` exited with {}", output.status);
    }
    let user = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if user.is_empty() {
        anyhow::bail!("`id -u` printed nothing");
    }
    Ok(user)
}
