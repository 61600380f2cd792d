use fuzzcamp_core::config::{CampaignConfig, detect_host_user};
use fuzzcamp_core::{
    Campaign, CampaignOutcome, CommandHarness, CommandRuntime, PassMarkerOracle, SetupRegistry,
    TargetRegistry, TxLogNormalizer,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::num::NonZeroU64;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// TOML config file (defaults to ./fuzzcamp.toml when present).
    #[clap(short, long, value_parser, global = true)]
    config_file: Option<PathBuf>,
    /// Passed to every fuzz job as `--test-limit <n>`.
    #[clap(long, global = true)]
    test_limit: Option<NonZeroU64>,
    /// Host corpus directory, overriding the config file.
    #[clap(long, global = true)]
    corpus: Option<PathBuf>,
    #[clap(long, default_value = "info", global = true)]
    log_level: String,
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the image and fuzz every configured target (default).
    Run,
    /// Record transaction logs for each invariants/setup pairing and normalize them.
    Normalize {
        /// Setup registry, overriding the config file.
        #[clap(long)]
        setups: Option<PathBuf>,
        #[clap(long)]
        output_dir: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, anyhow::Error> {
    let mut config = CampaignConfig::load_or_default(cli.config_file.as_deref())?;
    if let Some(corpus) = cli.corpus {
        config.campaign.corpus_dir = corpus;
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_campaign(&config, cli.test_limit),
        Command::Normalize { setups, output_dir } => {
            if let Some(setups) = setups {
                config.normalizer.setups_file = setups;
            }
            if let Some(output_dir) = output_dir {
                config.normalizer.output_dir = output_dir;
            }
            run_normalize(&config)
        }
    }
}

fn run_campaign(
    config: &CampaignConfig,
    test_limit: Option<NonZeroU64>,
) -> Result<ExitCode, anyhow::Error> {
    let registry = TargetRegistry::load(&config.campaign.targets_file)?;
    info!(
        targets = registry.len(),
        registry = %config.campaign.targets_file.display(),
        "loaded target registry"
    );

    let host_user = match &config.campaign.host_user {
        Some(user) => user.clone(),
        None => detect_host_user().context("Could not determine host user identity")?,
    };
    let cwd = std::env::current_dir().context("Could not read working directory")?;

    let mut campaign = Campaign::new(
        config.campaign_settings(&cwd, host_user),
        Box::new(CommandRuntime::new(config.environment.runtime.clone())),
        Box::new(PassMarkerOracle::new(config.campaign.pass_marker.clone())),
    );

    let outcome = campaign.run(&registry, test_limit)?;
    match &outcome {
        CampaignOutcome::Succeeded { jobs } => {
            info!(jobs = jobs.len(), "campaign passed");
        }
        CampaignOutcome::Failed { failed, passed } => {
            error!(
                target_id = %failed.target,
                passed = passed.len(),
                "campaign failed"
            );
        }
    }
    Ok(ExitCode::from(outcome.exit_code()))
}

fn run_normalize(config: &CampaignConfig) -> Result<ExitCode, anyhow::Error> {
    let setups = SetupRegistry::load(&config.normalizer.setups_file)?;
    let harness = CommandHarness::new(
        config.normalizer.harness_command.clone(),
        config.normalizer.log_env.clone(),
    );
    let mut normalizer = TxLogNormalizer::new(&config.normalizer.output_dir, Box::new(harness));

    let bundles = normalizer.normalize_all(&setups)?;
    for bundle in &bundles {
        println!(
            "{}: {} records -> {}",
            bundle.base_name,
            bundle.records,
            bundle.paths.normalized.display()
        );
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_is_accepted_before_or_after_run() {
        let bare = Cli::try_parse_from(["fuzzcamp", "--test-limit", "5"]).unwrap();
        assert_eq!(bare.test_limit, NonZeroU64::new(5));
        assert!(bare.command.is_none());

        let explicit = Cli::try_parse_from(["fuzzcamp", "run", "--test-limit", "5"]).unwrap();
        assert_eq!(explicit.test_limit, NonZeroU64::new(5));
        assert!(matches!(explicit.command, Some(Command::Run)));
    }

    #[test]
    fn zero_test_limit_is_rejected() {
        assert!(Cli::try_parse_from(["fuzzcamp", "--test-limit", "0"]).is_err());
        assert!(Cli::try_parse_from(["fuzzcamp", "run", "--test-limit", "0"]).is_err());
    }

    #[test]
    fn shared_options_follow_subcommands() {
        let cli = Cli::try_parse_from([
            "fuzzcamp",
            "normalize",
            "--config-file",
            "ci.toml",
            "--corpus",
            "corpus",
        ])
        .unwrap();
        assert_eq!(cli.config_file, Some(PathBuf::from("ci.toml")));
        assert_eq!(cli.corpus, Some(PathBuf::from("corpus")));
        assert!(matches!(cli.command, Some(Command::Normalize { .. })));
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
