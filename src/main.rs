use clap::{Parser, ValueEnum};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, filter::LevelFilter};
use tsrelabel::{CollisionPolicy, OrchestratorBuilder, RelabelRules};

#[derive(Parser)]
#[command(name = "tsrelabel")]
#[command(about = "Rewrite series labels of time-series blocks", long_about = None)]
#[command(version)]
struct Cli {
    /// YAML file with the relabel rules to apply.
    #[arg(long)]
    relabel_config: PathBuf,

    /// Block to rewrite (repeatable).
    #[arg(long = "id")]
    ids: Vec<String>,

    /// Only log the decisions; do not publish new blocks.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    dry_run: bool,

    /// Delete each source block once its replacement is published.
    #[arg(long)]
    delete_source_block: bool,

    /// What to do when two series relabel to the same label set.
    #[arg(long, value_enum, default_value_t = Collisions::Fail)]
    collision_policy: Collisions,

    /// Exit non-zero if any block fails.
    #[arg(long)]
    fail_on_error: bool,

    /// Database directory containing the blocks.
    #[arg(default_value = tsrelabel::orchestrator::DEFAULT_DB_PATH)]
    db_path: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Collisions {
    Fail,
    Merge,
}

impl From<Collisions> for CollisionPolicy {
    fn from(c: Collisions) -> Self {
        match c {
            Collisions::Fail => CollisionPolicy::Fail,
            Collisions::Merge => CollisionPolicy::Merge,
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let rules = match RelabelRules::load(&cli.relabel_config) {
        Ok(rules) => rules,
        Err(e) => {
            error!(
                path = %cli.relabel_config.display(),
                error = %e,
                "failed to load relabel config"
            );
            return ExitCode::FAILURE;
        }
    };
    info!(
        path = %cli.relabel_config.display(),
        rules = rules.len(),
        "loaded relabel config"
    );

    let orchestrator = match OrchestratorBuilder::new()
        .with_db_path(&cli.db_path)
        .with_dry_run(cli.dry_run)
        .with_delete_source(cli.delete_source_block)
        .with_collision_policy(cli.collision_policy.into())
        .build()
    {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    if cli.ids.is_empty() {
        warn!("no block ids given, nothing to rewrite");
    }
    let report = orchestrator.run(&cli.ids, &rules);
    for job in report.jobs.iter().filter(|j| j.succeeded()) {
        info!(
            source = %job.source,
            state = %job.state,
            destination = ?job.destination_dir(orchestrator.db_path()),
            "block done"
        );
    }
    for job in report.failed() {
        if let Some(e) = &job.error {
            error!(source = %job.source, error = %e, "block failed");
        }
    }

    if cli.fail_on_error && report.has_failures() {
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_optional_and_dry_run_is_default() {
        let cli = Cli::try_parse_from(["tsrelabel", "--relabel-config", "rules.yml"]).unwrap();
        assert!(cli.ids.is_empty());
        assert!(cli.dry_run);
        assert!(!cli.delete_source_block);
        assert_eq!(cli.db_path, PathBuf::from("data"));
    }

    #[test]
    fn test_repeated_ids_and_explicit_flags() {
        let cli = Cli::try_parse_from([
            "tsrelabel",
            "--relabel-config",
            "rules.yml",
            "--id",
            "01ARZ3NDEKTSV4RRFFQ69G5FAV",
            "--id",
            "01BX5ZZKBKACTAV9WEVGEMMVRZ",
            "--dry-run",
            "false",
            "--collision-policy",
            "merge",
            "/var/lib/tsdb",
        ])
        .unwrap();
        assert_eq!(cli.ids.len(), 2);
        assert!(!cli.dry_run);
        assert_eq!(
            CollisionPolicy::from(cli.collision_policy),
            CollisionPolicy::Merge
        );
        assert_eq!(cli.db_path, PathBuf::from("/var/lib/tsdb"));
    }
}
