//! bulkhead - multi-tenant isolation checks over a fixture handoff store.
//!
//! Subcommands:
//! - `pair` - run setup and run roles as two tasks over one in-memory
//!   cloud, coordinating through a real on-disk store
//! - `produce` / `consume` - run one role for two-process operation
//!   (share a run id via `BULKHEAD_RUN_ID` or `--run-id`)
//! - `smoke` - basic-values suite exercising logging and assertions
//! - `scenario` - single-account provisioning walk
//! - `catalog` - print the effective check catalog after overrides
//! - `scrub` - remove stale store files left by crashed runs
//!
//! Configuration is loaded from `BULKHEAD_*` environment variables, or
//! from a TOML file when `--config` is given. Exit status is nonzero when
//! any check fails.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context as _;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bulkhead::checks::run_scenario;
use bulkhead::checks::run_smoke;
use bulkhead::cloud::AccountId;
use bulkhead::cloud::CloudApi;
use bulkhead::cloud::DeterministicCloud;
use bulkhead::config::Config;
use bulkhead::handoff::scrub_stale;
use bulkhead::handoff::FixtureStore;
use bulkhead::roles::run_pair;
use bulkhead::roles::Consumer;
use bulkhead::roles::Producer;
use bulkhead::CheckReport;

#[derive(Parser, Debug)]
#[command(name = "bulkhead", version, about = "Multi-tenant isolation checks with fixture handoff")]
struct Cli {
    /// Path to a TOML configuration file. Overrides the environment.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run identifier scoping the store location. Two cooperating
    /// processes must agree on it.
    #[arg(long, global = true)]
    run_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run both roles concurrently over one in-memory cloud
    Pair,
    /// Run only the setup role: provision, publish, await release, tear down
    Produce,
    /// Run only the run role: await the record and release it.
    ///
    /// The bundled cloud is in-memory and process-local, so cross-account
    /// checks are only meaningful under `pair`; by default this exercises
    /// the handoff protocol alone.
    Consume {
        /// Also run the isolation catalog against this process's own cloud
        #[arg(long)]
        run_checks: bool,
    },
    /// Basic-values smoke suite: logging and assertion plumbing
    Smoke,
    /// Single-account provisioning walk: boot, attach, reboot, verify
    Scenario,
    /// Print the effective check catalog with expectations after overrides
    Catalog,
    /// Remove stale store files older than the configured max age
    Scrub,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_toml_file(path).context("loading configuration file")?,
        None => Config::load().context("loading configuration from environment")?,
    };
    if let Some(run_id) = &cli.run_id {
        config.handoff.run_id = run_id.clone();
    }
    Ok(config)
}

fn store_from(config: &Config) -> FixtureStore {
    FixtureStore::new(
        &config.handoff.store_dir,
        &config.handoff.store_prefix,
        config.handoff.run_id.clone(),
        config.handoff.store_config(),
    )
}

fn producer_from(config: &Config, cloud: Arc<dyn CloudApi>) -> Producer {
    Producer::new(
        cloud,
        AccountId::new(config.accounts.producer_account.clone()),
        store_from(config),
        config.features.clone(),
        config.handoff.wait_config(),
        config.handoff.release_timeout(),
    )
}

fn consumer_from(config: &Config, cloud: Arc<dyn CloudApi>) -> Result<Consumer> {
    Ok(Consumer::new(
        cloud,
        AccountId::new(config.accounts.consumer_account.clone()),
        store_from(config),
        config.handoff.fixture_timeout(),
        config.handoff.wait_config(),
        config.effective_expectations()?,
    ))
}

/// Cancel the token on Ctrl-C so every bounded wait unwinds as a
/// cancellation rather than running to its timeout.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; cancelling waits");
            token.cancel();
        }
    });
    cancel
}

fn finish(report: &CheckReport) -> Result<()> {
    println!("{report}");
    if !report.ok() {
        bail!("{} check(s) failed", report.failed());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Command::Pair => {
            let cloud: Arc<dyn CloudApi> = DeterministicCloud::new();
            let producer = producer_from(&config, cloud.clone());
            let consumer = consumer_from(&config, cloud)?;
            let outcome = run_pair(producer, consumer, &cancel).await?;
            info!(
                run_id = %outcome.record().run_id,
                released_by_consumer = outcome.producer.released_by_consumer,
                "pair complete"
            );
            finish(&outcome.report)
        }
        Command::Produce => {
            let cloud: Arc<dyn CloudApi> = DeterministicCloud::new();
            let producer = producer_from(&config, cloud);
            let outcome = producer.run(&cancel).await?;
            info!(
                run_id = %outcome.record.run_id,
                released_by_consumer = outcome.released_by_consumer,
                "setup role complete"
            );
            Ok(())
        }
        Command::Consume { run_checks } => {
            if run_checks {
                let cloud: Arc<dyn CloudApi> = DeterministicCloud::new();
                let consumer = consumer_from(&config, cloud)?;
                let report = consumer.run(&cancel).await?;
                finish(&report)
            } else {
                let store = store_from(&config);
                let record = store.await_and_read(config.handoff.fixture_timeout(), &cancel).await?;
                info!(run_id = %record.run_id, server = %record.server.id, "fixture record received");
                store.release().await?;
                Ok(())
            }
        }
        Command::Smoke => finish(&run_smoke()),
        Command::Scenario => {
            let cloud = DeterministicCloud::new();
            let account = AccountId::new(config.accounts.producer_account.clone());
            run_scenario(cloud.as_ref(), &account, &config.handoff.wait_config(), &cancel).await?;
            println!("scenario complete");
            Ok(())
        }
        Command::Catalog => {
            for (name, expectation) in config.effective_expectations()? {
                println!("{name:42} {expectation}");
            }
            Ok(())
        }
        Command::Scrub => {
            let removed = scrub_stale(
                &config.handoff.store_dir,
                &config.handoff.store_prefix,
                config.handoff.scrub_max_age(),
            )
            .await?;
            println!("removed {removed} stale store file(s)");
            Ok(())
        }
    }
}
