use std::{path::PathBuf, time::Duration};

use alloy::primitives::{Address, hex};
use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use contract_harness::{
    Harness, HarnessConfig,
    accounts,
    artifact::ArtifactStore,
    compiler::{self, Solc},
    config::Endpoint,
    driver,
    verify::{EtherscanVerifier, VerificationStatus, Verifier},
};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Compile, deploy and exercise contract fixtures against configured networks
#[derive(Debug, Parser)]
#[command(name = "contract-harness", version)]
struct Cli {
    /// Network profile, defaults to HARNESS_NETWORK or `hardhat`
    #[arg(long, global = true)]
    network: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the addresses of the network's accounts
    Accounts,
    /// List the configured networks
    Networks,
    /// Compile every source with its pinned compiler and store the artifacts
    Compile {
        #[arg(long)]
        sources: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run the built-in fixture suites
    Test {
        /// Run independent suites concurrently, each from its own account
        #[arg(long)]
        parallel: bool,
    },
    /// Submit a deployed artifact for source verification
    Verify {
        /// Contract name of the artifact
        #[arg(long)]
        artifact: String,
        #[arg(long)]
        address: Address,
        /// Hex encoded constructor arguments
        #[arg(long, default_value = "")]
        constructor_args: String,
        /// Poll until the service reports a final status
        #[arg(long)]
        wait: bool,
    },
    /// Validate every network profile without touching the network
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let cli = Cli::parse();
    let config = HarnessConfig::from_env()?;
    let network = cli
        .network
        .clone()
        .unwrap_or_else(|| config.default_network.clone());

    match cli.command {
        Command::Accounts => {
            let profile = config.networks.resolve(&network)?;
            for account in accounts::provision(profile)? {
                match account.index {
                    Some(index) => println!("{index:>3} {}", account.address()),
                    None => println!("  - {}", account.address()),
                }
            }
        }
        Command::Networks => {
            for profile in config.networks.iter() {
                let endpoint = match &profile.endpoint {
                    Endpoint::Ephemeral => "ephemeral".to_string(),
                    Endpoint::Http(url) => url.to_string(),
                    Endpoint::Missing => "<missing>".to_string(),
                };
                println!(
                    "{:<10} {endpoint:<40} gas price {} wei, timeout {:?}",
                    profile.name, profile.gas_price, profile.timeout
                );
            }
        }
        Command::Compile { sources, out } => {
            let sources = sources.unwrap_or_else(|| config.sources_dir.clone());
            let out = out.unwrap_or_else(|| config.artifacts_dir.clone());
            let artifacts = compiler::compile_dir(&config.compilers, &Solc, &sources).await?;
            let mut store = ArtifactStore::load(&out)?;
            for artifact in artifacts {
                info!(contract = %artifact.contract_name, compiler = %artifact.compiler, "compiled");
                store.insert(artifact);
            }
            for path in store.save(&out)? {
                println!("{}", path.display());
            }
        }
        Command::Test { parallel } => {
            let harness = Harness::connect(&config, &network)?;
            let suites = driver::builtin_suites()
                .into_iter()
                .enumerate()
                .map(|(i, suite)| if parallel { suite.with_sender(i) } else { suite })
                .collect::<Vec<_>>();
            let reports = driver::run_suites(&harness, &suites, parallel).await?;

            let mut failed = 0;
            for report in &reports {
                for case in &report.cases {
                    match &case.error {
                        None => println!("test {}::{} ... ok ({:?})", report.suite, case.name, case.elapsed),
                        Some(err) => {
                            failed += 1;
                            println!("test {}::{} ... FAILED\n    {err}", report.suite, case.name);
                        }
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} test case(s) failed on `{network}`");
            }
        }
        Command::Verify {
            artifact,
            address,
            constructor_args,
            wait,
        } => {
            let profile = config.networks.resolve(&network)?;
            let store = ArtifactStore::load(&config.artifacts_dir)?;
            let artifact = store.get(&artifact)?;
            let constructor_args =
                hex::decode(&constructor_args).context("constructor arguments are not hex")?;
            let verifier = EtherscanVerifier::for_network(&config, profile)?;
            let guid = verifier.verify(artifact, address, &constructor_args).await?;
            println!("{guid}");
            while wait {
                tokio::time::sleep(Duration::from_secs(5)).await;
                match verifier.status(address, &guid).await? {
                    VerificationStatus::Pending => continue,
                    VerificationStatus::Verified => {
                        println!("verified");
                        break;
                    }
                    VerificationStatus::Failed(reason) => bail!("verification failed: {reason}"),
                }
            }
        }
        Command::Check => {
            let problems = config.validate();
            for problem in &problems {
                println!("{problem}");
            }
            if !problems.is_empty() {
                bail!("{} configuration problem(s)", problems.len());
            }
            println!("configuration ok");
        }
    }
    Ok(())
}
