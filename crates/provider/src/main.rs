//! Ruleplane CLI
//!
//! Drives the resource handlers against the local control plane stored
//! under the configured store path.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use ruleplane_provider::config::ProviderConfig;
use ruleplane_provider::local::LocalControlPlane;
use ruleplane_provider::provider::{Diagnostic, EncodedValue, RuleplaneProvider};
use ruleplane_provider::state::{make_state, string_value};

/// Ruleplane - shared firewall rule collections
#[derive(Parser)]
#[command(name = "ruleplane")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "RULEPLANE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Store directory, overriding the configuration
    #[arg(long, env = "RULEPLANE_STORE", global = true)]
    store: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a resource, or update it when a prior state is given
    Apply {
        /// Resource type, e.g. ruleplane_firewall_network_rule_collection
        type_name: String,

        /// JSON file with the desired configuration
        #[arg(long)]
        file: PathBuf,

        /// JSON file with the prior state
        #[arg(long)]
        state: Option<PathBuf>,
    },

    /// Print the current state of a resource
    Read { type_name: String, id: String },

    /// Print the state of an existing resource
    Import { type_name: String, id: String },

    /// Delete a resource
    Destroy { type_name: String, id: String },

    /// List supported resource types
    Types,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| ruleplane_common::default_store_path().join("ruleplane.toml"));
    let mut config = ProviderConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }

    std::fs::create_dir_all(&config.store_path)?;
    let plane = LocalControlPlane::open(config.db_path(), config.settle_polls)?;
    info!("Using control plane store {}", config.db_path().display());

    let provider = RuleplaneProvider::new(Arc::new(plane), config);

    match cli.command {
        Commands::Apply { type_name, file, state } => {
            let planned = EncodedValue::from_json(std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?);
            let prior = match state {
                Some(path) => Some(EncodedValue::from_json(
                    std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?,
                )),
                None => None,
            };

            let response = provider
                .apply_resource_change(&type_name, prior.as_ref(), Some(&planned))
                .await?;
            check(&response.diagnostics)?;
            print_state(response.new_state.as_ref())?;
        }
        Commands::Read { type_name, id } => {
            let current = EncodedValue::encode(&make_state(vec![("id", string_value(&id))]))?;
            let response = provider.read_resource(&type_name, Some(&current)).await?;
            check(&response.diagnostics)?;
            if response.new_state.is_none() {
                bail!("{} {} does not exist", type_name, id);
            }
            print_state(response.new_state.as_ref())?;
        }
        Commands::Import { type_name, id } => {
            let response = provider.import_resource_state(&type_name, &id).await?;
            check(&response.diagnostics)?;
            for imported in &response.imported_resources {
                print_state(Some(&imported.state))?;
            }
        }
        Commands::Destroy { type_name, id } => {
            let prior = EncodedValue::encode(&make_state(vec![("id", string_value(&id))]))?;
            let response = provider.apply_resource_change(&type_name, Some(&prior), None).await?;
            check(&response.diagnostics)?;
            info!("Destroyed {} {}", type_name, id);
        }
        Commands::Types => {
            for type_name in provider.resource_types().await {
                println!("{}", type_name);
            }
        }
    }

    Ok(())
}

fn check(diagnostics: &[Diagnostic]) -> anyhow::Result<()> {
    if let Some(first) = diagnostics.first() {
        bail!("{}: {}", first.summary, first.detail);
    }
    Ok(())
}

fn print_state(state: Option<&EncodedValue>) -> anyhow::Result<()> {
    let Some(state) = state else {
        return Ok(());
    };
    let value: serde_json::Value = state.decode()?.into();
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
