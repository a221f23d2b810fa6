//! Provisioner CLI - k3s cluster provisioning on Hetzner Cloud.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use provisioner::bootstrap::{placeholders, KEYS};
use provisioner::{
    ApplyReport, EnvSecretStore, HetznerCloud, Orchestrator, ProvisionerConfig, Tailscale,
};

/// Provisioner CLI - k3s cluster provisioning on Hetzner Cloud.
#[derive(Parser)]
#[command(name = "provisioner")]
#[command(about = "Provision and reconcile a k3s cluster on Hetzner Cloud")]
struct Cli {
    /// Configuration file.
    #[arg(short, long, env = "PROVISIONER_CONFIG", default_value = "provisioner.yaml")]
    config: PathBuf,

    /// Hetzner Cloud API token (or set `HCLOUD_TOKEN` env var).
    #[arg(long, env = "HCLOUD_TOKEN", hide_env_values = true)]
    hcloud_token: Option<String>,

    /// Tailscale API key (or set `TAILSCALE_API_KEY` env var).
    #[arg(long, env = "TAILSCALE_API_KEY", hide_env_values = true)]
    tailscale_api_key: Option<String>,

    /// Tailnet name; `-` is the API key's default tailnet.
    #[arg(long, env = "TAILSCALE_TAILNET", default_value = "-")]
    tailnet: String,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the nodes the configuration asks for.
    Plan,

    /// Create, adopt and delete nodes until the cluster matches.
    Apply {
        /// Fail a node whose template has placeholders without a value.
        #[arg(long, default_value = "false")]
        strict_template: bool,
    },

    /// Remove tailnet devices that no longer belong to a node.
    Reconcile,

    /// List the template's placeholders and flag unknown ones.
    CheckTemplate {
        /// Template file (defaults to the configured one).
        #[arg(long)]
        template: Option<PathBuf>,
    },
}

fn registry(cli: &Cli) -> Result<Tailscale> {
    let key = cli
        .tailscale_api_key
        .clone()
        .context("TAILSCALE_API_KEY is not set")?;
    Tailscale::new(SecretString::from(key), cli.tailnet.clone())
        .context("Failed to create Tailscale client")
}

fn print_report(report: &ApplyReport) {
    println!(
        "\n{:<14} {:<32} {:<12} {:<16}",
        "ROLE", "NAME", "PRIVATE IP", "PUBLIC IPv4"
    );
    println!("{}", "-".repeat(76));
    for node in report.nodes() {
        println!(
            "{:<14} {:<32} {:<12} {:<16}",
            node.role.slug(),
            node.name,
            node.private_ip,
            node.public_ipv4.clone().unwrap_or_default()
        );
    }

    for rollout in &report.rollouts {
        if let Some(e) = &rollout.failure {
            println!("❌ {}: {e}", rollout.role.display_name());
        }
        if !rollout.skipped.is_empty() {
            println!(
                "⏭️  {} skipped: {:?}",
                rollout.role.display_name(),
                rollout.skipped
            );
        }
    }
    for name in &report.deleted {
        println!("🗑️  Deleted {name}");
    }
    for e in &report.teardown_failures {
        println!("❌ {e}");
    }
    for failure in &report.attachment_failures {
        println!(
            "❌ {} -> {}: {}",
            failure.node, failure.load_balancer, failure.error
        );
    }
    for (name, ip) in &report.load_balancers {
        println!("🌐 {name}: {ip}");
    }
    if let Some(reconciled) = &report.reconcile {
        println!(
            "🔁 Tailnet: {} deleted, {} failed, {} kept",
            reconciled.deleted.len(),
            reconciled.failed.len(),
            reconciled.kept.len()
        );
    }
    if let Some(e) = &report.reconcile_error {
        println!("❌ Tailnet reconciliation: {e}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ProvisionerConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    match &cli.command {
        Commands::Plan => {
            let planned = Orchestrator::plan(&config.topology)?;
            println!(
                "\n{:<32} {:<12} {:<10} {:<20} {:<40}",
                "NAME", "PRIVATE IP", "ROLE", "PLACEMENT GROUP", "TAILNET HOSTNAME"
            );
            println!("{}", "-".repeat(116));
            for node in &planned {
                println!(
                    "{:<32} {:<12} {:<10} {:<20} {:<40}",
                    node.name,
                    node.private_ip,
                    node.node_role,
                    node.placement_group,
                    node.tailnet_hostname
                );
            }
            println!("\n{} node(s) for stage {}", planned.len(), config.topology.stage);
        }

        Commands::Apply { strict_template } => {
            let token = cli
                .hcloud_token
                .clone()
                .context("HCLOUD_TOKEN is not set")?;
            let provider = HetznerCloud::new(SecretString::from(token))
                .context("Failed to create Hetzner Cloud client")?;
            let template = std::fs::read_to_string(&config.template_path).with_context(|| {
                format!("Failed to read template {}", config.template_path.display())
            })?;

            let orchestrator = Orchestrator::new(
                Arc::new(provider),
                Arc::new(registry(&cli)?),
                Arc::new(EnvSecretStore::new(config.secrets.env_prefix.clone())),
                template,
            )
            .with_strict_template(*strict_template)
            .with_storage(config.storage.clone());

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, finishing in-flight nodes");
                    on_signal.cancel();
                }
            });

            let report = orchestrator
                .apply(&config.topology, &cancel)
                .await
                .context("Provisioning failed")?;
            print_report(&report);

            if !report.is_success() {
                bail!("Cluster did not converge");
            }
            println!("\n✅ Stage {} is up to date", config.topology.stage);
        }

        Commands::Reconcile => {
            let registry = registry(&cli)?;

            info!(stage = %config.topology.stage, "Reconciling tailnet");
            let report = Orchestrator::reconcile_registry(&registry, &config.topology)
                .await
                .context("Tailnet reconciliation failed")?;
            for name in &report.deleted {
                println!("🗑️  Deleted {name}");
            }
            for (name, e) in &report.failed {
                println!("❌ {name}: {e}");
            }
            if !report.is_clean() {
                bail!("{} device(s) could not be deleted", report.failed.len());
            }
            println!("\n✅ Tailnet reconciled ({} kept)", report.kept.len());
        }

        Commands::CheckTemplate { template } => {
            let path = template.as_ref().unwrap_or(&config.template_path);
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read template {}", path.display()))?;

            let names = placeholders(&text);
            let unknown: Vec<&String> = names
                .iter()
                .filter(|name| !KEYS.contains(&name.as_str()))
                .collect();

            for name in &names {
                let marker = if KEYS.contains(&name.as_str()) { "✅" } else { "❌" };
                println!("{marker} {name}");
            }
            if !unknown.is_empty() {
                bail!(
                    "{} placeholder(s) have no value and render empty: {}",
                    unknown.len(),
                    unknown
                        .iter()
                        .map(|name| name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            println!("\n✅ {} placeholder(s), all provided", names.len());
        }
    }

    Ok(())
}
