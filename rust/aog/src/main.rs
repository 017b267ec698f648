//! AOG - main entry point.
//!
//! `aog server start` runs the gateway; the resource subcommands are thin
//! clients of its HTTP API.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use mimalloc::MiMalloc;

use aog::config::AppConfig;
use aog::domain::HybridPolicy;

// Use mimalloc for better performance
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(name = "aog")]
#[command(about = "AOG - on-device AI gateway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage the gateway process.
    Server {
        #[command(subcommand)]
        command: ServerCommand,
    },
    /// List resources.
    Get {
        /// What to list.
        #[arg(value_enum)]
        resource: Resource,
    },
    /// Install a service.
    Install {
        /// Service name (chat, embed, generate, ...).
        service_name: String,
        /// Preferred remote provider.
        #[arg(long)]
        remote_provider: Option<String>,
        /// Preferred local provider.
        #[arg(long)]
        local_provider: Option<String>,
        /// Routing preference: default, always_local, always_remote.
        #[arg(long)]
        hybrid_policy: Option<String>,
    },
    /// Edit a service's routing.
    Edit {
        /// Service to edit.
        service_name: String,
        /// Routing preference: default, always_local, always_remote.
        #[arg(long)]
        hybrid_policy: Option<String>,
        /// Preferred remote provider.
        #[arg(long)]
        remote_provider: Option<String>,
        /// Preferred local provider.
        #[arg(long)]
        local_provider: Option<String>,
    },
    /// Delete a resource.
    Delete {
        /// What to delete.
        #[arg(value_enum)]
        resource: Deletable,
        /// Resource name.
        name: String,
        /// Owning provider, for models.
        #[arg(long)]
        provider: Option<String>,
    },
    /// Export the configuration.
    Export {
        /// Write to a file instead of stdout.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Import a configuration bundle.
    Import {
        /// Bundle file produced by export.
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ServerCommand {
    /// Start the gateway.
    Start {
        /// Detach and log to the console file.
        #[arg(long)]
        daemon: bool,
        /// Verbose logging.
        #[arg(long)]
        verbose: bool,
    },
    /// Stop a running gateway.
    Stop,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Resource {
    Services,
    ServiceProviders,
    Models,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Deletable {
    ServiceProvider,
    Model,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load()?;

    match cli.command {
        Commands::Server { command } => match command {
            ServerCommand::Start { daemon, verbose } => {
                if daemon && !aog::lifecycle::is_daemon_child() {
                    return aog::lifecycle::daemonize(&config, verbose);
                }
                let level = if verbose { "debug" } else { config.logging.level.as_str() };
                aog::logging::init(level);
                aog::server::run(config).await
            }
            ServerCommand::Stop => {
                aog::logging::init("warn");
                aog::lifecycle::stop(&config).await
            }
        },
        Commands::Get { resource } => {
            let path = match resource {
                Resource::Services => "/service",
                Resource::ServiceProviders => "/service_provider",
                Resource::Models => "/model",
            };
            print_response(client_get(&config, path).await?)
        }
        Commands::Install {
            service_name,
            remote_provider,
            local_provider,
            hybrid_policy,
        } => {
            let body = serde_json::json!({
                "service_name": service_name,
                "hybrid_policy": parse_policy(hybrid_policy.as_deref())?,
                "remote_provider": remote_provider,
                "local_provider": local_provider,
            });
            print_response(client_post(&config, "/service/install", &body).await?)
        }
        Commands::Edit {
            service_name,
            hybrid_policy,
            remote_provider,
            local_provider,
        } => {
            let body = serde_json::json!({
                "service_name": service_name,
                "hybrid_policy": parse_policy(hybrid_policy.as_deref())?,
                "remote_provider": remote_provider,
                "local_provider": local_provider,
            });
            print_response(client_put(&config, "/service", &body).await?)
        }
        Commands::Delete {
            resource,
            name,
            provider,
        } => match resource {
            Deletable::ServiceProvider => {
                let body = serde_json::json!({"provider_name": name});
                print_response(client_delete(&config, "/service_provider", &body).await?)
            }
            Deletable::Model => {
                let body = serde_json::json!({"model_name": name, "provider_name": provider});
                print_response(client_delete(&config, "/model", &body).await?)
            }
        },
        Commands::Export { file } => {
            let value = client_post(&config, "/service/export", &serde_json::json!({})).await?;
            let text = serde_json::to_string_pretty(&value)?;
            match file {
                Some(path) => {
                    std::fs::write(&path, text)?;
                    println!("Exported to {}", path.display());
                }
                None => println!("{text}"),
            }
            Ok(())
        }
        Commands::Import { file } => {
            let text = std::fs::read_to_string(&file)?;
            let bundle: serde_json::Value = serde_json::from_str(&text)?;
            // Accept either a bare bundle or a full export envelope.
            let bundle = bundle.get("data").cloned().unwrap_or(bundle);
            print_response(client_post(&config, "/service/import", &bundle).await?)
        }
    }
}

fn parse_policy(value: Option<&str>) -> anyhow::Result<HybridPolicy> {
    match value {
        None | Some("default") => Ok(HybridPolicy::Default),
        Some("always_local") => Ok(HybridPolicy::AlwaysLocal),
        Some("always_remote") => Ok(HybridPolicy::AlwaysRemote),
        Some(other) => anyhow::bail!(
            "invalid hybrid policy {other:?} (expected default, always_local, always_remote)"
        ),
    }
}

fn api_url(config: &AppConfig, path: &str) -> String {
    format!("{}{path}", config.server.base_url())
}

async fn client_get(config: &AppConfig, path: &str) -> anyhow::Result<serde_json::Value> {
    let response = reqwest::Client::new()
        .get(api_url(config, path))
        .send()
        .await?;
    Ok(response.json().await?)
}

async fn client_post(
    config: &AppConfig,
    path: &str,
    body: &serde_json::Value,
) -> anyhow::Result<serde_json::Value> {
    let response = reqwest::Client::new()
        .post(api_url(config, path))
        .json(body)
        .send()
        .await?;
    Ok(response.json().await?)
}

async fn client_put(
    config: &AppConfig,
    path: &str,
    body: &serde_json::Value,
) -> anyhow::Result<serde_json::Value> {
    let response = reqwest::Client::new()
        .put(api_url(config, path))
        .json(body)
        .send()
        .await?;
    Ok(response.json().await?)
}

async fn client_delete(
    config: &AppConfig,
    path: &str,
    body: &serde_json::Value,
) -> anyhow::Result<serde_json::Value> {
    let response = reqwest::Client::new()
        .delete(api_url(config, path))
        .json(body)
        .send()
        .await?;
    Ok(response.json().await?)
}

fn print_response(value: serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
