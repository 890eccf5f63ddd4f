//! Operator CLI
//!
//! Talks to a running router's admin API and renders deterministic
//! plaintext reports. Exit code 0 on success, non-zero on error.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use helmsman::ops::{self, DatalossReport, MetadataReport};

#[derive(Parser)]
#[command(name = "helmsman")]
#[command(about = "helmsman cluster operator CLI")]
#[command(version)]
struct Cli {
    /// Router admin API URL
    #[arg(long, default_value = "http://localhost:5000")]
    router: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List unavailable repositories and their replica states
    Dataloss {
        /// Limit the report to one virtual storage
        #[arg(long)]
        virtual_storage: Option<String>,

        /// Also list repositories that are available but have
        /// out-of-date or unhealthy assigned replicas
        #[arg(long)]
        partially_unavailable: bool,
    },

    /// Show placement metadata for one repository
    Metadata {
        /// Repository id
        #[arg(long)]
        repository_id: Option<u64>,

        /// Virtual storage (requires --relative-path)
        #[arg(long)]
        virtual_storage: Option<String>,

        /// Relative path (requires --virtual-storage)
        #[arg(long)]
        relative_path: Option<String>,
    },

    /// Register a repository created outside the router
    TrackRepository {
        #[arg(long)]
        virtual_storage: String,

        /// Relative path of the repository
        #[arg(long)]
        repository: String,

        /// Storage whose copy is the source of truth
        #[arg(long)]
        authoritative_storage: String,
    },

    /// Remove a repository record and its replicas
    RemoveRepository {
        #[arg(long)]
        virtual_storage: String,

        /// Relative path of the repository
        #[arg(long)]
        repository: String,
    },

    /// Declare one replica's contents authoritative after dataloss
    AcceptDataloss {
        #[arg(long)]
        virtual_storage: String,

        /// Relative path of the repository
        #[arg(long)]
        repository: String,

        /// Storage whose copy is the source of truth
        #[arg(long)]
        authoritative_storage: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Dataloss {
            virtual_storage,
            partially_unavailable,
        } => {
            let mut request = client
                .get(format!("{}/admin/dataloss", cli.router))
                .query(&[("partially_unavailable", partially_unavailable.to_string())]);
            if let Some(vs) = &virtual_storage {
                request = request.query(&[("virtual_storage", vs.as_str())]);
            }
            let reports: Vec<DatalossReport> = fetch(request).await?;
            print!("{}", ops::dataloss::render(&reports));
        }

        Commands::Metadata {
            repository_id,
            virtual_storage,
            relative_path,
        } => {
            let request = client.get(format!("{}/admin/metadata", cli.router));
            let request = match (repository_id, &virtual_storage, &relative_path) {
                (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                    bail!("virtual storage and relative path can't be provided with a repository ID")
                }
                (Some(id), None, None) => {
                    request.query(&[("repository_id", id.to_string())])
                }
                (None, Some(vs), Some(path)) => request.query(&[
                    ("virtual_storage", vs.as_str()),
                    ("relative_path", path.as_str()),
                ]),
                (None, Some(_), None) => bail!("relative path is required with virtual storage"),
                (None, None, Some(_)) => bail!("virtual storage is required with relative path"),
                (None, None, None) => {
                    bail!("repository id or virtual storage and relative path required")
                }
            };
            let report: MetadataReport = fetch(request).await?;
            print!("{}", ops::metadata::render(&report));
        }

        Commands::TrackRepository {
            virtual_storage,
            repository,
            authoritative_storage,
        } => {
            let result: ops::track::TrackResult = fetch(
                client
                    .post(format!("{}/admin/track-repository", cli.router))
                    .json(&serde_json::json!({
                        "virtual_storage": virtual_storage,
                        "relative_path": repository,
                        "authoritative_storage": authoritative_storage,
                    })),
            )
            .await?;
            if result.created {
                println!("repository tracked with id {}", result.repository_id);
            } else {
                println!("repository already tracked with id {}", result.repository_id);
            }
        }

        Commands::RemoveRepository {
            virtual_storage,
            repository,
        } => {
            let result: ops::track::RemoveResult = fetch(
                client
                    .post(format!("{}/admin/remove-repository", cli.router))
                    .json(&serde_json::json!({
                        "virtual_storage": virtual_storage,
                        "relative_path": repository,
                    })),
            )
            .await?;
            println!(
                "repository {} removed, deletion queued on: {}",
                result.repository_id,
                result.storages.join(", ")
            );
        }

        Commands::AcceptDataloss {
            virtual_storage,
            repository,
            authoritative_storage,
        } => {
            let result: ops::track::AcceptResult = fetch(
                client
                    .post(format!("{}/admin/accept-dataloss", cli.router))
                    .json(&serde_json::json!({
                        "virtual_storage": virtual_storage,
                        "relative_path": repository,
                        "authoritative_storage": authoritative_storage,
                    })),
            )
            .await?;
            println!(
                "storage {} is now authoritative at generation {}",
                result.authoritative_storage, result.generation
            );
        }
    }

    Ok(())
}

async fn fetch<T: serde::de::DeserializeOwned>(request: reqwest::RequestBuilder) -> anyhow::Result<T> {
    let response = request.send().await.context("router unreachable")?;
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        bail!("router returned {}: {}", status, detail);
    }
    response.json().await.context("invalid router response")
}
