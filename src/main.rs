use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

mod cli;

use aft_tracker::{config, init_telemetry, AftConfig, RequestId, SignatureMethod};
use cli::commands::{
    ApproveCommand, AtRiskCommand, CreateCommand, RejectCommand, SignSmeCommand,
    SignaturesCommand, SubmitCommand, TimelineCommand, VerifySignatureCommand,
};
use cli::{CliContext, Identity};

#[derive(Parser)]
#[command(name = "aft")]
#[command(about = "Assured File Transfer request tracker")]
#[command(long_about = "Tracks transfer requests through DAO, ISSM and CPSO review, DTA transfer, \
                       SME two-person integrity and media custody, recording a signature at each \
                       gated step and an append-only history.")]
struct Cli {
    /// Configuration file (defaults to aft.toml / .aft-rc / AFT_* variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Database URL, overriding the configured one
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    Migrate,
    /// Open a new draft request
    Create {
        #[arg(long)]
        title: String,
        /// standard, low-to-high or high-to-low
        #[arg(long, default_value = "standard")]
        transfer_type: String,
        #[arg(long)]
        classification: String,
        #[arg(long, default_value = "manual")]
        signature_method: SignatureMethod,
        #[command(flatten)]
        identity: Identity,
    },
    /// Submit a draft with a manual signature
    Submit {
        request_id: RequestId,
        /// Name to sign with; defaults to --name
        #[arg(long)]
        signer_name: Option<String>,
        #[command(flatten)]
        identity: Identity,
    },
    /// Approve the request at your review step
    Approve {
        request_id: RequestId,
        #[arg(long)]
        notes: Option<String>,
        #[command(flatten)]
        identity: Identity,
    },
    /// Reject a pending request
    Reject {
        request_id: RequestId,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        notes: Option<String>,
        #[command(flatten)]
        identity: Identity,
    },
    /// Record the SME two-person integrity signature
    SignSme {
        request_id: RequestId,
        #[arg(long)]
        notes: Option<String>,
        #[command(flatten)]
        identity: Identity,
    },
    /// Show a request's history and progress
    Timeline { request_id: RequestId },
    /// List a request's signatures, most recent first
    Signatures { request_id: RequestId },
    /// Re-check a stored signature's integrity hash and certificate window
    VerifySignature { signature_id: Uuid },
    /// List requests idle past the SLA
    AtRisk,
}

fn load_config(path: Option<&PathBuf>) -> Result<AftConfig> {
    match path {
        Some(path) => AftConfig::load_from(path),
        None => Ok(config()?.clone()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_telemetry(&config.observability)?;

    tokio::runtime::Runtime::new()?.block_on(async move {
        let ctx = CliContext::open(config, cli.database_url).await?;
        let mut intact = true;
        let result = match cli.command {
            Commands::Migrate => {
                ctx.storage.migrate().await?;
                println!("✅ Database schema is up to date");
                Ok(())
            }
            Commands::Create {
                title,
                transfer_type,
                classification,
                signature_method,
                identity,
            } => {
                CreateCommand {
                    title,
                    transfer_type,
                    classification,
                    signature_method,
                }
                .execute(&ctx, &identity)
                .await
            }
            Commands::Submit {
                request_id,
                signer_name,
                identity,
            } => {
                SubmitCommand {
                    request_id,
                    signer_name,
                }
                .execute(&ctx, &identity)
                .await
            }
            Commands::Approve {
                request_id,
                notes,
                identity,
            } => ApproveCommand { request_id, notes }.execute(&ctx, &identity).await,
            Commands::Reject {
                request_id,
                reason,
                notes,
                identity,
            } => {
                RejectCommand {
                    request_id,
                    reason,
                    notes,
                }
                .execute(&ctx, &identity)
                .await
            }
            Commands::SignSme {
                request_id,
                notes,
                identity,
            } => SignSmeCommand { request_id, notes }.execute(&ctx, &identity).await,
            Commands::Timeline { request_id } => TimelineCommand { request_id }.execute(&ctx).await,
            Commands::Signatures { request_id } => {
                SignaturesCommand { request_id }.execute(&ctx).await
            }
            Commands::VerifySignature { signature_id } => {
                let command = VerifySignatureCommand { signature_id };
                match command.execute(&ctx).await {
                    Ok(ok) => {
                        intact = ok;
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            Commands::AtRisk => AtRiskCommand.execute(&ctx).await,
        };
        ctx.close().await;
        result?;
        if !intact {
            std::process::exit(2);
        }
        Ok::<(), anyhow::Error>(())
    })
}
