//! `enclave` command-line client over the local store.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use enclave_rs::config::EnclaveConfig;
use enclave_rs::core::{Actor, RequestContext};
use enclave_rs::driver::ExecConfig;
use enclave_rs::protocol::{
    ActorType, ApprovalPolicy, ApproveRequest, AuditLogRequest, CreateSandboxRequest, GcRequest,
    ListRequest, RejectRequest, SandboxId, SandboxStatus, StopSandboxRequest,
};
use enclave_rs::{Enclave, init_logging};
use log::info;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Command-line options for the Enclave client.
#[derive(Parser)]
#[command(name = "enclave", version, about = "Copy-on-write workspace sandboxes")]
struct Cli {
    /// Optional path to an enclave.json5 config file (skips layering)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Abort the operation after this many seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create and mount a sandbox over a project subtree
    Create {
        scope: String,
        #[arg(long)]
        project_root: Option<PathBuf>,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        idempotency_key: Option<String>,
        #[arg(long)]
        driver: Option<String>,
    },
    /// Show one sandbox
    Get { id: SandboxId },
    /// List sandboxes
    List {
        #[arg(long)]
        status: Vec<SandboxStatus>,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        scope_prefix: Option<String>,
        #[arg(long)]
        page_size: Option<usize>,
        #[arg(long)]
        page_token: Option<String>,
    },
    /// Show the change set of a sandbox
    Changes { id: SandboxId },
    /// Unmount an active sandbox
    Stop {
        id: SandboxId,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Apply a sandbox's changes to the host tree
    Approve {
        id: SandboxId,
        #[arg(long)]
        actor: String,
        #[arg(long, default_value = "user")]
        actor_type: ActorType,
        /// JSON file holding an approval policy
        #[arg(long)]
        policy: Option<PathBuf>,
        #[arg(long)]
        manual_override: bool,
    },
    /// Discard a sandbox's changes
    Reject {
        id: SandboxId,
        #[arg(long)]
        actor: String,
        #[arg(long, default_value = "user")]
        actor_type: ActorType,
    },
    /// Delete a terminal sandbox and its storage
    Delete {
        id: SandboxId,
        #[arg(long)]
        actor: String,
    },
    /// Run a command inside an active sandbox
    Exec {
        id: SandboxId,
        /// Run without bubblewrap namespaces
        #[arg(long)]
        no_confine: bool,
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run garbage collection once with the configured default policy
    Gc {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Show audit events
    Audit {
        #[arg(long)]
        sandbox: Option<SandboxId>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Show aggregate sandbox statistics
    Stats,
    /// Settle sandboxes left mid-operation by a previous process
    Recover,
    /// Recover, then run the GC loop until interrupted
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let config = match cli.config.as_ref() {
        Some(path) => EnclaveConfig::from_file(path).context("failed to load config")?,
        None => {
            EnclaveConfig::discover(cwd.clone())
                .context("failed to load layered config")?
                .config
        }
    };
    let enclave = Enclave::open(config).context("failed to open enclave")?;
    let shutdown = CancellationToken::new();
    let mut ctx = RequestContext::with_token(shutdown.child_token());
    if let Some(secs) = cli.timeout {
        ctx = ctx.with_timeout(Duration::from_secs(secs));
    }
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });
    run(&enclave, &ctx, cli.command, cwd, shutdown).await
}

async fn run(
    enclave: &Enclave,
    ctx: &RequestContext,
    command: Command,
    cwd: PathBuf,
    shutdown: CancellationToken,
) -> Result<()> {
    let service = enclave.service();
    match command {
        Command::Create {
            scope,
            project_root,
            owner,
            idempotency_key,
            driver,
        } => {
            let root = match project_root {
                Some(path) if path.is_absolute() => path,
                Some(path) => cwd.join(path),
                None => cwd,
            };
            let request = CreateSandboxRequest {
                scope_path: scope,
                project_root: root,
                owner,
                idempotency_key,
                driver_hint: driver,
            };
            print_json(&service.create(ctx, request).await?)
        }
        Command::Get { id } => print_json(&service.get(ctx, id)?),
        Command::List {
            status,
            owner,
            scope_prefix,
            page_size,
            page_token,
        } => {
            let request = ListRequest {
                status: (!status.is_empty()).then_some(status),
                owner,
                scope_prefix,
                page_size,
                page_token,
                ..ListRequest::default()
            };
            print_json(&service.list(ctx, &request)?)
        }
        Command::Changes { id } => print_json(&service.changes(ctx, id).await?),
        Command::Stop { id, actor } => {
            print_json(&service.stop(ctx, StopSandboxRequest { id, actor }).await?)
        }
        Command::Approve {
            id,
            actor,
            actor_type,
            policy,
            manual_override,
        } => {
            let policy = match policy {
                Some(path) => Some(load_policy(&path)?),
                None => None,
            };
            let request = ApproveRequest {
                id,
                actor,
                actor_type,
                policy,
                manual_override,
            };
            print_json(&service.approve(ctx, request).await?)
        }
        Command::Reject {
            id,
            actor,
            actor_type,
        } => {
            let request = RejectRequest {
                id,
                actor,
                actor_type,
            };
            print_json(&service.reject(ctx, request).await?)
        }
        Command::Delete { id, actor } => {
            let deleted = service.delete(ctx, id, &Actor::user(actor)).await?;
            print_json(&serde_json::json!({ "id": id, "deleted": deleted }))
        }
        Command::Exec {
            id,
            no_confine,
            command,
            args,
        } => {
            let cfg = if no_confine {
                ExecConfig::process()
            } else {
                ExecConfig::default()
            };
            print_json(&service.exec(ctx, id, &cfg, &command, &args).await?)
        }
        Command::Gc {
            dry_run,
            limit,
            actor,
        } => {
            let request = GcRequest {
                policy: None,
                dry_run,
                limit,
                actor,
            };
            print_json(&enclave.gc().run(ctx, request).await?)
        }
        Command::Audit {
            sandbox,
            limit,
            offset,
        } => {
            let request = AuditLogRequest {
                sandbox_id: sandbox,
                limit,
                offset,
            };
            print_json(&service.audit_log(ctx, &request)?)
        }
        Command::Stats => print_json(&service.stats(ctx)?),
        Command::Recover => print_json(&service.recover(ctx).await?),
        Command::Serve => {
            let report = service.recover(ctx).await?;
            info!(
                "startup recovery done (stopped={}, failed={})",
                report.stopped.len(),
                report.failed.len()
            );
            match enclave.gc_loop() {
                Some(gc_loop) => gc_loop.run(shutdown).await,
                None => {
                    info!("gc disabled; waiting for shutdown");
                    shutdown.cancelled().await;
                }
            }
            Ok(())
        }
    }
}

fn load_policy(path: &Path) -> Result<ApprovalPolicy> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy {}", path.display()))?;
    let policy: ApprovalPolicy = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse policy {}", path.display()))?;
    Ok(policy)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
