//! IAM server entry point.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use edgeiam_common::config::{self, Config, IdentifierConfig};
use edgeiam_server::collaborators::{IdentityProvider, NodeInfoStore, PermissionStore};
use edgeiam_server::identity::FileIdentity;
use edgeiam_server::keystore::FileCredentialStore;
use edgeiam_server::nodeinfo;
use edgeiam_server::nodestore::MemoryNodeStore;
use edgeiam_server::permstore::MemoryPermissionStore;
use edgeiam_server::provisioning::{ProcessRunner, ProvisioningCmds, ProvisioningStateMachine};
use edgeiam_server::{IamServer, ServerContext, ServerSettings};

const DEFAULT_CONFIG_PATH: &str = "/etc/edgeiam/iam.cfg";

/// IAM server for the edge fleet.
#[derive(Parser)]
#[command(name = "edgeiam", version, about = "IAM server for the edge fleet")]
struct Cli {
    /// Enables provisioning mode: plaintext endpoints and the
    /// provisioning RPC family.
    #[arg(short, long)]
    provisioning: bool,

    /// Formats logs for the journal sink (no colors, no timestamps).
    #[arg(short, long)]
    journal: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info")]
    verbose: String,

    /// Path to the configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

fn init_logging(cli: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_new(&cli.verbose)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if cli.journal {
        // The journal stamps and colors entries itself.
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .without_time()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = config::load_from_file(&cli.config)
        .with_context(|| format!("can't parse config {}", cli.config))?;

    info!(config = %cli.config, provisioning = cli.provisioning, "initializing IAM server");

    let local = nodeinfo::load_local_node(&config.node_info).context("can't read node info")?;

    let state = ProvisioningStateMachine::new(
        &config.node_info.provisioning_state_path,
        provisioning_cmds(&config),
        Arc::new(ProcessRunner),
    )
    .context("can't read provisioning state")?;

    let node_store: Arc<dyn NodeInfoStore> = if config.database.working_dir.is_empty() {
        Arc::new(MemoryNodeStore::new())
    } else {
        Arc::new(
            MemoryNodeStore::with_working_dir(&config.database.working_dir)
                .context("can't open node database")?,
        )
    };

    let credentials = Arc::new(
        FileCredentialStore::new(&config.database.working_dir, &config.cert_modules)
            .context("can't initialize cert modules")?,
    );

    let file_identity = match &config.identifier {
        Some(IdentifierConfig::File(params)) => {
            Some(Arc::new(FileIdentity::new(params).context("can't initialize identifier")?))
        }
        None => None,
    };
    let identity: Option<Arc<dyn IdentityProvider>> =
        file_identity.clone().map(|provider| provider as Arc<dyn IdentityProvider>);

    let permissions: Option<Arc<dyn PermissionStore>> = config
        .enable_permissions_handler
        .then(|| Arc::new(MemoryPermissionStore::new()) as Arc<dyn PermissionStore>);

    let ctx = ServerContext::new(local, state, node_store, credentials, identity, permissions)
        .await
        .context("can't initialize server context")?;

    // The subjects file has no change notification; poll it until
    // shutdown so subject-changed subscribers see updates.
    if let Some(provider) = &file_identity {
        provider.clone().start_polling(ctx.shutdown.clone());
    }

    let settings = ServerSettings::from_config(&config, cli.provisioning);
    let server = IamServer::start(settings, ctx).await.context("can't start server")?;

    wait_for_termination(&server).await;

    server.stop().await;
    Ok(())
}

async fn wait_for_termination(server: &IamServer) {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!(error = %err, "can't install SIGTERM handler");
            server.wait().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = server.wait() => {}
    }
}

fn provisioning_cmds(config: &Config) -> ProvisioningCmds {
    ProvisioningCmds {
        start_provisioning: config.start_provisioning_cmd_args.clone(),
        disk_encryption: config.disk_encryption_cmd_args.clone(),
        finish_provisioning: config.finish_provisioning_cmd_args.clone(),
        deprovision: config.deprovision_cmd_args.clone(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(err) = run(cli).await {
        error!(error = %format!("{err:#}"), "fatal");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
