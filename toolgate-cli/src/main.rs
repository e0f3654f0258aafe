use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use toolgate_cli::cli_args;
use toolgate_cli::cli_args::AuditCommand;
use toolgate_cli::cli_args::Command;
use toolgate_cli::cli_args::ConfigCommand;
use toolgate_cli::cli_args::EndpointsCommand;
use toolgate_cli::cli_args::PoliciesCommand;
use toolgate_cli::ToolgateCli;
use toolgate_core::Gateway;
use toolgate_core::GatewayConfig;
use toolgate_core::PidFile;
use toolgate_core::Secrets;
use toolgate_security::AuditLog;
use toolgate_security::PolicyTexts;
use tracing::info;
use tracing::warn;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the JSON protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = ToolgateCli::parse();
    cli_args::validate(&cli)?;
    let config = GatewayConfig::load_from(&cli.config, |name| std::env::var(name).ok())
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Exec { request } => {
            let request = cli_args::parse_request(&request)?;
            let gateway = Gateway::open(config)?;
            let outcome = gateway.execute(request).await;
            gateway.write_snapshots();
            match outcome {
                Ok(output) => print_json(&output),
                Err(err) => {
                    print_json(&err.to_json())?;
                    anyhow::bail!("action failed: {err}")
                }
            }
        }
        Command::Policies { command } => match command {
            PoliciesCommand::Validate { dir } => {
                let dir = dir.unwrap_or_else(|| config.policy_dir.clone());
                let texts = PolicyTexts::read_dir(&dir)?;
                let policy = toolgate_security::policy::compile(&texts, &config.workspace, 1)
                    .with_context(|| format!("policy bundle in {} is invalid", dir.display()))?;
                print_json(&policy.summary())
            }
            PoliciesCommand::Reload => {
                let pid = toolgate_core::send_reload_signal(&config.pid_path())?;
                println!("reload requested from process {pid}");
                Ok(())
            }
        },
        Command::Endpoints {
            command: EndpointsCommand::Health(args),
        } => {
            let gateway = Gateway::open(config)?;
            let health = if args.probe {
                gateway.endpoints().probe_all().await
            } else {
                gateway.endpoints().health()
            };
            print_json(&health)
        }
        Command::Negotiate => {
            let gateway = Gateway::open(config)?;
            let capability = gateway.negotiate().await;
            print_json(capability.as_ref())
        }
        Command::Resume { run_id } => {
            let gateway = Gateway::open(config)?;
            print_json(&gateway.resume(&run_id)?)
        }
        Command::Audit {
            command: AuditCommand::Tail(args),
        } => {
            let audit = AuditLog::open(&config.audit_dir())?;
            for event in audit.tail(args.run_id.as_deref(), args.limit)? {
                println!("{}", serde_json::to_string(&event)?);
            }
            Ok(())
        }
        Command::Config {
            command: ConfigCommand::View,
        } => {
            let secrets = Secrets::load(config.secrets_file.as_deref())?;
            print_json(&config.public_view(&secrets))
        }
    }
}

async fn serve(config: GatewayConfig) -> anyhow::Result<()> {
    let gateway = Arc::new(Gateway::open(config)?);
    let pid_file = PidFile::create(&gateway.config().pid_path())?;
    let cancel = CancellationToken::new();

    let capability = gateway.negotiate().await;
    info!(
        mode = ?capability.mode(),
        policy_version = gateway.policy_version(),
        workspace = %gateway.workspace().display(),
        "gateway serving on stdin/stdout"
    );

    let reload = toolgate_core::spawn_reload_listener(Arc::clone(&gateway), cancel.child_token())?;
    let background = gateway.spawn_background();
    let signals = tokio::spawn(shutdown_signal(cancel.clone()));

    let served = toolgate_cli::serve(
        Arc::clone(&gateway),
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        cancel.clone(),
    )
    .await;

    cancel.cancel();
    signals.abort();
    gateway.shutdown();
    for handle in background.into_iter().chain(std::iter::once(reload)) {
        if let Err(err) = handle.await {
            warn!(error = %err, "background task ended abnormally");
        }
    }
    drop(pid_file);
    served
}

#[cfg(unix)]
async fn shutdown_signal(cancel: CancellationToken) {
    use tokio::signal::unix::SignalKind;
    use tokio::signal::unix::signal;

    let installed = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    );
    let (mut sigterm, mut sigint) = match installed {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(err), _) | (_, Err(err)) => {
            warn!(error = %err, "cannot install shutdown signal handlers");
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}

#[cfg(not(unix))]
async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "cannot listen for ctrl-c");
                return;
            }
            info!("received ctrl-c");
        }
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
