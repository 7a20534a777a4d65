use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use k2s_bootstrap::config::ControlSettings;
use k2s_bootstrap::control::{self, ControlRuntime};
use k2s_bootstrap::passwd::{NodePasswords, Passwd};
use k2s_bootstrap::paths::ControlPaths;
use k2s_bootstrap::proxy::{self, ApiProxy};
use k2s_bootstrap::router::{self, AuthenticatedRouter, DbInfo, RouterState};
use k2s_bootstrap::{Cli, Command, DataDirArgs, ServerArgs, fs_util, server, token};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(&args).await,
        Command::Token(args) => print_token(&args).await,
        Command::CheckToken(args) => check_token(&args.location, &args.token).await,
    }
}

fn load_settings(args: &ServerArgs) -> Result<ControlSettings> {
    let mut settings =
        ControlSettings::new(args.config.clone()).context("Failed to load settings")?;
    settings.merge_with_args(args);
    settings.validate()?;
    Ok(settings)
}

async fn run_server(args: &ServerArgs) -> Result<()> {
    let settings = load_settings(args)?;
    info!("Preparing control plane in {}", settings.data_dir.display());
    let runtime = control::prepare(&settings).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let api_client = proxy::api_client(&runtime.paths.server_ca.cert).await?;
    tokio::spawn({
        let client = api_client.clone();
        let url = settings.api_server.url.clone();
        let interval = settings.poll_interval()?;
        let shutdown = shutdown_rx.clone();
        async move {
            if !proxy::wait_for_api_server(&client, &url, interval, shutdown).await {
                warn!("Stopped waiting for API server");
            }
        }
    });

    let state = Arc::new(router_state(&settings, &runtime).await?);
    let router = AuthenticatedRouter::new(
        state,
        settings.bootstrap.http,
        router::tunnel_unavailable,
        ApiProxy::new(&settings.api_server.url, api_client),
    );

    let ip: IpAddr = settings
        .bind_address
        .parse()
        .with_context(|| format!("Failed to parse bind_address {}", settings.bind_address))?;
    let addr = SocketAddr::new(ip, settings.https_port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let tls = server::tls_config(&runtime.paths).await?;
    let mut serve = tokio::spawn(server::serve(listener, tls, Arc::new(router), shutdown_rx));

    tokio::select! {
        result = &mut serve => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("Listener failed: {err}"),
                Err(err) => error!("Listener task failed: {err}"),
            }
            return Ok(());
        }
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            warn!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    match serve.await {
        Ok(result) => result.context("Listener failed"),
        Err(err) => Err(anyhow::anyhow!("Listener task failed: {err}")),
    }
}

async fn router_state(settings: &ControlSettings, runtime: &ControlRuntime) -> Result<RouterState> {
    let users = Passwd::read(&runtime.paths.passwd_file).await?;
    Ok(RouterState {
        ca_certs: runtime.authorities.server.cert_pem().to_string(),
        users,
        node_passwords: NodePasswords::new(runtime.paths.node_passwd_file.clone()),
        public_config: settings.public_config(),
        db_info: DbInfo {
            backend: settings.storage.backend.clone(),
            endpoints: settings
                .storage
                .endpoints
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(ToString::to_string)
                .collect(),
        },
        paths: runtime.paths.clone(),
    })
}

fn data_dir_paths(args: &DataDirArgs) -> Result<ControlPaths> {
    let settings = load_settings(&ServerArgs::from(args))?;
    Ok(ControlPaths::new(&settings.data_dir))
}

async fn print_token(args: &DataDirArgs) -> Result<()> {
    let paths = data_dir_paths(args)?;
    let node_token = fs_util::read(&paths.node_token)
        .await
        .context("Failed to read node token; has the server been started?")?;
    println!("{}", String::from_utf8_lossy(&node_token).trim_end());
    Ok(())
}

async fn check_token(args: &DataDirArgs, join_token: &str) -> Result<()> {
    let paths = data_dir_paths(args)?;
    let ca = fs_util::read(&paths.server_ca.cert).await?;
    let secret = token::validate(join_token, &ca)?;
    let user = secret.split_once(':').map_or("", |(user, _)| user);
    if user.is_empty() {
        println!("Token matches server CA {}", token::fingerprint(&ca));
    } else {
        println!(
            "Token for user '{user}' matches server CA {}",
            token::fingerprint(&ca)
        );
    }
    Ok(())
}
