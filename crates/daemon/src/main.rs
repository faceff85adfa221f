use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tg_relay_core::config::{self, Settings};
use tg_relay_core::log::init_logging;
use tg_relay_core::{
    AccessToken, SessionSlot, TelegramMtProtoSession, UpstreamSession, connect_with_backoff,
};
use tgrelayd::{AppState, router};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "tgrelayd", version, about = "HTTP relay for Telegram channel media")]
struct Args {
    /// TOML settings file.
    #[arg(long, env = "TGRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file and PORT / TGRELAY_LISTEN.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let settings = match load(&args) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("tgrelayd: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(settings.log.format);

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(event = "daemon.failed", error = %e, "daemon.failed");
            ExitCode::FAILURE
        }
    }
}

fn load(args: &Args) -> tg_relay_core::Result<Settings> {
    let mut settings = config::load_settings(args.config.as_deref())?;
    if let Some(listen) = &args.listen {
        settings.server.listen = listen.clone();
    }
    config::validate_settings(&settings)?;
    Ok(settings)
}

async fn run(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let addr = settings.listen_addr()?;

    let session = match settings.mtproto_config() {
        Ok(mtproto) => {
            let slot = Arc::new(SessionSlot::connecting());
            tokio::spawn(connect_with_backoff(Arc::clone(&slot), move || {
                let mtproto = mtproto.clone();
                async move {
                    let session = TelegramMtProtoSession::connect(mtproto).await?;
                    Ok(Arc::new(session) as Arc<dyn UpstreamSession>)
                }
            }));
            slot
        }
        Err(reason) => {
            warn!(event = "upstream.unconfigured", reason = %reason, "upstream.unconfigured");
            Arc::new(SessionSlot::unavailable(reason))
        }
    };

    let state = AppState::new(
        session,
        AccessToken::new(&settings.server.auth_token),
        settings.relay_options(),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        event = "http.listen",
        addr = %addr,
        chunk_bytes = settings.relay.chunk_bytes,
        "http.listen"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(event = "http.shutdown", "http.shutdown");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(event = "signal.install_failed", signal = "ctrl_c", error = %e, "signal.install_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(event = "signal.install_failed", signal = "sigterm", error = %e, "signal.install_failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!(event = "signal.shutdown", "signal.shutdown");
}
