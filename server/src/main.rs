//! YUI bot process. Loads settings, wires the KOOK gateway, completion backend, session table
//! and idle monitor together, then serves the webhook until Ctrl-C or SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;

use yui_core::completion::{CompletionBackend, OpenAiBackend};
use yui_core::config;
use yui_core::im::kook::{KookGateway, KookWebhookState};
use yui_core::im::{
    run_dispatcher, run_history_expiry_listener, IdleMonitor, MessagingGateway, Orchestrator,
    ReplyPolicy, SessionTable,
};
use yui_core::logging::init_logging;
use yui_server::{build_router, AppState};

/// Inbound events waiting for the dispatcher. Webhook deliveries beyond this are dropped.
const INBOUND_QUEUE: usize = 256;
const EXPIRY_QUEUE: usize = 64;
/// Grace period after the listener stops, so in-flight replies can land.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "yui-bot", version, about = "KOOK chat bot relaying channel messages to a completion API")]
struct Args {
    /// Path to settings.json
    #[arg(short, long, env = "YUI_CONFIG", default_value = "settings.json")]
    config: PathBuf,

    /// Override server.port from the settings file
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut settings = config::load_settings_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    init_logging(&settings.log.level, &settings.log.format);

    let kook = KookGateway::new(&settings.kook).context("building KOOK client")?;
    let bot_id = kook
        .bot_user_id()
        .await
        .context("resolving bot user id (check kook.token)")?;
    tracing::info!(bot_id = %bot_id, channels = settings.channels.len(), "KOOK bot identified");
    let gateway: Arc<dyn MessagingGateway> = Arc::new(kook);

    let (expired_tx, expired_rx) = mpsc::channel(EXPIRY_QUEUE);
    let backend: Arc<dyn CompletionBackend> = Arc::new(
        OpenAiBackend::new(&settings.completion, Some(expired_tx))
            .context("building completion client")?,
    );
    let sessions = Arc::new(SessionTable::from_config(&settings.channels));
    let policy = ReplyPolicy {
        persona_resets_idle: settings.conversation.persona_resets_idle,
        show_token_usage: settings.conversation.show_token_usage,
    };
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&sessions),
        Arc::clone(&gateway),
        Arc::clone(&backend),
        bot_id.clone(),
        policy,
    ));

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    tokio::spawn(run_dispatcher(inbound_rx, orchestrator));
    tokio::spawn(
        IdleMonitor::new(Arc::clone(&sessions), Arc::clone(&gateway), Arc::clone(&backend)).run(),
    );
    tokio::spawn(run_history_expiry_listener(
        expired_rx,
        Arc::clone(&sessions),
        Arc::clone(&gateway),
    ));

    let app = build_router(AppState {
        sessions,
        kook: KookWebhookState {
            inbound_tx,
            bot_id,
            verify_token: settings.kook.verify_token.clone(),
        },
    });

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", settings.server.host, settings.server.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!(%addr, "webhook server listening on /api/im/kook/event");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("web server failed")?;

    tokio::time::sleep(SHUTDOWN_GRACE).await;
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl-C");
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
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
