//! Arcade Server
//!
//! Loads settings (path as the first argument), opens the event log and
//! runs the game server under the fault supervisor on a current-thread
//! runtime. Operator commands are read from stdin.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use arcade::{
    install_panic_hook, supervise, GameServer, GameServerError, LogSink, Logger, Settings,
    SinkLayer, VERSION,
};

const DEFAULT_FILTER: &str = "debug,tungstenite=info,tokio_tungstenite=info";

fn main() -> anyhow::Result<()> {
    let settings = match std::env::args().nth(1) {
        Some(path) => Settings::load(&path).with_context(|| format!("loading settings from {path}"))?,
        None => Settings::default(),
    };
    let settings = Arc::new(settings);

    let sink = LogSink::open(&settings.log_settings()).context("opening the event log")?;
    let sink = Arc::new(sink);

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(SinkLayer::new(sink.clone()))
        .try_init()
        .context("installing the tracing subscriber")?;
    install_panic_hook();

    info!("Arcade Server v{}", VERSION);
    if let Some(path) = sink.path() {
        info!("Logging to {}", path.display());
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the runtime")?;

    let logger = Logger::new(sink.clone());
    let code = runtime.block_on(async move {
        let (console_tx, console_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_console(console_tx));

        supervise(sink, serve(settings, logger, console_rx)).await
    });

    // Stdin is read on a blocking thread that would hold up runtime drop.
    std::process::exit(code);
}

async fn serve(
    settings: Arc<Settings>,
    logger: Logger,
    console: mpsc::UnboundedReceiver<String>,
) -> Result<(), GameServerError> {
    let mut server = GameServer::new(settings, logger)?;
    server.run(console).await
}

async fn read_console(console: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if console.send(line).is_err() {
            break;
        }
    }
}
