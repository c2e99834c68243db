//! `promptrelay` command line.
//!
//! ```bash
//! # Run the relay (reads the key from $THESYS_API_KEY on every request)
//! promptrelay serve --config promptrelay.toml
//!
//! # Ask a running relay something, streaming the answer to stdout
//! promptrelay ask "What is a monad?"
//! promptrelay ask "Shorter, please" --previous "$(cat last_answer.txt)"
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use promptrelay::client::{CancelReason, ExchangeObserver, ExchangeOutcome, StreamingConsumer};
use promptrelay::config::{Config, LoggingConfig};
use promptrelay::context::Context;
use promptrelay::llm::{CompletionProvider, OpenAiCompatibleProvider};
use promptrelay::middleware::LoggerMiddleware;
use promptrelay::relay::{CredentialSource, EnvCredential, RelayHandler};
use promptrelay::{Response, Router, Server, StatusCode};

#[derive(Parser, Debug)]
#[command(name = "promptrelay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server.
    Serve {
        /// Override the listen address.
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Send one prompt to a relay and stream the answer to stdout.
    Ask {
        prompt: String,

        /// The previous answer, sent as conversational context.
        #[arg(short, long)]
        previous: Option<String>,

        /// Override the relay endpoint URL.
        #[arg(short, long)]
        endpoint: Option<String>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_ref())?;
    if args.debug {
        config.logging.level = "debug".to_string();
    }

    match args.command {
        Command::Serve { listen } => {
            if let Some(listen) = listen {
                config.server.listen_addr = listen;
            }
            init_logging(&config.logging)?;
            serve(config).await
        }
        Command::Ask {
            prompt,
            previous,
            endpoint,
        } => {
            if let Some(endpoint) = endpoint {
                config.client.endpoint = endpoint;
            }
            init_logging(&config.logging)?;
            ask(config, &prompt, previous.as_deref()).await
        }
    }
}

/// Logs go to stderr; stdout carries `ask` answers.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let provider = OpenAiCompatibleProvider::new(&config.upstream.base_url, config.upstream.connect_timeout())
        .context("building upstream client")?;
    let credentials = EnvCredential::new(&config.upstream.api_key_env);
    if credentials.api_key().is_none() {
        tracing::warn!(
            var = credentials.var(),
            "upstream API credential is not set; relay requests will fail until it is"
        );
    }

    tracing::info!(
        upstream = %config.upstream.base_url,
        provider = provider.name(),
        model = %config.upstream.model,
        route = %config.relay.route,
        "starting relay"
    );

    let relay = RelayHandler::new(Arc::new(provider), Arc::new(credentials))
        .with_model(&config.upstream.model)
        .with_rules(config.relay.rules());

    let mut router = Router::new();
    router.layer(LoggerMiddleware);
    router.get("/healthz", |_ctx: Context| async {
        Response::new(StatusCode::Ok).body("ok")
    });
    Arc::new(relay).mount(&mut router, &config.relay.route);
    let router = Arc::new(router);

    let server = Server::bind(&config.server.listen_addr)
        .await?
        .drain_timeout(config.server.shutdown_timeout());

    server
        .run_until(
            move |req| {
                let router = Arc::clone(&router);
                async move { router.route(req).await }
            },
            shutdown_signal(),
        )
        .await?;

    tracing::info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received Ctrl-C, initiating shutdown"),
        Err(e) => {
            tracing::error!(error = %e, "cannot listen for Ctrl-C; running until killed");
            std::future::pending::<()>().await;
        }
    }
}

/// Writes each new suffix of the accumulated answer to `out`.
///
/// The first failed write (a closed pipe, say) is logged and `on_broken` runs;
/// later updates are dropped.
struct Printer<W> {
    out: Mutex<W>,
    printed: AtomicUsize,
    broken: AtomicBool,
    on_broken: Box<dyn Fn() + Send + Sync>,
}

impl<W: Write> Printer<W> {
    fn new(out: W, on_broken: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            out: Mutex::new(out),
            printed: AtomicUsize::new(0),
            broken: AtomicBool::new(false),
            on_broken: Box::new(on_broken),
        }
    }

    fn write(&self, bytes: &[u8]) {
        if self.broken.load(Ordering::Relaxed) {
            return;
        }
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = out.write_all(bytes).and_then(|()| out.flush()) {
            if !self.broken.swap(true, Ordering::Relaxed) {
                tracing::debug!(error = %e, "output closed, dropping the rest of the answer");
                (self.on_broken)();
            }
        }
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Relaxed)
    }
}

impl<W: Write + Send> ExchangeObserver for Printer<W> {
    fn on_response_update(&self, text: &str) {
        let printed = self.printed.swap(text.len(), Ordering::Relaxed);
        if let Some(suffix) = text.get(printed..) {
            if !suffix.is_empty() {
                self.write(suffix.as_bytes());
            }
        }
    }

    fn on_loading_change(&self, loading: bool) {
        tracing::debug!(loading, "loading changed");
    }
}

async fn ask(config: Config, prompt: &str, previous: Option<&str>) -> anyhow::Result<()> {
    let consumer = StreamingConsumer::http(&config.client.endpoint, config.client.connect_timeout())?
        .with_stream_timeout(config.client.stream_timeout())
        .with_fatal_decode(config.client.fatal_decode);
    let consumer = Arc::new(consumer);

    let interrupt = tokio::spawn({
        let consumer = Arc::clone(&consumer);
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                consumer.cancel_active();
            }
        }
    });

    let printer = Printer::new(std::io::stdout(), {
        let consumer = Arc::clone(&consumer);
        move || {
            consumer.cancel_active();
        }
    });
    let outcome = consumer.run_exchange(prompt, previous, &printer).await;
    interrupt.abort();
    if printer.is_broken() {
        return Ok(());
    }
    printer.write(b"\n");

    match outcome {
        ExchangeOutcome::Completed(_) => Ok(()),
        ExchangeOutcome::Cancelled(CancelReason::Timeout) => {
            anyhow::bail!(
                "no complete answer within {}s",
                config.client.stream_timeout_secs
            )
        }
        ExchangeOutcome::Cancelled(reason) => {
            tracing::info!(?reason, "exchange cancelled");
            Ok(())
        }
        ExchangeOutcome::Failed(error) => Err(error.into()),
    }
}
