//! `Polychat` — multi-channel chat over a publish/subscribe broker.
//!
//! ```bash
//! # Defaults: localhost 9092, random nickname
//! cargo run --bin polychat
//!
//! # Explicit broker and nickname
//! cargo run --bin polychat -- broker.local 9092 alice
//!
//! # Replay retained history when joining
//! POLYCHAT_OFFSET_POLICY=earliest cargo run --bin polychat
//! ```

use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use polychat::broker::ws::WsBroker;
use polychat::command::{self, Command};
use polychat::config::{CliArgs, ClientConfig};
use polychat::fetch::FetchLoop;
use polychat::session::{Reply, Session};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // Logs go to a file; stdout belongs to the prompt.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let config = ClientConfig::resolve(&cli);
    tracing::info!(host = %config.host, port = config.port, "polychat starting");

    let broker = WsBroker::new(&config.host, config.port);
    let session = match Session::connect(broker, config.session_params()).await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "connect failed");
            println!("[ERROR] {e}");
            return ExitCode::FAILURE;
        }
    };

    let fetcher = FetchLoop::new(session.shared(), config.fetch_config()).spawn();
    println!("Listener started.");
    println!("Connected as {}", session.nickname().await);

    let result = run_prompt(&session).await;
    fetcher.abort();

    tracing::info!("polychat exiting");
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            println!("[ERROR] {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown so buffered
/// log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("polychat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Reads commands until `/exit` or end of input.
async fn run_prompt(session: &Session<WsBroker>) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("[{}] > ", session.nickname().await);
        io::stdout().flush()?;

        let command = match lines.next_line().await? {
            // End of input behaves like /exit.
            None => Command::Exit,
            Some(line) => match command::parse(&line) {
                Ok(command) => command,
                Err(command::ParseError::EmptyInput) => continue,
                Err(e) => {
                    println!("[ERROR] {e}");
                    continue;
                }
            },
        };

        let exiting = command == Command::Exit;
        if exiting {
            print!("Closing connections...");
            io::stdout().flush()?;
        }

        match session.execute(command).await {
            Ok(reply) => render(session, reply).await,
            Err(e) => {
                tracing::debug!(error = %e, "command failed");
                println!("[ERROR] {e}");
                show_pending(session).await;
            }
        }

        if exiting {
            return Ok(());
        }
    }
}

async fn render(session: &Session<WsBroker>, reply: Reply) {
    match reply {
        Reply::Renamed { nickname } => {
            tracing::debug!(%nickname, "renamed");
            show_pending(session).await;
        }
        Reply::Joined { channel } => {
            println!("Joined channel {channel}.");
            show_pending(session).await;
        }
        Reply::Left {
            channel,
            close_error,
        } => {
            if let Some(e) = close_error {
                println!("[ERROR] closing {channel}: {e}");
            }
            println!("Left channel {channel}.");
            show_pending(session).await;
        }
        Reply::Messages(messages) => {
            if messages.is_empty() {
                println!("No new messages.");
            }
            for message in messages {
                println!("{message}");
            }
        }
        Reply::Sent { .. } => show_pending(session).await,
        Reply::Closed { failures } => {
            for (resource, e) in failures {
                println!("[ERROR] closing {resource}: {e}");
            }
            println!("Done. Bye!");
        }
    }
}

async fn show_pending(session: &Session<WsBroker>) {
    for message in session.take_messages().await {
        println!("{message}");
    }
}
