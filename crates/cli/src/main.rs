mod app;
mod error;
mod repl;
mod settings;

use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use app::{TerminalObserver, open_session};
use settings::SettingsStore;

const DEFAULT_LOG_FILTER: &str = "parley=info,parley_chat=info,parley_llm=info,parley_storage=info";

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let settings = Arc::new(SettingsStore::load());
    let session = match open_session(settings, Arc::new(TerminalObserver::stdout())).await {
        Ok(session) => session,
        Err(error) => {
            tracing::error!(error = %error, "failed to start chat session");
            eprintln!("error: {error}");
            return ExitCode::FAILURE;
        }
    };

    match repl::run(session).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "chat session ended with an error");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

// Logs go to stderr so replies on stdout stay clean.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
