use parley_llm::ProviderError;
use snafu::Snafu;

use super::settings::SettingsError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("could not create the token source on `{stage}`: {source}"))]
    TokenSource {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("settings update failed on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("terminal I/O failed on `{stage}`: {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type CliResult<T> = Result<T, CliError>;
