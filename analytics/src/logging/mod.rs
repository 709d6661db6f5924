//! Tracing bring-up for the collector and query-engine processes.
//!
//! The default level is INFO; `RUST_LOG` narrows or widens per target, e.g.
//! `analytics::collector::syslog=debug` while chasing a framing problem.

use thiserror::Error;
use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("logging already initialized: `{0}`")]
    AlreadyInitialized(String),
}

pub struct Logging;

impl Logging {
    /// Installs the process-global subscriber. Errors only when another
    /// subscriber won the race, i.e. two components both tried to own
    /// bring-up.
    pub fn try_init() -> Result<(), LoggingError> {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy();
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .map_err(|err| LoggingError::AlreadyInitialized(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_reports_the_conflict() {
        // only the first global subscriber wins
        let _ = Logging::try_init();
        assert!(matches!(
            Logging::try_init(),
            Err(LoggingError::AlreadyInitialized(_))
        ));
    }
}
