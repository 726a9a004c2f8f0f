//! Log output
//!
//! Embedding applications usually own the terminal, so logs go to a file
//! and only when `EDUCHECK_LOG` is set (e.g. `EDUCHECK_LOG=debug`).

use std::fs::OpenOptions;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Environment variable holding the log level
pub const LOG_ENV: &str = "EDUCHECK_LOG";

/// Initialize file logging from `EDUCHECK_LOG`
///
/// Logs to `config.log_file`, or `{data_dir}/educheck.log`. Returns
/// whether a subscriber was installed.
pub fn init(config: &Config) -> bool {
    let Ok(log_level) = std::env::var(LOG_ENV) else {
        return false;
    };

    let log_path = config.log_path();
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
            return false;
        }
    };

    let env_filter = EnvFilter::new(format!("educheck_core={}", log_level));

    // Ignore the error if the host already installed a subscriber
    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(log_file)
        .try_init()
        .is_ok();

    if installed {
        info!("Logging initialized to {:?}", log_path);
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_without_env_is_noop() {
        std::env::remove_var(LOG_ENV);
        let temp_dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(temp_dir.path());

        assert!(!init(&config));
        assert!(!config.log_path().exists());
    }
}
