use std::path::PathBuf;
use std::time::Duration;

const TIMEOUT_ENV: &str = "WEBSHELL_CONNECTION_TIMEOUT";
const PTY_CWD_ENV: &str = "WEBSHELL_PTY_CWD";

/// Process-wide settings, read from the environment once at startup.
///
/// Connections capture an `Arc<Settings>` when they are accepted; changing
/// the environment afterwards has no effect on a running server.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Idle timeout for a session: the connection is closed once no
    /// active-registered service has seen traffic for this long.
    pub idle_timeout: Duration,
    /// Default working directory for new local PTYs.
    pub pty_cwd: PathBuf,
    /// Root directory reported by the local filesystem service's `get_root`.
    pub fs_root: PathBuf,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60 * timeout_minutes()),
            pty_cwd: pty_cwd(),
            fs_root: home_dir().unwrap_or_else(|| PathBuf::from("/")),
        }
    }
}

fn timeout_minutes() -> u64 {
    match std::env::var(TIMEOUT_ENV) {
        Err(_) => {
            tracing::info!("${} not set, default to 1 minute", TIMEOUT_ENV);
            1
        }
        Ok(raw) => match raw.parse::<u64>() {
            Ok(minutes) if minutes > 0 => minutes,
            _ => {
                tracing::warn!(
                    "${} ({}) is not a valid integer, default to 1 minute",
                    TIMEOUT_ENV,
                    raw
                );
                1
            }
        },
    }
}

fn pty_cwd() -> PathBuf {
    match std::env::var(PTY_CWD_ENV) {
        Err(_) => {
            tracing::info!("${} not set, using home directory", PTY_CWD_ENV);
        }
        Ok(cwd) => {
            let path = PathBuf::from(&cwd);
            if path.is_dir() {
                return path;
            }
            tracing::warn!(
                "${} ({}) is not a valid path, using home directory",
                PTY_CWD_ENV,
                cwd
            );
        }
    }

    match home_dir() {
        Some(home) => home,
        None => {
            tracing::warn!("failed to resolve home directory, using cwd as fallback");
            PathBuf::from(".")
        }
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
