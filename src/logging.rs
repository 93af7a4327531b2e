//! Structured logging setup and secret masking (spec §2 ambient stack).
//!
//! Mirrors the teacher's `tracing_subscriber::registry()...with(fmt::layer())`
//! stack in `main.rs::init_tracing`, adding a rolling-file layer at
//! `app_log_path` per spec §6 ("append-only structured records ... via a
//! `tracing_appender`-style rolling file layer"). The format switches on
//! `environment` the way `utils/security.py`'s `mask_secret` and the
//! orchestrator's env-driven setup do in the source.

use std::path::Path;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Environment;

/// Keeps the non-blocking file writer alive for the process lifetime; drop
/// it only at shutdown.
pub struct LoggingGuard(#[allow(dead_code)] tracing_appender::non_blocking::WorkerGuard);

/// Initialize the global `tracing` subscriber with both a stdout layer and
/// a daily-rolling file layer at `app_log_path`. `prod`/`staging` emit
/// single-line JSON suitable for log shipping; `local` emits compact,
/// human-readable lines.
pub fn init_logging(environment: Environment, log_level: &str, app_log_path: &Path) -> LoggingGuard {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let dir = app_log_path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let file_name = app_log_path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| "app.log".to_string());
    let file_appender = tracing_appender::rolling::daily(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false).json();

    let stdout_layer: Box<dyn tracing_subscriber::Layer<tracing_subscriber::Registry> + Send + Sync> =
        match environment {
            Environment::Local => Box::new(fmt::layer().with_target(false)),
            Environment::Staging | Environment::Prod => {
                Box::new(fmt::layer().json().with_current_span(false))
            }
        };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init();

    LoggingGuard(guard)
}

/// Mask a secret for logging: keep the first and last two characters,
/// replace the middle with `***`. Short secrets are fully masked.
pub fn mask_secret(secret: &str) -> String {
    let len = secret.chars().count();
    if len <= 4 {
        return "*".repeat(len);
    }
    let chars: Vec<char> = secret.chars().collect();
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[len - 2..].iter().collect();
    format!("{head}***{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_short_secret_fully() {
        assert_eq!(mask_secret("ab"), "**");
    }

    #[test]
    fn masks_long_secret_keeping_ends() {
        assert_eq!(mask_secret("0xabcdef1234567890"), "0x***90");
    }
}
