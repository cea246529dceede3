//! Process-global engine log bridge.
//!
//! Native engines typically expose one process-wide log sink. This module
//! wraps that as a single registration point with explicit
//! [`install`] / [`uninstall`], routing engine log lines into the Rust
//! `tracing` subsystem. Installation affects **all** sessions in the
//! process; it is deliberately not per-session state.

use std::sync::atomic::{AtomicBool, Ordering};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Severity of an engine log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Start forwarding engine log lines to `tracing`. Idempotent.
pub fn install() {
    INSTALLED.store(true, Ordering::SeqCst);
    tracing::debug!("engine log hook installed");
}

/// Stop forwarding engine log lines. Idempotent.
pub fn uninstall() {
    INSTALLED.store(false, Ordering::SeqCst);
    tracing::debug!("engine log hook uninstalled");
}

pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::SeqCst)
}

/// Called by engine implementations for every log line they produce.
/// Lines are dropped unless the hook is installed.
pub fn emit(level: LogLevel, message: &str) {
    if !is_installed() {
        return;
    }
    let message = message.trim();
    if message.is_empty() {
        return;
    }
    match level {
        LogLevel::Error => tracing::error!(target: "engine", "{message}"),
        LogLevel::Warn => tracing::warn!(target: "engine", "{message}"),
        LogLevel::Info => tracing::info!(target: "engine", "{message}"),
        LogLevel::Debug => tracing::debug!(target: "engine", "{message}"),
    }
}
