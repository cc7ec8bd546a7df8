//! Scoped logger handed to extensions via `ServiceContainer::scoped`
//! (§4.A). Wraps a `tracing::Span` bound to the extension's name so every
//! line an extension emits is attributable without the extension having
//! to pass its own name on every call, the same way the teacher tags its
//! extension-loader spans in `extensions/loader.rs`.

use tracing::Span;

#[derive(Clone)]
pub struct ScopedLogger {
    span: Span,
}

impl ScopedLogger {
    pub fn new(extension: &str) -> Self {
        Self {
            span: tracing::info_span!("extension", name = %extension),
        }
    }

    pub fn debug(&self, message: &str) {
        let _enter = self.span.enter();
        tracing::debug!("{message}");
    }

    pub fn info(&self, message: &str) {
        let _enter = self.span.enter();
        tracing::info!("{message}");
    }

    pub fn warn(&self, message: &str) {
        let _enter = self.span.enter();
        tracing::warn!("{message}");
    }

    pub fn error(&self, message: &str) {
        let _enter = self.span.enter();
        tracing::error!("{message}");
    }

    /// Logged at error level and additionally marks the transition record
    /// (§3.2) that reads this extension as failed; the registry is the one
    /// that actually performs the state flip, this just guarantees the log
    /// line exists before it does.
    pub fn fatal(&self, message: &str) {
        let _enter = self.span.enter();
        tracing::error!(fatal = true, "{message}");
    }
}
