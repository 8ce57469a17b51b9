//! Diagnostic sink for callback failures and component log lines.

use tracing::info;

/// Receives messages that the runtime reports on behalf of components and
/// features, such as recoverable stage failures.
pub trait Listener {
    /// Handle one message.
    fn on_message(&self, message: &str);
}

/// Forwards listener messages to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl Listener for TracingListener {
    fn on_message(&self, message: &str) {
        info!(target: "engine::listener", "{message}");
    }
}
