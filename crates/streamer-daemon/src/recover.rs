use std::any::Any;

use tokio::sync::mpsc;
use tracing::error;

/// Process-wide channel for errors that end the current generation.
pub type FatalSender = mpsc::UnboundedSender<anyhow::Error>;
pub type FatalReceiver = mpsc::UnboundedReceiver<anyhow::Error>;

pub fn fatal_channel() -> (FatalSender, FatalReceiver) {
    mpsc::unbounded_channel()
}

/// Renders a panic payload the way `std` prints it.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Logs a caught panic and forwards it to the fatal channel. Returns the
/// rendered message.
pub fn forward_panic(fatal: &FatalSender, origin: &str, payload: &(dyn Any + Send)) -> String {
    let message = panic_message(payload);
    error!("panic in {} handler: {}", origin, message);
    if fatal
        .send(anyhow::anyhow!("panic in {} handler: {}", origin, message))
        .is_err()
    {
        error!("fatal channel closed, panic from {} dropped", origin);
    }
    message
}
