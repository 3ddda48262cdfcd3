// Presentation hooks
// The pipeline never renders UI itself; it reports through these traits

/// Sends the user back to the login surface
pub trait Navigator: Send + Sync {
    fn redirect_to_login(&self);
}

/// Shows a short, non-blocking message to the user
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Navigator that only records the redirect in the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn redirect_to_login(&self) {
        tracing::warn!("Session ended, login required");
    }
}

/// Notifier that writes messages to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        tracing::warn!(message = message, "User notification");
    }
}
