//! Terminal rendition of the persistent status surface

use tracing::info;

use ringlink_core::{StatusAction, StatusNotification, StatusSurface};

/// One-line rendering of a notification
pub fn format_notification(notification: &StatusNotification) -> String {
    let mut line = format!("[{}] {}", notification.title, notification.text);
    if notification.action == Some(StatusAction::Locate) {
        line.push_str("  (type `locate` to find your ring)");
    }
    line
}

/// Status surface that writes each rendering to the log
#[derive(Debug, Default)]
pub struct TerminalSurface {
    shown: Option<String>,
}

impl TerminalSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Line currently on display
    pub fn shown(&self) -> Option<&str> {
        self.shown.as_deref()
    }
}

impl StatusSurface for TerminalSurface {
    fn show(&mut self, notification: &StatusNotification) {
        let line = format_notification(notification);
        info!("{}", line);
        self.shown = Some(line);
    }

    fn clear(&mut self) {
        if self.shown.take().is_some() {
            info!("Status cleared");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(text: &str, action: Option<StatusAction>) -> StatusNotification {
        StatusNotification {
            title: "RingLink".into(),
            text: text.into(),
            ongoing: true,
            action,
        }
    }

    #[test]
    fn test_locate_hint_only_with_action() {
        let connected = notification("Q_Ring_01 connected · 80%", Some(StatusAction::Locate));
        assert_eq!(
            format_notification(&connected),
            "[RingLink] Q_Ring_01 connected · 80%  (type `locate` to find your ring)"
        );

        let reconnecting = notification("Reconnecting (attempt 2)", None);
        assert_eq!(
            format_notification(&reconnecting),
            "[RingLink] Reconnecting (attempt 2)"
        );
    }

    #[test]
    fn test_clear_forgets_line() {
        let mut surface = TerminalSurface::new();
        surface.show(&notification("Ring disconnected", None));
        assert_eq!(surface.shown(), Some("[RingLink] Ring disconnected"));
        surface.clear();
        assert_eq!(surface.shown(), None);
    }
}
