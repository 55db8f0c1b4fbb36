//! User-facing notices emitted by the flow.
//!
//! A host UI subscribes and turns these into snackbars and re-renders.

use link_protocol::Stage;
use tokio::sync::broadcast;

const NOTICE_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    StageChanged(Stage),
    TwoFactorEnabled,
    LinkGenerated,
    TwoFactorConfirmed,
    CodeMismatch,
    Linked,
    Unlinked,
    Aborted,
    SessionExpired,
    TestMessageSent,
    TestMessageFailed,
}

impl Notice {
    pub fn message(&self) -> String {
        match self {
            Self::StageChanged(stage) => format!("Stage {stage} ({})", stage.label()),
            Self::TwoFactorEnabled => "Two-factor authentication enabled".to_string(),
            Self::LinkGenerated => "Unique QR code and link generated successfully".to_string(),
            Self::TwoFactorConfirmed => "2FA authenticated via Telegram Bot".to_string(),
            Self::CodeMismatch => "The code you entered is incorrect".to_string(),
            Self::Linked => "Telegram Bot successfully linked to your account".to_string(),
            Self::Unlinked => "Telegram Bot successfully unlinked from your account".to_string(),
            Self::Aborted => "You've canceled the linking process".to_string(),
            Self::SessionExpired => "Session expired".to_string(),
            Self::TestMessageSent => "Test message sent to linked account!".to_string(),
            Self::TestMessageFailed => "Failed to send test message".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notice>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    /// Notices are advisory; having no listener is fine.
    pub fn emit(&self, notice: Notice) {
        let _ = self.tx.send(notice);
    }
}
