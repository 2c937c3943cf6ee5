use std::net::SocketAddr;

use tokio::sync::mpsc;

/// Terminal lifecycle signals. `Ready` fires once after the listener is
/// bound; `Error` fires once if startup fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    Ready { addr: SocketAddr },
    Error { message: String },
}

#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    tx: mpsc::UnboundedSender<ProxyEvent>,
}

impl EventSender {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<ProxyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn emit(&self, event: ProxyEvent) {
        // Nobody listening is fine; events are advisory.
        let _ = self.tx.send(event);
    }
}
