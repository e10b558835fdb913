use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;

use crate::core::traits::notifier::{Notification, Notifier};

/// Forwards notifications to a stream consumed by the transport layer.
///
/// Never waits on the consumer: when the stream is full the notification is
/// dropped and logged, so a stalled transport cannot hold up the lifecycle.
#[derive(Clone, Debug)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, ReceiverStream<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, ReceiverStream::new(rx))
    }
}

#[async_trait::async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, notification: Notification) {
        tracing::debug!(key = %notification.key(), "notify: {:?}", notification);
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(notification)) => tracing::warn!(
                key = %notification.key(),
                "notification stream full, dropping {:?}",
                notification
            ),
            Err(TrySendError::Closed(_)) => tracing::warn!("notification receiver dropped"),
        }
    }
}
