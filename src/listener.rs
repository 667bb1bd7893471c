//! Notification listener: holds one long-lived database session
//! subscribed to the queue's notification channel and emits wake-ups to
//! the consumption loop.
//!
//! Notifications are best-effort wake-ups, not durable messages. Missed
//! notifications never cause data loss because the consumption loop
//! treats every wake-up as an opportunity to drain, not as a delivery;
//! the sweepers catch anything a notification misses.

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::events::{Event, EventBus};

/// Owns one dedicated database session (outside the pool's normal
/// checkout/return lifecycle) for the duration the loop is running.
pub struct NotificationListener {
    listener: PgListener,
    channel: String,
    pool_is_owned: bool,
}

impl NotificationListener {
    /// Acquire one session from `pool` and subscribe to `channel`.
    /// `pool_is_owned` records whether this component created the pool
    /// itself (and must therefore close it at stop) or received it from
    /// the caller (in which case stop must leave it open).
    pub async fn connect(pool: &PgPool, channel: &str, pool_is_owned: bool) -> Result<Self> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(channel).await?;
        Ok(Self {
            listener,
            channel: channel.to_string(),
            pool_is_owned,
        })
    }

    pub fn pool_is_owned(&self) -> bool {
        self.pool_is_owned
    }

    /// Run the receive loop until `shutdown` fires, sending a coalescing
    /// wake-up on `wake_tx` for every notification received (and emitting
    /// an `Event::Notification` for observers). A full `wake_tx` (capacity
    /// 1) just means a wake-up is already pending — dropping a duplicate
    /// wake-up is correct, not lossy, since the loop drains until empty.
    pub async fn run(
        mut self,
        wake_tx: mpsc::Sender<()>,
        events: EventBus,
        mut shutdown: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    self.stop().await;
                    return;
                }
                notification = self.listener.recv() => {
                    match notification {
                        Ok(notification) => {
                            let payload = notification.payload().to_string();
                            tracing::debug!(channel = %self.channel, payload = %payload, "notification received");
                            events.emit(Event::Notification { payload });
                            let _ = wake_tx.try_send(());
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "notification listener recv failed, retrying");
                        }
                    }
                }
            }
        }
    }

    /// Unsubscribe and release the session. Failures during unsubscribe
    /// are non-fatal, but the session is released on every exit path.
    async fn stop(mut self) {
        let channel = self.channel.clone();
        if let Err(err) = self.listener.unlisten(&channel).await {
            tracing::warn!(error = %err, channel = %channel, "failed to unlisten, releasing session anyway");
        }
        // `self.listener` is dropped here regardless, releasing the session.
    }
}
