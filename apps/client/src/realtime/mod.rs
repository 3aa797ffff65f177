//! Change-feed subscriptions.
//!
//! A [`Subscription`] is a cancellable stream of row changes. Dropping it
//! tears the channel down, which is the only cancellation the sync loops use.

pub mod socket;

use serde::de::DeserializeOwned;
use shared_proto::realtime::{ChangeEvent, ChangeFilter, RowChange};
use tokio::sync::mpsc;

/// Anything that can open a filtered change stream.
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self, filter: ChangeFilter) -> Subscription;
}

pub struct Subscription {
    rx: mpsc::UnboundedReceiver<RowChange>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        rx: mpsc::UnboundedReceiver<RowChange>,
        on_drop: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self { rx, on_drop }
    }

    /// A subscription fed by hand through the returned sender.
    pub fn detached() -> (mpsc::UnboundedSender<RowChange>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx, None))
    }

    /// Funnels several subscriptions into one. Dropping the result drops
    /// every input.
    pub fn merge(inputs: Vec<Subscription>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarders = inputs
            .into_iter()
            .map(|mut input| {
                let tx = tx.clone();
                tokio::spawn(async move {
                    while let Some(change) = input.recv().await {
                        if tx.send(change).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        Self::new(
            rx,
            Some(Box::new(move || {
                for forwarder in forwarders {
                    forwarder.abort();
                }
            })),
        )
    }

    pub async fn recv(&mut self) -> Option<RowChange> {
        self.rx.recv().await
    }

    /// Next change decoded as `T`. Undecodable rows are logged and skipped.
    pub async fn next_event<T: DeserializeOwned>(&mut self) -> Option<ChangeEvent<T>> {
        loop {
            let change = self.rx.recv().await?;
            match change.decode::<T>() {
                Ok(event) => return Some(event),
                Err(err) => {
                    tracing::warn!(
                        component = "realtime",
                        table = %change.table,
                        error = %err,
                        "skipping undecodable change"
                    );
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}
