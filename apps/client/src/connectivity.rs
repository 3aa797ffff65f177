use std::sync::Arc;

use tokio::sync::watch;

/// Shared online/offline flag. The realtime socket drives it; the message
/// outbox waits on it.
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            tracing::info!(component = "connectivity", online, "connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolves once the flag reads `true`.
    pub async fn wait_online(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|online| *online).await;
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_online_resolves_after_flip() {
        let connectivity = Connectivity::new(false);
        let waiter = {
            let connectivity = connectivity.clone();
            tokio::spawn(async move { connectivity.wait_online().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        connectivity.set_online(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("resolved")
            .expect("join");
        assert!(connectivity.is_online());
    }
}
