//! User-facing notices: transient toasts and native notifications.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, OnceCell};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToastVariant {
    Default,
    Destructive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toast {
    pub variant: ToastVariant,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Toast {
    pub fn info(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            variant: ToastVariant::Default,
            title: title.into(),
            description: Some(description.into()),
        }
    }

    pub fn destructive(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            variant: ToastVariant::Destructive,
            title: title.into(),
            description: Some(description.into()),
        }
    }
}

/// Fan-out of toasts to whoever renders them.
#[derive(Clone)]
pub struct Toaster {
    tx: broadcast::Sender<Toast>,
}

impl Toaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn show(&self, toast: Toast) {
        // No renderer attached is fine; the toast is simply dropped.
        let _ = self.tx.send(toast);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Toast> {
        self.tx.subscribe()
    }
}

impl Default for Toaster {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Logs a failed operation and surfaces it as a destructive toast.
pub fn report(toaster: &Toaster, component: &'static str, title: &str, err: &AppError) {
    tracing::error!(
        component,
        code = ?err.code,
        details = ?err.details,
        trace_id = ?err.trace_id,
        error = %err,
        "{}",
        title
    );
    toaster.show(Toast::destructive(title, err.message.clone()));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Default,
    Granted,
    Denied,
}

/// Platform notification surface.
#[async_trait]
pub trait NativeNotifications: Send + Sync {
    async fn request_permission(&self) -> Permission;

    /// `target` is the route to focus when the notification is clicked.
    fn show(&self, title: &str, body: &str, target: &str) -> AppResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Native,
    Toast,
}

/// Raises alerts natively when allowed and as a toast otherwise.
pub struct Notifier {
    native: Option<Arc<dyn NativeNotifications>>,
    permission: OnceCell<Permission>,
    toaster: Toaster,
}

impl Notifier {
    pub fn new(native: Option<Arc<dyn NativeNotifications>>, toaster: Toaster) -> Self {
        Self {
            native,
            permission: OnceCell::new(),
            toaster,
        }
    }

    pub fn toast_only(toaster: Toaster) -> Self {
        Self::new(None, toaster)
    }

    /// Asks the platform at most once per notifier.
    pub async fn permission(&self) -> Permission {
        let Some(native) = &self.native else {
            return Permission::Denied;
        };
        *self
            .permission
            .get_or_init(|| async {
                let granted = native.request_permission().await;
                tracing::info!(component = "notify", permission = ?granted, "notification permission resolved");
                granted
            })
            .await
    }

    pub async fn raise(&self, title: &str, body: &str, target: &str) -> Delivery {
        if self.permission().await == Permission::Granted {
            if let Some(native) = &self.native {
                match native.show(title, body, target) {
                    Ok(()) => return Delivery::Native,
                    Err(err) => {
                        tracing::warn!(component = "notify", error = %err, "native notification failed");
                    }
                }
            }
        }
        self.toaster.show(Toast::info(title, body));
        Delivery::Toast
    }
}
