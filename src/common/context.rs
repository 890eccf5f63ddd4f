//! Request-scoped context
//!
//! Feature flags and client metadata travel with each request as an
//! immutable string-keyed map. Forking a context is a cheap clone; a
//! child never mutates the parent's view. Cancellation is a broadcast
//! watch channel shared by every fork.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Typed value carried on a request context
#[derive(Debug, Clone, PartialEq)]
pub enum ContextValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

/// Handle used to cancel every fork of a request context.
pub struct CancellationSource {
    tx: watch::Sender<bool>,
}

impl CancellationSource {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Immutable request-scoped context.
#[derive(Clone)]
pub struct RequestContext {
    values: Arc<HashMap<String, ContextValue>>,
    cancelled: watch::Receiver<bool>,
}

impl RequestContext {
    /// A fresh cancellable context.
    pub fn new() -> (CancellationSource, Self) {
        let (tx, rx) = watch::channel(false);
        (
            CancellationSource { tx },
            Self {
                values: Arc::new(HashMap::new()),
                cancelled: rx,
            },
        )
    }

    /// A context that can never be cancelled, for background work.
    pub fn background() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the life of the receiver so the
        // channel never reports closed-as-cancelled.
        std::mem::forget(tx);
        Self {
            values: Arc::new(HashMap::new()),
            cancelled: rx,
        }
    }

    /// Fork with one additional value. The receiver side of the
    /// cancellation channel is shared with the parent.
    pub fn with_value(&self, key: impl Into<String>, value: ContextValue) -> Self {
        let mut values = (*self.values).clone();
        values.insert(key.into(), value);
        Self {
            values: Arc::new(values),
            cancelled: self.cancelled.clone(),
        }
    }

    pub fn value(&self, key: &str) -> Option<&ContextValue> {
        self.values.get(key)
    }

    /// Is the named feature flag enabled? Missing flags are off.
    pub fn flag_enabled(&self, name: &str) -> bool {
        matches!(
            self.values.get(name),
            Some(ContextValue::Bool(true)) | Some(ContextValue::Str(_))
        ) && self.values.get(name) != Some(&ContextValue::Str("false".to_string()))
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves when the context is cancelled; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without cancelling; treat as never-cancelled.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("values", &self.values)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
