use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Error a subscriber may return; it is logged and otherwise ignored
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by a subscriber
pub type CallbackResult = std::result::Result<(), CallbackError>;

/// Subscriber handler
///
/// Each registered handler gets its own delivery task. It sees values in
/// the order they were offered, one at a time, and never blocks other
/// handlers or the notifier. A handler that wants synchronous behavior
/// simply does its work and returns a ready future.
pub type Callback<T> = Arc<dyn Fn(T) -> BoxFuture<'static, CallbackResult> + Send + Sync>;

/// Wrap an async closure as a [`Callback`]
///
/// Keep the returned `Arc` to unregister the handler or to register it
/// elsewhere; registering the same `Arc` twice is a no-op.
pub fn callback<T, F, Fut>(f: F) -> Callback<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallbackResult> + Send + 'static,
{
    Arc::new(move |value| f(value).boxed())
}

/// Handle returned on registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

/// One registered handler and the queue feeding its delivery task
struct Handler<T> {
    id: SubscriptionId,
    callback: Callback<T>,
    queue: Mutex<Option<mpsc::UnboundedSender<T>>>,
}

impl<T: Send + 'static> Handler<T> {
    /// Queue `value`, starting the delivery task on first use
    fn offer(&self, value: T) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let value = match queue.as_ref() {
            Some(tx) => match tx.send(value) {
                Ok(()) => return,
                Err(mpsc::error::SendError(value)) => value,
            },
            None => value,
        };

        // no task yet, or its runtime has gone away
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime available, dropping notification");
            *queue = None;
            return;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(deliver(self.callback.clone(), rx));
        let _ = tx.send(value);
        *queue = Some(tx);
    }
}

/// Run `handler` on every queued value in order, logging its failures
async fn deliver<T: Send + 'static>(handler: Callback<T>, mut rx: mpsc::UnboundedReceiver<T>) {
    while let Some(value) = rx.recv().await {
        let call = handler.clone();
        match AssertUnwindSafe(async move { call(value).await }).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Subscriber returned an error: {}", e),
            Err(_) => tracing::error!("Subscriber panicked"),
        }
    }
}

/// Registered subscribers for one event source
pub struct Subscribers<T> {
    handlers: Mutex<Vec<Arc<Handler<T>>>>,
}

impl<T: Clone + Send + 'static> Subscribers<T> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler; an already registered handler keeps its id
    pub fn add(&self, callback: Callback<T>) -> SubscriptionId {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = handlers.iter().find(|h| Arc::ptr_eq(&h.callback, &callback)) {
            return existing.id;
        }
        let id = SubscriptionId(Uuid::new_v4());
        handlers.push(Arc::new(Handler {
            id,
            callback,
            queue: Mutex::new(None),
        }));
        id
    }

    /// Unregister a handler; values already queued for it are still delivered
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|h| h.id != id);
        handlers.len() != before
    }

    pub fn remove_callback(&self, callback: &Callback<T>) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|h| !Arc::ptr_eq(&h.callback, callback));
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offer `value` to every registered handler
    pub fn notify(&self, value: T) {
        for handler in self.snapshot() {
            handler.offer(value.clone());
        }
    }

    /// Offer `value` to the handler registered as `id` only
    pub fn notify_one(&self, id: SubscriptionId, value: T) {
        if let Some(handler) = self.snapshot().into_iter().find(|h| h.id == id) {
            handler.offer(value);
        }
    }

    fn snapshot(&self) -> Vec<Arc<Handler<T>>> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T: Clone + Send + 'static> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}
