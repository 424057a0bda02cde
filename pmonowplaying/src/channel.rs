//! Canal d'événements nommé côté hôte.
//!
//! [`EventChannel`] is the seam the gate talks to: it reads the handler count,
//! broadcasts status objects and registers a hook fired on every attach/detach.
//! [`StatusChannel`] is the in-process implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tracing::{debug, trace};

use crate::locks::lock;

/// Hook invoked whenever the number of listeners changes.
pub type CountHook = Arc<dyn Fn() + Send + Sync>;

pub trait EventChannel: Send + Sync {
    /// Channel key, e.g. `spotifyPluginStatus`.
    fn name(&self) -> &str;

    /// Number of currently attached listeners.
    fn handler_count(&self) -> usize;

    /// Delivers `payload` to every current listener.
    fn broadcast(&self, payload: &Value);

    /// Replaces the hook fired after each attach/detach.
    fn on_handler_count_change(&self, hook: CountHook);
}

struct ChannelInner {
    subscribers: Mutex<Vec<(u64, UnboundedSender<Value>)>>,
    hook: Mutex<Option<CountHook>>,
    next_id: AtomicU64,
}

impl ChannelInner {
    fn fire_hook(&self) {
        // Le hook est appelé hors verrou : il relit handler_count()
        let hook = lock(&self.hook).clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn detach(&self, id: u64) {
        let removed = {
            let mut subscribers = lock(&self.subscribers);
            let before = subscribers.len();
            subscribers.retain(|(sid, _)| *sid != id);
            before != subscribers.len()
        };
        if removed {
            self.fire_hook();
        }
    }
}

/// Named many-listener broadcast point.
pub struct StatusChannel {
    name: String,
    inner: Arc<ChannelInner>,
}

impl StatusChannel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: Arc::new(ChannelInner {
                subscribers: Mutex::new(Vec::new()),
                hook: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Attaches a new listener. Dropping the returned [`Subscription`] detaches it.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel::<Value>();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut subscribers = lock(&self.inner.subscribers);
            subscribers.push((id, tx));
            subscribers.len()
        };
        debug!(channel = %self.name, subscriber = id, count, "Listener attached");
        self.inner.fire_hook();

        Subscription {
            id,
            rx,
            channel: Arc::downgrade(&self.inner),
        }
    }
}

impl EventChannel for StatusChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn handler_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    fn broadcast(&self, payload: &Value) {
        let mut subscribers = lock(&self.inner.subscribers);
        subscribers.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
        trace!(channel = %self.name, listeners = subscribers.len(), "Status broadcast");
    }

    fn on_handler_count_change(&self, hook: CountHook) {
        *lock(&self.inner.hook) = Some(hook);
    }
}

/// A listener attached to a [`StatusChannel`].
pub struct Subscription {
    id: u64,
    rx: UnboundedReceiver<Value>,
    channel: Weak<ChannelInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next broadcast payload.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Value, TryRecvError> {
        self.rx.try_recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            inner.detach(self.id);
        }
    }
}
