//! Type-safe event bus for domain event notification.
//!
//! S3 handlers emit typed domain events (bucket created, object removed,
//! …) after writing their response; downstream sinks (bucket notification
//! targets, the audit pipeline) subscribe without direct coupling.
//!
//! Each event type is a distinct struct implementing the [`Event`] marker
//! trait. Internally the bus maintains a `HashMap<TypeId, Box<dyn Any>>`
//! where each value is a `tokio::sync::broadcast::Sender<E>`; channels are
//! created lazily on the first `subscribe()` for a given type. Emission is
//! non-blocking and events without subscribers are dropped.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

/// Marker trait for all events that can travel through the [`EventBus`].
pub trait Event: Any + Send + Sync + Clone + std::fmt::Debug + 'static {}

/// Request provenance attached to every emitted event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSource {
    /// Source IP of the originating request.
    pub host: String,
    /// `User-Agent` of the originating request.
    pub user_agent: String,
    /// Request ID assigned by the handler envelope.
    pub request_id: String,
}

/// A bucket was created.
#[derive(Clone, Debug)]
pub struct BucketCreated {
    /// The new bucket.
    pub bucket: String,
    /// Request provenance.
    pub source: EventSource,
}
impl Event for BucketCreated {}

/// A bucket was deleted.
#[derive(Clone, Debug)]
pub struct BucketRemoved {
    /// The removed bucket.
    pub bucket: String,
    /// Request provenance.
    pub source: EventSource,
}
impl Event for BucketRemoved {}

/// An object was created via a browser `POST` upload (including fan-out).
#[derive(Clone, Debug)]
pub struct ObjectCreatedPost {
    /// Bucket the object was written into.
    pub bucket: String,
    /// Object key.
    pub object: String,
    /// Version ID when versioning is enabled.
    pub version_id: String,
    /// ETag of the stored object.
    pub etag: String,
    /// Object size in bytes.
    pub size: i64,
    /// Request provenance.
    pub source: EventSource,
}
impl Event for ObjectCreatedPost {}

/// An object (or one version of it) was removed.
#[derive(Clone, Debug)]
pub struct ObjectRemovedDelete {
    /// Bucket the object lived in.
    pub bucket: String,
    /// Object key.
    pub object: String,
    /// Version ID that was removed.
    pub version_id: String,
    /// Request provenance.
    pub source: EventSource,
}
impl Event for ObjectRemovedDelete {}

/// A delete produced a delete marker instead of removing data.
#[derive(Clone, Debug)]
pub struct ObjectRemovedDeleteMarkerCreated {
    /// Bucket the object lives in.
    pub bucket: String,
    /// Object key.
    pub object: String,
    /// Version ID of the created delete marker.
    pub version_id: String,
    /// Request provenance.
    pub source: EventSource,
}
impl Event for ObjectRemovedDeleteMarkerCreated {}

/// An object accumulated more versions than the configured threshold.
#[derive(Clone, Debug)]
pub struct ObjectManyVersions {
    /// Bucket the object lives in.
    pub bucket: String,
    /// Object key.
    pub object: String,
    /// Number of versions observed after the write.
    pub num_versions: usize,
    /// Request provenance.
    pub source: EventSource,
}
impl Event for ObjectManyVersions {}

/// Default broadcast channel capacity per event type.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

struct EventBusInner {
    channels: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

/// A type-safe event bus. Clonable (`Arc` inside), thread-safe,
/// non-blocking emits.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<EventBusInner>>,
}

impl EventBus {
    /// Create a new empty event bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventBusInner {
                channels: HashMap::new(),
            })),
        }
    }

    /// Emit an event to all current subscribers of type `E`.
    ///
    /// If no subscriber has registered a channel for `E`, the event is
    /// dropped silently.
    pub fn emit<E: Event>(&self, event: E) {
        let type_id = TypeId::of::<E>();
        let inner = self.inner.lock().expect("event bus lock poisoned");

        if let Some(boxed) = inner.channels.get(&type_id) {
            let sender = boxed
                .downcast_ref::<broadcast::Sender<E>>()
                .expect("type mismatch in event bus");
            // Err means no active receivers; that's fine.
            let _ = sender.send(event);
        }
    }

    /// Subscribe to events of type `E`, creating the channel lazily.
    pub fn subscribe<E: Event>(&self) -> EventReceiver<E> {
        let type_id = TypeId::of::<E>();
        let mut inner = self.inner.lock().expect("event bus lock poisoned");

        let sender = inner
            .channels
            .entry(type_id)
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel::<E>(DEFAULT_CHANNEL_CAPACITY);
                Box::new(tx)
            })
            .downcast_ref::<broadcast::Sender<E>>()
            .expect("type mismatch in event bus");

        EventReceiver {
            rx: sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("channel_count", &inner.channels.len())
            .finish()
    }
}

/// Typed receiver for a specific event type.
pub struct EventReceiver<E: Event> {
    rx: broadcast::Receiver<E>,
}

impl<E: Event> EventReceiver<E> {
    /// Wait for the next event. Returns `None` once the bus is dropped.
    /// Lagged events are skipped with a warning.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        skipped = n,
                        event_type = std::any::type_name::<E>(),
                        "event receiver lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive, for draining in tests.
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}
