//! In-process publish/subscribe bus for collection lifecycle and save events.
//!
//! Producers on any task call `post`; events are queued and delivered by a
//! single `Dispatcher` loop, which plays the role of the foreground execution
//! context. Handlers therefore run one at a time, in posting order, and never
//! need their own synchronization.
//!
//! A `Subscription` is the only thing keeping a handler registered. Dropping
//! it (or calling `unsubscribe`) removes the handler; the bus never keeps a
//! handler alive past its subscription.

use futures::Stream;
use log::debug;
use std::collections::BTreeMap;
use std::pin::Pin as StdPin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context as TaskContext, Poll};
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::model::{ObjectId, PhotoId, PinId};
use crate::persistence::ContextKind;

/// What happened to a pin's collection
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionEventKind {
    /// Number of placeholders to render, known before any download starts
    CountAnnounced { expected: usize },
    /// A photo was persisted; `index` counts successes from zero
    ItemSaved { index: usize, photo: PhotoId },
    /// Cycle finished; `actual` may be below the announced count
    CollectionReady { actual: usize },
    /// The search matched nothing
    CollectionEmpty,
    /// Cycle aborted; any placeholders should be removed
    CollectionFailed { reason: SyncError },
}

impl CollectionEventKind {
    /// Whether this event ends a fetch cycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CollectionEventKind::CollectionReady { .. }
                | CollectionEventKind::CollectionEmpty
                | CollectionEventKind::CollectionFailed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionEvent {
    pub pin: PinId,
    pub kind: CollectionEventKind,
}

/// Published after a context save reaches the store
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SaveNotification {
    pub context: ContextKind,
    pub inserted: Vec<ObjectId>,
    pub updated: Vec<ObjectId>,
    pub deleted: Vec<ObjectId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Collection(CollectionEvent),
    DidSave(SaveNotification),
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: BTreeMap<u64, Handler>,
}

/// The event bus
pub struct ChangeNotifier {
    queue: mpsc::UnboundedSender<Event>,
    registry: Arc<Mutex<Registry>>,
}

/// Delivery loop for a `ChangeNotifier`
pub struct Dispatcher {
    queue: mpsc::UnboundedReceiver<Event>,
    registry: Arc<Mutex<Registry>>,
}

impl ChangeNotifier {
    /// Creates a bus and the loop that must be driven to deliver its events
    pub fn new() -> (Arc<Self>, Dispatcher) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Mutex::new(Registry::default()));
        let notifier = Arc::new(Self {
            queue: tx,
            registry: Arc::clone(&registry),
        });
        (
            notifier,
            Dispatcher {
                queue: rx,
                registry,
            },
        )
    }

    /// Creates a bus and runs its dispatcher on the current tokio runtime
    pub fn spawn() -> Arc<Self> {
        let (notifier, dispatcher) = Self::new();
        tokio::spawn(dispatcher.run());
        notifier
    }

    /// Queues an event for delivery. Never blocks.
    pub fn post(&self, event: Event) {
        if self.queue.send(event).is_err() {
            debug!("Dropping event: dispatcher has stopped");
        }
    }

    pub fn post_collection(&self, pin: PinId, kind: CollectionEventKind) {
        self.post(Event::Collection(CollectionEvent { pin, kind }));
    }

    /// Registers `handler` until the returned subscription is released
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = registry.next_id;
        registry.next_id += 1;
        registry.handlers.insert(id, Arc::new(handler));

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Subscribes and exposes the events as an async stream
    pub fn events(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        EventStream {
            receiver: rx,
            _subscription: subscription,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .handlers
            .len()
    }
}

impl Dispatcher {
    /// Delivers events until every `ChangeNotifier` handle is dropped
    pub async fn run(mut self) {
        while let Some(event) = self.queue.recv().await {
            // snapshot so handlers may subscribe or unsubscribe while running
            let handlers: Vec<Handler> = {
                let registry = self
                    .registry
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                registry.handlers.values().cloned().collect()
            };
            for handler in handlers {
                handler(&event);
            }
        }
        debug!("Change notifier dispatcher stopped");
    }
}

/// Keeps a handler registered. Released on drop.
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            registry.handlers.remove(&self.id);
        }
    }
}

/// Events delivered to one subscriber, in order
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<Event>,
    _subscription: Subscription,
}

impl EventStream {
    pub async fn next_event(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Next collection event for `pin`, skipping everything else
    pub async fn next_for_pin(&mut self, pin: PinId) -> Option<CollectionEventKind> {
        while let Some(event) = self.receiver.recv().await {
            if let Event::Collection(event) = event {
                if event.pin == pin {
                    return Some(event.kind);
                }
            }
        }
        None
    }

    /// Collection events for `pin` up to and including the terminal one
    pub async fn cycle_for_pin(&mut self, pin: PinId) -> Vec<CollectionEventKind> {
        let mut events = Vec::new();
        while let Some(kind) = self.next_for_pin(pin).await {
            let terminal = kind.is_terminal();
            events.push(kind);
            if terminal {
                break;
            }
        }
        events
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: StdPin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Event>> {
        self.receiver.poll_recv(cx)
    }
}
