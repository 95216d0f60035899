//! In-process event bus.
//!
//! Handlers register for one [`EventKind`] and receive every event of that kind.
//! [`EventBus::notify`] awaits the handlers one after the other in registration
//! order, so a publisher can rely on every handler having run when `notify`
//! returns. Inbound events from the instrument take the other path:
//! [`EventBus::run_inbound`] delivers them from spawned tasks, so slow handlers
//! of one event never hold up delivery of the next. Image events of one well
//! share a lane and are delivered in arrival order; everything else gets its
//! own task.
//!
//! Registration returns a [`Subscription`] handle. Handlers stay registered until
//! [`Subscription::unsubscribe`] is called; dropping the handle does not remove
//! the handler.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::error::AppResult;
use crate::event::{Event, EventKind};
use crate::sample::WellCoord;

/// A registered event handler.
pub type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, AppResult<()>> + Send + Sync>;

struct Registration {
    id: u64,
    kind: EventKind,
    name: String,
    handler: Handler,
}

/// Publish/subscribe hub for [`Event`]s.
#[derive(Default)]
pub struct EventBus {
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    ///
    /// `name` identifies the handler in logs.
    pub fn register<F, Fut>(self: &Arc<Self>, kind: EventKind, name: &str, handler: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler = Arc::new(move |event| handler(event).boxed());
        self.registrations.write().push(Registration {
            id,
            kind,
            name: name.to_string(),
            handler,
        });
        debug!(handler = name, ?kind, "Registered event handler");
        Subscription {
            id,
            name: name.to_string(),
            bus: Arc::downgrade(self),
        }
    }

    /// Number of handlers registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.registrations
            .read()
            .iter()
            .filter(|reg| reg.kind == kind)
            .count()
    }

    /// Deliver `event` to its handlers in registration order.
    ///
    /// Handler errors are logged and do not stop the remaining handlers.
    /// Returns the number of handlers that ran.
    pub async fn notify(&self, event: Event) -> usize {
        let kind = event.kind();
        let handlers: Vec<(String, Handler)> = self
            .registrations
            .read()
            .iter()
            .filter(|reg| reg.kind == kind)
            .map(|reg| (reg.name.clone(), Arc::clone(&reg.handler)))
            .collect();

        for (name, handler) in &handlers {
            if let Err(err) = handler(event.clone()).await {
                error!(handler = %name, ?kind, error = %err, "Event handler failed");
            }
        }
        handlers.len()
    }

    /// Deliver events from `inbound` until the sender side closes.
    ///
    /// Image events are handed to a per-well lane that delivers them one after
    /// the other, so a well's images reach the handlers in arrival order. Other
    /// events are each handled in their own task. Returns after all spawned
    /// deliveries have finished.
    pub async fn run_inbound(self: Arc<Self>, mut inbound: mpsc::Receiver<Event>) {
        let mut deliveries = JoinSet::new();
        let mut lanes: HashMap<WellCoord, mpsc::UnboundedSender<Event>> = HashMap::new();
        while let Some(event) = inbound.recv().await {
            match delivery_lane(&event) {
                Some(well) => {
                    let lane = lanes.entry(well).or_insert_with(|| {
                        let (tx, rx) = mpsc::unbounded_channel();
                        deliveries.spawn(Arc::clone(&self).run_lane(rx));
                        tx
                    });
                    // Fails only if the lane task panicked
                    if lane.send(event).is_err() {
                        error!("Event lane closed, dropping image event");
                    }
                }
                None => {
                    let bus = Arc::clone(&self);
                    deliveries.spawn(async move {
                        bus.notify(event).await;
                    });
                }
            }
            // Reap finished deliveries so the set does not grow with the run
            while deliveries.try_join_next().is_some() {}
        }
        drop(lanes);
        while let Some(result) = deliveries.join_next().await {
            if let Err(err) = result {
                error!(error = %err, "Event delivery task failed");
            }
        }
    }

    async fn run_lane(self: Arc<Self>, mut lane: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = lane.recv().await {
            self.notify(event).await;
        }
    }

    fn remove(&self, id: u64) -> bool {
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|reg| reg.id != id);
        registrations.len() != before
    }
}

/// Well whose events must be delivered in order, if any.
fn delivery_lane(event: &Event) -> Option<WellCoord> {
    match event {
        Event::ImageArrived(image) => Some(image.well()),
        _ => None,
    }
}

/// Handle to a registered handler.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    name: String,
    bus: Weak<EventBus>,
}

impl Subscription {
    /// Name the handler was registered with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the handler from the bus.
    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade() {
            if bus.remove(self.id) {
                debug!(handler = %self.name, "Removed event handler");
            }
        }
    }
}
