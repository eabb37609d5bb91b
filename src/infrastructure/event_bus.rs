//! Event Bus Module
//!
//! Typed publish/subscribe registry that connects discovery, the GATT session
//! and consumers without them holding references to each other.
//!
//! Each concrete event type is its own discriminator, so a handler registered
//! for [`DeviceFound`](crate::domain::models::DeviceFound) can only ever see
//! that payload. Publishing snapshots the current subscribers for the type and
//! queues one delivery job on the bus's own delivery thread; the publisher
//! never waits for handlers.

use crate::domain::models::BusEvent;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

type Job = Box<dyn FnOnce() + Send>;

/// Something that wants to hear about events of type `E`.
pub trait Subscriber<E>: Send + Sync {
    fn on_event(&self, event: &E);
}

impl<E, F> Subscriber<E> for F
where
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        self(event)
    }
}

/// Shared handle to a subscriber; its pointer identity is what
/// `subscribe`/`unsubscribe` compare.
pub type Handler<E> = Arc<dyn Subscriber<E>>;

/// Wrap a closure as a [`Handler`].
pub fn handler<E, F>(f: F) -> Handler<E>
where
    E: BusEvent,
    F: Fn(&E) + Send + Sync + 'static,
{
    Arc::new(f)
}

fn same_handler<E>(a: &Handler<E>, b: &Handler<E>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

struct Delivery {
    jobs: Option<mpsc::UnboundedSender<Job>>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

pub struct EventBus {
    // TypeId::of::<E>() -> Vec<Handler<E>>
    subscribers: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    delivery: Mutex<Delivery>,
}

impl EventBus {
    /// Create a bus and start its delivery thread.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker = thread::Builder::new()
            .name("event-bus".to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job();
                }
                debug!("Event bus delivery thread exiting");
            });

        let (jobs, worker, worker_id) = match worker {
            Ok(worker) => {
                let id = worker.thread().id();
                (Some(tx), Some(worker), id)
            }
            Err(e) => {
                error!("Failed to start event bus delivery thread: {}", e);
                (None, None, thread::current().id())
            }
        };

        Self {
            subscribers: RwLock::new(HashMap::new()),
            delivery: Mutex::new(Delivery {
                jobs,
                worker,
                worker_id,
            }),
        }
    }

    /// Register `handler` for events of type `E`. Returns false if this exact
    /// handler was already registered.
    pub fn subscribe<E: BusEvent>(&self, handler: Handler<E>) -> bool {
        let mut map = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = map
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(Vec::<Handler<E>>::new()));
        let Some(list) = entry.downcast_mut::<Vec<Handler<E>>>() else {
            return false;
        };

        if list.iter().any(|h| same_handler(h, &handler)) {
            return false;
        }
        list.push(handler);
        true
    }

    /// Remove `handler` for events of type `E`. Returns false if it was not
    /// registered.
    pub fn unsubscribe<E: BusEvent>(&self, handler: &Handler<E>) -> bool {
        let mut map = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(list) = map
            .get_mut(&TypeId::of::<E>())
            .and_then(|entry| entry.downcast_mut::<Vec<Handler<E>>>())
        else {
            return false;
        };

        let before = list.len();
        list.retain(|h| !same_handler(h, handler));
        before != list.len()
    }

    pub fn subscriber_count<E: BusEvent>(&self) -> usize {
        self.snapshot::<E>().len()
    }

    /// Deliver `event` to every handler registered for `E` right now, in
    /// registration order, on the delivery thread.
    pub fn publish<E: BusEvent>(&self, event: E) {
        let handlers = self.snapshot::<E>();
        if handlers.is_empty() {
            trace!("No subscribers for {}", std::any::type_name::<E>());
            return;
        }

        let event = Arc::new(event);
        self.enqueue(Box::new(move || {
            for h in &handlers {
                let result = catch_unwind(AssertUnwindSafe(|| h.on_event(&event)));
                if result.is_err() {
                    error!(
                        "Subscriber for {} panicked; continuing delivery",
                        std::any::type_name::<E>()
                    );
                }
            }
        }));
    }

    /// Block until everything published before this call has been delivered.
    /// Returns immediately when called from a handler or after shutdown.
    pub fn flush(&self) {
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        {
            let delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
            if delivery.worker_id == thread::current().id() {
                return;
            }
            let Some(jobs) = delivery.jobs.as_ref() else {
                return;
            };
            if jobs
                .send(Box::new(move || {
                    let _ = done_tx.send(());
                }))
                .is_err()
            {
                return;
            }
        }
        let _ = done_rx.recv();
    }

    /// Stop accepting events, drain what is queued and join the delivery
    /// thread. Safe to call more than once.
    pub fn shutdown(&self) {
        let worker = {
            let mut delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
            delivery.jobs = None;
            if delivery.worker_id == thread::current().id() {
                return;
            }
            delivery.worker.take()
        };

        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("Event bus delivery thread panicked");
            }
        }
    }

    fn snapshot<E: BusEvent>(&self) -> Vec<Handler<E>> {
        let map = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        map.get(&TypeId::of::<E>())
            .and_then(|entry| entry.downcast_ref::<Vec<Handler<E>>>())
            .cloned()
            .unwrap_or_default()
    }

    fn enqueue(&self, job: Job) {
        let delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        match delivery.jobs.as_ref() {
            Some(jobs) => {
                if jobs.send(job).is_err() {
                    debug!("Event bus delivery thread gone; event dropped");
                }
            }
            None => debug!("Event bus shut down; event dropped"),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{DeviceAddress, DeviceFound, DeviceIdentity, DeviceType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn found(address: &str) -> DeviceFound {
        DeviceFound(DeviceIdentity::new(
            DeviceAddress::parse(address).unwrap(),
            None,
            DeviceType::Le,
        ))
    }

    #[derive(Debug)]
    struct Other(u32);
    impl BusEvent for Other {}

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(found("00:11:22:33:44:55"));
        bus.flush();
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let log = log.clone();
            bus.subscribe(handler(move |_: &DeviceFound| log.lock().unwrap().push(tag)));
        }

        bus.publish(found("00:11:22:33:44:55"));
        bus.flush();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_subscribe_and_unsubscribe_are_idempotent() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let h = handler(move |_: &DeviceFound| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.subscribe(h.clone()));
        assert!(!bus.subscribe(h.clone()));
        assert_eq!(bus.subscriber_count::<DeviceFound>(), 1);

        bus.publish(found("00:11:22:33:44:55"));
        bus.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(bus.unsubscribe(&h));
        assert!(!bus.unsubscribe(&h));
        bus.publish(found("00:11:22:33:44:55"));
        bus.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kinds_are_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(handler(move |e: &Other| sink.lock().unwrap().push(e.0)));

        bus.publish(found("00:11:22:33:44:55"));
        bus.publish(Other(7));
        bus.flush();
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn test_subscriber_added_during_publish_sees_only_next() {
        let bus = Arc::new(EventBus::new());
        let late_hits = Arc::new(AtomicUsize::new(0));

        let late: Handler<Other> = {
            let late_hits = late_hits.clone();
            handler(move |_: &Other| {
                late_hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        let weak_bus = Arc::downgrade(&bus);
        let registering = late.clone();
        bus.subscribe(handler(move |_: &Other| {
            if let Some(bus) = weak_bus.upgrade() {
                bus.subscribe(registering.clone());
            }
        }));

        bus.publish(Other(1));
        bus.flush();
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);

        bus.publish(Other(2));
        bus.flush();
        assert_eq!(late_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_subscriber_does_not_stop_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe(handler(|_: &Other| panic!("boom")));
        let counter = hits.clone();
        bus.subscribe(handler(move |_: &Other| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(Other(1));
        bus.publish(Other(2));
        bus.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_publish_after_shutdown_is_dropped() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        bus.subscribe(handler(move |_: &Other| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        bus.shutdown();
        bus.shutdown();
        bus.publish(Other(1));
        bus.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
