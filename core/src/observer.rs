use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::task::TaskSnapshot;

pub type ObserverId = u64;

/// Receives a snapshot after every task state change, on whichever thread
/// made the change. Implementations that drive a UI must hand the snapshot
/// over to the UI thread themselves (see [`ChannelObserver`]).
pub trait TaskObserver: Send + Sync {
    fn on_task_update(&self, snapshot: &TaskSnapshot);
}

impl<F> TaskObserver for F
where
    F: Fn(&TaskSnapshot) + Send + Sync,
{
    fn on_task_update(&self, snapshot: &TaskSnapshot) {
        self(snapshot)
    }
}

#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    observers: Mutex<Vec<(ObserverId, Arc<dyn TaskObserver>)>>,
}

impl ObserverRegistry {
    pub fn subscribe(&self, observer: Arc<dyn TaskObserver>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut observers) = self.observers.lock() {
            observers.push((id, observer));
        }
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        match self.observers.lock() {
            Ok(mut observers) => {
                let before = observers.len();
                observers.retain(|(existing, _)| *existing != id);
                observers.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.observers.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls every observer outside the registry lock, so observers may
    /// subscribe or unsubscribe from inside the callback.
    pub fn notify(&self, snapshot: &TaskSnapshot) {
        let observers: Vec<Arc<dyn TaskObserver>> = match self.observers.lock() {
            Ok(observers) => observers.iter().map(|(_, o)| Arc::clone(o)).collect(),
            Err(_) => return,
        };
        for observer in observers {
            observer.on_task_update(snapshot);
        }
    }
}

/// Forwards snapshots into a bounded queue. A full queue blocks the
/// notifying thread until the consumer catches up; a dropped receiver
/// turns the observer into a no-op.
pub struct ChannelObserver {
    sender: SyncSender<TaskSnapshot>,
}

impl ChannelObserver {
    pub fn channel(capacity: usize) -> (Arc<Self>, Receiver<TaskSnapshot>) {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        (Arc::new(Self { sender }), receiver)
    }
}

impl TaskObserver for ChannelObserver {
    fn on_task_update(&self, snapshot: &TaskSnapshot) {
        if self.sender.send(snapshot.clone()).is_err() {
            debug!(task = %snapshot.id, "update receiver dropped");
        }
    }
}
