use crate::JobId;
use bitflags::bitflags;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

bitflags! {
    /// Bit-assigned event codes, composable with `|` and filterable with `&`.
    ///
    /// Direct translation of the `EVENT_*` integer constants in
    /// `apscheduler.events`, kept as a real bitflags type instead of bare
    /// constants so masks compose and print legibly.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EventKind: u32 {
        const SCHEDULER_STARTED  = 1 << 0;
        const SCHEDULER_SHUTDOWN = 1 << 1;
        const JOBSTORE_ADDED     = 1 << 2;
        const JOBSTORE_REMOVED   = 1 << 3;
        const JOBSTORE_CLEARED   = 1 << 4;
        const JOB_ADDED          = 1 << 5;
        const JOB_MODIFIED       = 1 << 6;
        const JOB_REMOVED        = 1 << 7;
        const JOB_EXECUTED       = 1 << 8;
        const JOB_ERROR          = 1 << 9;
        const JOB_MISSED         = 1 << 10;
        const ALL = Self::SCHEDULER_STARTED.bits()
            | Self::SCHEDULER_SHUTDOWN.bits()
            | Self::JOBSTORE_ADDED.bits()
            | Self::JOBSTORE_REMOVED.bits()
            | Self::JOBSTORE_CLEARED.bits()
            | Self::JOB_ADDED.bits()
            | Self::JOB_MODIFIED.bits()
            | Self::JOB_REMOVED.bits()
            | Self::JOB_EXECUTED.bits()
            | Self::JOB_ERROR.bits()
            | Self::JOB_MISSED.bits();
    }
}

/// A single notification fanned out to listeners.
///
/// Kind-specific fields are optional and populated according to `kind`,
/// matching the variety of `*Event` subclasses in `apscheduler.events`
/// collapsed into one record the way an embedder-facing Rust API would.
#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventKind,
    pub store_alias: Option<String>,
    pub job_id: Option<JobId>,
    pub run_time: Option<chrono::DateTime<chrono::Utc>>,
    pub error: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            store_alias: None,
            job_id: None,
            run_time: None,
            error: None,
        }
    }

    pub fn with_store(mut self, alias: impl Into<String>) -> Self {
        self.store_alias = Some(alias.into());
        self
    }

    pub fn with_job(mut self, id: JobId) -> Self {
        self.job_id = Some(id);
        self
    }

    pub fn with_run_time(mut self, run_time: chrono::DateTime<chrono::Utc>) -> Self {
        self.run_time = Some(run_time);
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

type Listener = Box<dyn Fn(&Event) + Send + 'static>;

/// Identity handle returned by `add_listener`, used to remove that exact
/// registration later -- two listeners sharing the same `EventKind` mask are
/// otherwise indistinguishable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registry of `(id, callback, mask)` subscribers with synchronous, bitmask
/// filtered fan-out.
///
/// Grounded on `BaseScheduler._notify_listeners`: subscribers are snapshotted
/// under a short-lived lock, then invoked outside it, so a slow or
/// re-entrant listener cannot block `add_listener`/`remove_listener` or the
/// firing loop's next iteration. A listener that panics is caught and logged
/// -- it must never bring down the scheduler.
pub struct EventBus {
    listeners: Mutex<Vec<(ListenerId, Listener, EventKind)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn add_listener<F>(&self, callback: F, mask: EventKind) -> ListenerId
    where
        F: Fn(&Event) + Send + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .lock()
            .unwrap()
            .push((id, Box::new(callback), mask));
        id
    }

    /// Removes the listener registered under `id`, a no-op if it was already
    /// removed or never existed.
    pub fn remove_listener(&self, id: ListenerId) {
        let mut listeners = self.listeners.lock().unwrap();
        if let Some(pos) = listeners.iter().position(|(lid, _, _)| *lid == id) {
            listeners.remove(pos);
        }
    }

    pub fn notify(&self, event: Event) {
        let listeners = self.listeners.lock().unwrap();
        let matching: Vec<&Listener> = listeners
            .iter()
            .filter(|(_, _, mask)| mask.intersects(event.kind))
            .map(|(_, cb, _)| cb)
            .collect();
        for callback in matching {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(&event)));
            if let Err(panic) = result {
                log::error!(target: "job_scheduler::event::EventBus::notify", "listener panicked: {:?}", panic_message(&panic));
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn listener_receives_matching_events_only() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        bus.add_listener(move |_| { seen2.fetch_add(1, Ordering::SeqCst); }, EventKind::JOB_ADDED);

        bus.notify(Event::new(EventKind::JOB_ADDED));
        bus.notify(Event::new(EventKind::JOB_REMOVED));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();

        bus.add_listener(|_| panic!("boom"), EventKind::ALL);
        bus.add_listener(move |_| { seen2.fetch_add(1, Ordering::SeqCst); }, EventKind::ALL);

        bus.notify(Event::new(EventKind::JOB_ADDED));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
