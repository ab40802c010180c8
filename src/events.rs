//! Lifecycle events for generations and model calls.
//!
//! Provides an optional, non-intrusive way to observe execution. The client
//! emits retry and throttling events, the pipeline emits stage transitions.
//! Implement [`EventHandler`] to feed progress bars, websockets or metrics;
//! everything works without one.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::record::GenerationStatus;

/// Events emitted while generations run.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A generation left `Pending`.
    GenerationStarted { id: Uuid, stages: usize },
    /// A stage is about to call the model.
    StageStarted {
        id: Uuid,
        index: usize,
        name: String,
    },
    /// A stage finished and its weight was added to progress.
    StageCompleted {
        id: Uuid,
        index: usize,
        name: String,
        /// Overall progress after this stage, 0..=100.
        progress: u8,
        tokens_used: u32,
    },
    /// A transport-level retry is about to wait and try again.
    TransportRetry {
        /// Model the call targets.
        model: String,
        /// The retry attempt number (1-indexed).
        attempt: u32,
        /// Delay before this retry attempt.
        delay: Duration,
        /// Reason for the retry (error description).
        reason: String,
    },
    /// The shared limiter had no slot; the caller waits this long.
    RateLimited { model: String, wait: Duration },
    /// A generation reached a terminal state.
    GenerationFinished {
        id: Uuid,
        status: GenerationStatus,
        tokens_used: u32,
    },
}

/// Handler for lifecycle events.
///
/// Handlers run inline on the task that emits, so keep them cheap.
///
/// # Example
///
/// ```
/// use llm_orchestrator::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         match event {
///             Event::StageCompleted { name, progress, .. } => println!("{} done ({}%)", name, progress),
///             Event::GenerationFinished { id, status, .. } => println!("{} -> {}", id, status),
///             _ => {}
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use llm_orchestrator::events::{Event, FnEventHandler};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: Event| {
///     if let Event::TransportRetry { attempt, reason, .. } = event {
///         eprintln!("retry #{}: {}", attempt, reason);
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}

/// Collects every event it receives. Handy in tests.
#[derive(Debug, Default)]
pub struct EventLog {
    events: std::sync::Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl EventHandler for EventLog {
    fn on_event(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_without_handler_is_noop() {
        emit(
            &None,
            Event::RateLimited {
                model: "m".into(),
                wait: Duration::from_secs(1),
            },
        );
    }

    #[test]
    fn test_fn_handler_receives_events() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let handler: Option<Arc<dyn EventHandler>> = Some(Arc::new(FnEventHandler(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })));

        let id = Uuid::new_v4();
        emit(&handler, Event::GenerationStarted { id, stages: 2 });
        emit(
            &handler,
            Event::GenerationFinished {
                id,
                status: GenerationStatus::Completed,
                tokens_used: 42,
            },
        );
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_event_log_keeps_order() {
        let log = Arc::new(EventLog::new());
        let handler: Option<Arc<dyn EventHandler>> = Some(log.clone());
        let id = Uuid::new_v4();
        emit(&handler, Event::GenerationStarted { id, stages: 1 });
        emit(
            &handler,
            Event::StageStarted {
                id,
                index: 0,
                name: "analysis".into(),
            },
        );
        let events = log.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Event::StageStarted { index: 0, .. }));
    }
}
