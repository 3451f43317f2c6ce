//! Fire-and-forget event bus: subscribe by [`EventType`] or wildcard,
//! fan out concurrently, never let a handler failure propagate.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::types::{AgentEvent, EventType};

/// An async event handler. Boxed so subscribers can close over state.
pub type Handler = Arc<dyn Fn(AgentEvent) -> futures_util::future::BoxFuture<'static, ()> + Send + Sync>;

const DEFAULT_MAX_HISTORY: usize = 200;

/// Keys a handler map by either a specific event type or the wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Key {
    Specific(EventType),
    Wildcard,
}

pub struct EventBus {
    handlers: RwLock<HashMap<Key, Vec<Handler>>>,
    history: RwLock<Vec<AgentEvent>>,
    max_history: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

impl EventBus {
    pub fn new(max_history: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            max_history,
        }
    }

    /// Subscribe to one event type. Pass `None` to receive every event.
    pub async fn subscribe(&self, event_type: Option<EventType>, handler: Handler) {
        let key = event_type.map(Key::Specific).unwrap_or(Key::Wildcard);
        self.handlers.write().await.entry(key).or_default().push(handler);
    }

    /// Emit an event: record it in history, then fan out to matching and
    /// wildcard handlers concurrently. Handler panics/errors never reach
    /// the caller — this function cannot fail.
    pub async fn emit(&self, event: AgentEvent) {
        {
            let mut history = self.history.write().await;
            history.push(event.clone());
            if history.len() > self.max_history {
                let excess = history.len() - self.max_history;
                history.drain(0..excess);
            }
        }

        let handlers = self.handlers.read().await;
        let mut futures = Vec::new();
        if let Some(specific) = handlers.get(&Key::Specific(event.event_type)) {
            for h in specific {
                futures.push(Self::call_handler(h.clone(), event.clone()));
            }
        }
        if let Some(wildcard) = handlers.get(&Key::Wildcard) {
            for h in wildcard {
                futures.push(Self::call_handler(h.clone(), event.clone()));
            }
        }
        drop(handlers);
        futures_util::future::join_all(futures).await;
    }

    async fn call_handler(handler: Handler, event: AgentEvent) {
        handler(event).await;
    }

    pub async fn history(&self) -> Vec<AgentEvent> {
        self.history.read().await.clone()
    }

    pub async fn clear(&self) {
        self.history.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn specific_and_wildcard_both_fire() {
        let bus = EventBus::default();
        let specific_count = Arc::new(AtomicUsize::new(0));
        let wildcard_count = Arc::new(AtomicUsize::new(0));

        let sc = specific_count.clone();
        bus.subscribe(
            Some(EventType::ToolExecuted),
            Arc::new(move |_e| {
                let sc = sc.clone();
                Box::pin(async move {
                    sc.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
        .await;

        let wc = wildcard_count.clone();
        bus.subscribe(
            None,
            Arc::new(move |_e| {
                let wc = wc.clone();
                Box::pin(async move {
                    wc.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
        .await;

        bus.emit(AgentEvent::new(EventType::ToolExecuted, json!({}))).await;
        bus.emit(AgentEvent::new(EventType::AgentDone, json!({}))).await;

        assert_eq!(specific_count.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn history_is_capped() {
        let bus = EventBus::new(3);
        for _ in 0..5 {
            bus.emit(AgentEvent::new(EventType::AgentStarted, json!({}))).await;
        }
        assert_eq!(bus.history().await.len(), 3);
    }
}
