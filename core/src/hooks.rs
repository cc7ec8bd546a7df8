//! Hook Bus (§4.E): synchronous, priority-ordered lifecycle event
//! dispatch. There is no teacher analogue for this subsystem (the
//! teacher runs GraphQL federation instead of a hook bus), so the
//! dispatch table is built directly on the primitives the rest of the
//! codebase already leans on elsewhere: an `Arc<RwLock<...>>` registry
//! in the style of `auth::session::SessionManager`, and
//! `tokio_util::sync::CancellationToken` for cancellation in the style
//! of `supervisor::Supervisor`.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::task_local;
use tokio_util::sync::CancellationToken;

use crate::error::HookError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    PreRequest,
    PostRequest,
    PreAuth,
    PostAuth,
    PreDbWrite,
    PostDbWrite,
    ExtensionStarted,
    ExtensionStopped,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::PreRequest => "pre_request",
            EventType::PostRequest => "post_request",
            EventType::PreAuth => "pre_auth",
            EventType::PostAuth => "post_auth",
            EventType::PreDbWrite => "pre_db_write",
            EventType::PostDbWrite => "post_db_write",
            EventType::ExtensionStarted => "extension_started",
            EventType::ExtensionStopped => "extension_stopped",
        };
        f.write_str(s)
    }
}

pub struct HookContext {
    pub event: EventType,
    pub extension: String,
    pub payload: JsonValue,
    pub cancel: CancellationToken,
}

/// `PreAuth` is the only event type a handler may veto; every other event
/// type's handler result is informational only (§4.E).
pub enum HookOutcome {
    Ok(JsonValue),
    Veto { reason: String },
}

type BoxFuture<T> = Pin<Box<dyn std::future::Future<Output = Result<T, HookError>> + Send>>;

#[derive(Clone)]
struct Subscription {
    extension: String,
    priority: i32,
    order: usize,
    handler: Arc<dyn Fn(HookContext) -> BoxFuture<HookOutcome> + Send + Sync>,
}

task_local! {
    static REENTRANCY_DEPTH: std::cell::Cell<u8>;
}

const MAX_REENTRANCY_DEPTH: u8 = 8;

#[derive(Default)]
struct Subscriptions {
    by_event: HashMap<EventType, Vec<Subscription>>,
    next_order: usize,
}

pub struct HookBus {
    subs: RwLock<Subscriptions>,
    default_deadline: Duration,
}

pub struct HookDispatchResult {
    pub extension: String,
    pub outcome: Result<HookOutcome, HookError>,
}

impl HookBus {
    pub fn new(default_deadline: Duration) -> Arc<Self> {
        Arc::new(Self {
            subs: RwLock::new(Subscriptions::default()),
            default_deadline,
        })
    }

    /// Idempotent by `(extension, event_type)` — a second `subscribe` call
    /// for the same pair replaces the earlier registration's priority
    /// rather than appending a duplicate entry.
    pub fn subscribe<F, Fut>(&self, extension: &str, event: EventType, priority: i32, handler: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<HookOutcome, HookError>> + Send + 'static,
    {
        let handler: Arc<dyn Fn(HookContext) -> BoxFuture<HookOutcome> + Send + Sync> =
            Arc::new(move |ctx| Box::pin(handler(ctx)));

        let mut subs = self.subs.write().expect("hook bus lock poisoned");
        let order = subs.next_order;
        subs.next_order += 1;
        let bucket = subs.by_event.entry(event).or_default();
        bucket.retain(|s| s.extension != extension);
        bucket.push(Subscription {
            extension: extension.to_string(),
            priority,
            order,
            handler,
        });
        bucket.sort_by_key(|s| (s.priority, s.order));
    }

    /// Dispatches `event` to every subscriber in priority order. Stops
    /// early only on a `PreAuth` veto; every other handler error is
    /// collected and does not prevent later handlers from running.
    pub async fn emit(
        &self,
        event: EventType,
        payload: JsonValue,
        cancel: CancellationToken,
    ) -> Vec<HookDispatchResult> {
        let handlers: Vec<Subscription> = {
            let subs = self.subs.read().expect("hook bus lock poisoned");
            subs.by_event.get(&event).cloned().unwrap_or_default()
        };

        let depth = REENTRANCY_DEPTH.try_with(|d| d.get()).unwrap_or(0);

        let mut results = Vec::with_capacity(handlers.len());
        for sub in handlers {
            if depth >= MAX_REENTRANCY_DEPTH {
                tracing::warn!(
                    %event,
                    extension = %sub.extension,
                    depth,
                    "dropping reentrant hook emission past depth cap"
                );
                continue;
            }
            if cancel.is_cancelled() {
                results.push(HookDispatchResult {
                    extension: sub.extension,
                    outcome: Err(HookError::Cancelled),
                });
                continue;
            }

            let ctx = HookContext {
                event,
                extension: sub.extension.clone(),
                payload: payload.clone(),
                cancel: cancel.clone(),
            };

            let handler = sub.handler.clone();
            let run = REENTRANCY_DEPTH.scope(std::cell::Cell::new(depth + 1), handler(ctx));

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(HookError::Cancelled),
                res = tokio::time::timeout(self.default_deadline, run) => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(HookError::DeadlineElapsed),
                },
            };

            let should_stop = matches!(
                (event, &outcome),
                (EventType::PreAuth, Ok(HookOutcome::Veto { .. }))
            );

            results.push(HookDispatchResult {
                extension: sub.extension,
                outcome,
            });

            if should_stop {
                break;
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn dispatches_in_priority_order() {
        let bus = HookBus::new(Duration::from_secs(1));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for (ext, prio) in [("late", 10), ("early", 1), ("mid", 5)] {
            let order = order.clone();
            bus.subscribe("host", EventType::PostRequest, prio, move |ctx| {
                let order = order.clone();
                let ext = ext.to_string();
                async move {
                    order.lock().unwrap().push(ext);
                    let _ = ctx;
                    Ok(HookOutcome::Ok(JsonValue::Null))
                }
            });
        }

        bus.emit(
            EventType::PostRequest,
            JsonValue::Null,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(
            *order.lock().unwrap(),
            vec!["early".to_string(), "mid".to_string(), "late".to_string()]
        );
    }

    #[tokio::test]
    async fn pre_auth_veto_short_circuits() {
        let bus = HookBus::new(Duration::from_secs(1));
        let calls = Arc::new(AtomicUsize::new(0));

        bus.subscribe("gatekeeper", EventType::PreAuth, 1, |_ctx| async {
            Ok(HookOutcome::Veto {
                reason: "no token".into(),
            })
        });

        let calls_clone = calls.clone();
        bus.subscribe("never-runs", EventType::PreAuth, 2, move |_ctx| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(HookOutcome::Ok(JsonValue::Null))
            }
        });

        let results = bus
            .emit(EventType::PreAuth, JsonValue::Null, CancellationToken::new())
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_error_does_not_abort_later_handlers() {
        let bus = HookBus::new(Duration::from_secs(1));
        let ran = Arc::new(AtomicUsize::new(0));

        bus.subscribe("failer", EventType::PostDbWrite, 1, |_ctx| async {
            Err(HookError::HandlerFailed {
                extension: "failer".into(),
                event: "post_db_write".into(),
                message: "boom".into(),
            })
        });

        let ran_clone = ran.clone();
        bus.subscribe("survivor", EventType::PostDbWrite, 2, move |_ctx| {
            let ran = ran_clone.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(HookOutcome::Ok(JsonValue::Null))
            }
        });

        let results = bus
            .emit(
                EventType::PostDbWrite,
                JsonValue::Null,
                CancellationToken::new(),
            )
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
