//! Observability hook registry.
//!
//! Components report what happens to them as [`Observation`]s; pluggable
//! [`ObserverHook`]s subscribe to one or more [`EventClass`]es. Dispatch is
//! asynchronous and lossy: every hook runs on a fresh task and a failing or
//! slow hook never blocks the caller.

use std::{collections::HashMap, fmt, sync::Arc};

use {
    anyhow::Result,
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tracing::warn,
};

// ── Event classes ───────────────────────────────────────────────────────────

/// The four observation streams hooks can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventClass {
    Error,
    Metric,
    Connection,
    System,
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl EventClass {
    /// All variants, for hooks that subscribe to everything.
    pub const ALL: &'static [EventClass] = &[
        Self::Error,
        Self::Metric,
        Self::Connection,
        Self::System,
    ];
}

// ── Observations ────────────────────────────────────────────────────────────

/// What happened to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionKind {
    Connected,
    Disconnected,
    Replaced,
    Stale,
    HeartbeatFailed,
}

/// Instance-level state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemKind {
    Started,
    Degraded,
    Recovered,
    ShuttingDown,
}

/// A single observed event, carried to every subscribed hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "class")]
pub enum Observation {
    Error {
        scope: String,
        message: String,
    },
    Metric {
        name: String,
        value: f64,
    },
    Connection {
        kind: ConnectionKind,
        user_id: String,
        session_id: String,
    },
    System {
        kind: SystemKind,
        detail: String,
    },
}

impl Observation {
    pub fn class(&self) -> EventClass {
        match self {
            Self::Error { .. } => EventClass::Error,
            Self::Metric { .. } => EventClass::Metric,
            Self::Connection { .. } => EventClass::Connection,
            Self::System { .. } => EventClass::System,
        }
    }

    pub fn error(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            scope: scope.into(),
            message: message.into(),
        }
    }

    pub fn metric(name: impl Into<String>, value: f64) -> Self {
        Self::Metric {
            name: name.into(),
            value,
        }
    }

    pub fn connection(
        kind: ConnectionKind,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self::Connection {
            kind,
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    pub fn system(kind: SystemKind, detail: impl Into<String>) -> Self {
        Self::System {
            kind,
            detail: detail.into(),
        }
    }
}

// ── ObserverHook trait ──────────────────────────────────────────────────────

/// Trait implemented by observation consumers (log sinks, health monitors,
/// exporters). Hooks must tolerate being called concurrently.
#[async_trait]
pub trait ObserverHook: Send + Sync {
    /// A human-readable name for this hook.
    fn name(&self) -> &str;

    /// Which event classes this hook subscribes to.
    fn classes(&self) -> &[EventClass];

    /// Consume one observation. Errors are logged and dropped.
    async fn observe(&self, observation: &Observation) -> Result<()>;
}

// ── ObserverRegistry ────────────────────────────────────────────────────────

/// Holds the hook lists and fans observations out to them.
///
/// Registration happens once at startup (`&mut self`); afterwards the
/// registry is shared behind an `Arc` and [`emit`](Self::emit) is lock-free.
#[derive(Default)]
pub struct ObserverRegistry {
    hooks: HashMap<EventClass, Vec<Arc<dyn ObserverHook>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook for every class it subscribes to.
    pub fn register(&mut self, hook: Arc<dyn ObserverHook>) {
        for &class in hook.classes() {
            self.hooks.entry(class).or_default().push(Arc::clone(&hook));
        }
        tracing::debug!(hook = hook.name(), "observer hook registered");
    }

    /// Returns true if any hook subscribes to the given class.
    pub fn has_hooks(&self, class: EventClass) -> bool {
        self.hooks.get(&class).is_some_and(|v| !v.is_empty())
    }

    /// Fan an observation out to every subscribed hook, each on its own task.
    /// Never blocks: callers on the hub hot path pay one `Arc` clone per hook.
    pub fn emit(&self, observation: Observation) {
        let Some(hooks) = self.hooks.get(&observation.class()) else {
            return;
        };
        let shared = Arc::new(observation);
        for hook in hooks {
            let hook = Arc::clone(hook);
            let observation = Arc::clone(&shared);
            tokio::spawn(async move {
                if let Err(e) = hook.observe(&observation).await {
                    warn!(hook = hook.name(), error = %e, "observer hook failed");
                }
            });
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingHook {
        seen: AtomicUsize,
        subscribed: Vec<EventClass>,
    }

    #[async_trait]
    impl ObserverHook for CountingHook {
        fn name(&self) -> &str {
            "counter"
        }

        fn classes(&self) -> &[EventClass] {
            &self.subscribed
        }

        async fn observe(&self, _observation: &Observation) -> Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn emit_reaches_subscribed_classes_only() {
        let hook = Arc::new(CountingHook {
            seen: AtomicUsize::new(0),
            subscribed: vec![EventClass::Error],
        });
        let mut registry = ObserverRegistry::new();
        registry.register(Arc::clone(&hook) as Arc<dyn ObserverHook>);

        registry.emit(Observation::error("test", "boom"));
        registry.emit(Observation::metric("ignored", 1.0));

        // Dispatch is async; yield until the spawned task runs.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(hook.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_hook_does_not_poison_registry() {
        struct FailingHook;

        #[async_trait]
        impl ObserverHook for FailingHook {
            fn name(&self) -> &str {
                "failer"
            }

            fn classes(&self) -> &[EventClass] {
                EventClass::ALL
            }

            async fn observe(&self, _observation: &Observation) -> Result<()> {
                anyhow::bail!("always fails")
            }
        }

        let mut registry = ObserverRegistry::new();
        registry.register(Arc::new(FailingHook));

        // Must not panic or block.
        registry.emit(Observation::system(SystemKind::Degraded, "bus down"));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    #[test]
    fn observation_class_mapping() {
        assert_eq!(
            Observation::error("s", "m").class(),
            EventClass::Error
        );
        assert_eq!(Observation::metric("n", 0.0).class(), EventClass::Metric);
        assert_eq!(
            Observation::connection(ConnectionKind::Connected, "u", "s").class(),
            EventClass::Connection
        );
        assert_eq!(
            Observation::system(SystemKind::Started, "").class(),
            EventClass::System
        );
    }

    #[test]
    fn observations_serialize_round_trip() {
        let obs = Observation::connection(ConnectionKind::Stale, "42", "sess-1");
        let json = serde_json::to_string(&obs).unwrap();
        let back: Observation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.class(), EventClass::Connection);
    }
}
