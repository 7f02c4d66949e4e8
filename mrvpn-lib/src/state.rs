use serde::{Deserialize, Serialize};

use std::fmt::{self, Display};
use std::sync::{Arc, RwLock};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

/// Snapshot handed to state listeners.
#[derive(Clone, Debug, PartialEq)]
pub struct StateChange {
    pub state: State,
    pub error: Option<String>,
}

/// Cumulative proxy traffic plus first-difference speeds, bytes and bytes/s.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub upload: u64,
    pub download: u64,
    pub up_speed: u64,
    pub down_speed: u64,
}

type StateListener = Arc<dyn Fn(&StateChange) + Send + Sync>;
type StatsListener = Arc<dyn Fn(&TrafficStats) + Send + Sync>;

/// Canonical connection state with listener fan-out. Listeners are invoked
/// from snapshot copies after the lock is released; they may read the
/// machine but must not transition it re-entrantly.
#[derive(Default)]
pub struct StateMachine {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    state: State,
    last_error: Option<String>,
    state_listeners: Vec<StateListener>,
    stats_listeners: Vec<StatsListener>,
}

impl StateMachine {
    pub fn new() -> Self {
        StateMachine::default()
    }

    pub fn set_state(&self, state: State, error: Option<String>) {
        let (change, listeners) = {
            let mut inner = self.inner.write().expect("state machine lock poisoned");
            inner.state = state;
            inner.last_error = error.clone();
            (StateChange { state, error }, inner.state_listeners.clone())
        };
        tracing::debug!(state = %change.state, "state changed");
        for listener in listeners {
            listener(&change);
        }
    }

    pub fn notify_stats(&self, stats: TrafficStats) {
        let listeners = {
            let inner = self.inner.read().expect("state machine lock poisoned");
            inner.stats_listeners.clone()
        };
        for listener in listeners {
            listener(&stats);
        }
    }

    pub fn on_state_change(&self, listener: impl Fn(&StateChange) + Send + Sync + 'static) {
        let mut inner = self.inner.write().expect("state machine lock poisoned");
        inner.state_listeners.push(Arc::new(listener));
    }

    pub fn on_stats(&self, listener: impl Fn(&TrafficStats) + Send + Sync + 'static) {
        let mut inner = self.inner.write().expect("state machine lock poisoned");
        inner.stats_listeners.push(Arc::new(listener));
    }

    pub fn state(&self) -> State {
        self.inner.read().expect("state machine lock poisoned").state
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.read().expect("state machine lock poisoned").last_error.clone()
    }
}

impl Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Disconnected => write!(f, "disconnected"),
            State::Connecting => write!(f, "connecting"),
            State::Connected => write!(f, "connected"),
            State::Disconnecting => write!(f, "disconnecting"),
            State::Error => write!(f, "error"),
        }
    }
}
