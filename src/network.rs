//! Network Monitor
//!
//! Tracks the current connectivity class and tells subscribers about every
//! transition. The state is written only by the connection supervisor (the
//! mutators are crate-private); everything else reads it or subscribes.
//!
//! ```text
//! unknown ──signal──> none | slow | fast
//! ```
//!
//! The coarse class is refined into a [`ConnectionQuality`], which selects
//! the [`NetworkProfile`] the query executor sizes timeouts and batches by.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::entry::CachePriority;

/// Coarse connectivity bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityClass {
    /// No signal received yet
    #[default]
    Unknown,
    None,
    Slow,
    Fast,
}

/// Physical link reported by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    None,
    #[default]
    Unknown,
}

/// Effective speed grade reported by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveSpeed {
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
    #[default]
    Unknown,
}

/// One OS connectivity callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivitySignal {
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub effective_speed: EffectiveSpeed,
    pub is_connected: bool,
    /// `None` when the OS has not probed reachability yet
    #[serde(default)]
    pub is_internet_reachable: Option<bool>,
}

impl ConnectivitySignal {
    #[must_use]
    pub fn wifi() -> Self {
        Self {
            connection_type: ConnectionType::Wifi,
            effective_speed: EffectiveSpeed::Unknown,
            is_connected: true,
            is_internet_reachable: Some(true),
        }
    }

    #[must_use]
    pub fn cellular(speed: EffectiveSpeed) -> Self {
        Self {
            connection_type: ConnectionType::Cellular,
            effective_speed: speed,
            is_connected: true,
            is_internet_reachable: Some(true),
        }
    }

    #[must_use]
    pub fn offline() -> Self {
        Self {
            connection_type: ConnectionType::None,
            effective_speed: EffectiveSpeed::Unknown,
            is_connected: false,
            is_internet_reachable: Some(false),
        }
    }

    /// Coarse class this signal maps to
    #[must_use]
    pub fn class(&self) -> ConnectivityClass {
        if !self.is_connected
            || self.connection_type == ConnectionType::None
            || self.is_internet_reachable == Some(false)
        {
            return ConnectivityClass::None;
        }
        match (self.connection_type, self.effective_speed) {
            (ConnectionType::Wifi | ConnectionType::Ethernet, _)
            | (ConnectionType::Cellular, EffectiveSpeed::FourG) => ConnectivityClass::Fast,
            (ConnectionType::Cellular, _) => ConnectivityClass::Slow,
            (_, EffectiveSpeed::FourG) => ConnectivityClass::Fast,
            (_, EffectiveSpeed::Slow2g | EffectiveSpeed::TwoG | EffectiveSpeed::ThreeG) => {
                ConnectivityClass::Slow
            }
            _ => ConnectivityClass::Unknown,
        }
    }
}

/// Refined quality used to pick a [`NetworkProfile`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Offline,
    /// Slow link on a 2g-grade connection, the slowest class
    Poor,
    Moderate,
    Good,
    Unknown,
}

impl ConnectionQuality {
    #[must_use]
    pub fn profile(self) -> NetworkProfile {
        match self {
            Self::Good => NetworkProfile {
                timeout: Duration::from_secs(5),
                batch_size: 10,
                batch_delay: Duration::ZERO,
                prefetch: PrefetchPolicy::All,
            },
            Self::Moderate => NetworkProfile {
                timeout: Duration::from_secs(15),
                batch_size: 2,
                batch_delay: Duration::from_millis(250),
                prefetch: PrefetchPolicy::AboveLow,
            },
            Self::Poor => NetworkProfile {
                timeout: Duration::from_secs(30),
                batch_size: 1,
                batch_delay: Duration::from_millis(500),
                prefetch: PrefetchPolicy::Never,
            },
            Self::Unknown => NetworkProfile {
                timeout: Duration::from_secs(10),
                batch_size: 5,
                batch_delay: Duration::ZERO,
                prefetch: PrefetchPolicy::AboveLow,
            },
            Self::Offline => NetworkProfile {
                timeout: Duration::from_secs(10),
                batch_size: 1,
                batch_delay: Duration::ZERO,
                prefetch: PrefetchPolicy::Never,
            },
        }
    }
}

/// Which prefetches a quality admits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchPolicy {
    Never,
    AboveLow,
    All,
}

/// Timeouts and batch sizing for one connection quality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkProfile {
    pub timeout: Duration,
    pub batch_size: usize,
    /// Pause between consecutive batches
    pub batch_delay: Duration,
    pub prefetch: PrefetchPolicy,
}

impl NetworkProfile {
    #[must_use]
    pub fn allows_prefetch(&self, priority: CachePriority) -> bool {
        match self.prefetch {
            PrefetchPolicy::Never => false,
            PrefetchPolicy::AboveLow => priority > CachePriority::Low,
            PrefetchPolicy::All => true,
        }
    }
}

/// Process-wide connectivity snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub class: ConnectivityClass,
    pub connection_type: ConnectionType,
    pub effective_speed: EffectiveSpeed,
    /// Whether the backend answered the latest probe
    pub reachable: bool,
    /// Epoch millis of the latest transition
    pub last_changed_at: u64,
}

impl ConnectivityState {
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.reachable && self.class != ConnectivityClass::None
    }

    #[must_use]
    pub fn quality(&self) -> ConnectionQuality {
        if !self.is_online() {
            return ConnectionQuality::Offline;
        }
        match self.class {
            ConnectivityClass::Fast => ConnectionQuality::Good,
            ConnectivityClass::Slow => match self.effective_speed {
                EffectiveSpeed::Slow2g | EffectiveSpeed::TwoG => ConnectionQuality::Poor,
                _ => ConnectionQuality::Moderate,
            },
            ConnectivityClass::Unknown => ConnectionQuality::Unknown,
            ConnectivityClass::None => ConnectionQuality::Offline,
        }
    }

    #[must_use]
    pub fn profile(&self) -> NetworkProfile {
        self.quality().profile()
    }
}

type Listener = Arc<dyn Fn(&ConnectivityState) + Send + Sync>;

/// Connectivity tracker with synchronous subscriber notification
pub struct NetworkMonitor {
    state: RwLock<ConnectivityState>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
    transitions: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl NetworkMonitor {
    /// Start in the `unknown` class, optimistically reachable
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let state = ConnectivityState {
            class: ConnectivityClass::Unknown,
            connection_type: ConnectionType::Unknown,
            effective_speed: EffectiveSpeed::Unknown,
            reachable: true,
            last_changed_at: clock.now_millis(),
        };
        Self {
            state: RwLock::new(state),
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
            clock,
        }
    }

    #[must_use]
    pub fn current(&self) -> ConnectivityState {
        *self.state.read()
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    #[must_use]
    pub fn quality(&self) -> ConnectionQuality {
        self.current().quality()
    }

    #[must_use]
    pub fn profile(&self) -> NetworkProfile {
        self.current().profile()
    }

    /// Number of transitions since start
    #[must_use]
    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    /// Call `listener` on every transition until the handle is dropped
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&ConnectivityState) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        Subscription {
            monitor: Arc::downgrade(self),
            id,
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.listeners.lock().retain(|(listener_id, _)| *listener_id != id);
    }

    /// Apply an OS connectivity callback; returns whether the state changed
    pub(crate) fn apply_signal(&self, signal: &ConnectivitySignal) -> bool {
        let class = signal.class();
        self.transition(|state| {
            state.class = class;
            state.connection_type = signal.connection_type;
            state.effective_speed = signal.effective_speed;
            if class == ConnectivityClass::None {
                state.reachable = false;
            }
        })
    }

    /// Record the outcome of a backend probe; returns whether the state changed
    pub(crate) fn set_reachable(&self, reachable: bool) -> bool {
        self.transition(|state| state.reachable = reachable)
    }

    fn transition(&self, update: impl FnOnce(&mut ConnectivityState)) -> bool {
        let next = {
            let mut state = self.state.write();
            let mut next = *state;
            update(&mut next);
            next.last_changed_at = state.last_changed_at;
            if next == *state {
                return false;
            }
            next.last_changed_at = self.clock.now_millis();
            *state = next;
            next
        };

        self.transitions.fetch_add(1, Ordering::Relaxed);
        info!(
            class = ?next.class,
            reachable = next.reachable,
            quality = ?next.quality(),
            "Connectivity changed"
        );

        // Snapshot so listeners may subscribe or unsubscribe from inside the callback
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&next);
        }
        debug!(listeners = self.subscriber_count(), "Connectivity listeners notified");
        true
    }
}

/// Subscription handle; unsubscribes on drop
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    monitor: Weak<NetworkMonitor>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.unsubscribe(self.id);
        }
    }
}
