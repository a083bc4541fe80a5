use std::time::{Duration, SystemTime};

use gproxy_km_config::KeySelectionStrategy;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

pub type KeyId = usize;

#[derive(Debug, Clone, Copy)]
enum KeyState {
    Active,
    Cooling { until: Instant },
}

#[derive(Debug, Clone)]
pub struct KeyManagerOptions {
    pub use_last: bool,
    pub cooldown_default: Duration,
    pub strategy: KeySelectionStrategy,
}

/// Returned when every key is currently cooling.
#[derive(Debug, Clone, Copy)]
pub struct AllKeysCooling {
    pub wait: Duration,
}

struct Inner {
    states: Vec<KeyState>,
    cursor: usize,
    last_selected: Option<KeyId>,
}

/// Owns the pool of upstream keys and their cooldown deadlines.
///
/// All operations take the single lock for their whole duration; no I/O
/// happens while it is held, so contention is bounded by the number of keys.
pub struct KeyManager {
    keys: Vec<String>,
    opts: KeyManagerOptions,
    inner: Mutex<Inner>,
}

impl KeyManager {
    pub fn new(keys: Vec<String>, opts: KeyManagerOptions) -> Self {
        let n = keys.len();
        let inner = Inner {
            states: vec![KeyState::Active; n],
            cursor: 0,
            last_selected: None,
        };
        Self {
            keys,
            opts,
            inner: Mutex::new(inner),
        }
    }

    pub fn key_value(&self, id: KeyId) -> &str {
        &self.keys[id]
    }

    pub async fn acquire(&self) -> Result<KeyId, AllKeysCooling> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        sweep(&mut inner.states, now);

        let available: Vec<KeyId> = inner
            .states
            .iter()
            .enumerate()
            .filter(|(_, state)| matches!(state, KeyState::Active))
            .map(|(id, _)| id)
            .collect();

        if available.is_empty() {
            let soonest = inner
                .states
                .iter()
                .filter_map(|state| match state {
                    KeyState::Cooling { until } => Some(*until),
                    KeyState::Active => None,
                })
                .min()
                .unwrap_or(now);
            let wait = soonest.saturating_duration_since(now);
            return Err(AllKeysCooling { wait });
        }

        let chosen = if self.opts.use_last
            && inner
                .last_selected
                .is_some_and(|id| available.contains(&id))
        {
            inner.last_selected.unwrap()
        } else {
            match self.opts.strategy {
                KeySelectionStrategy::RoundRobin => self.pick_round_robin(&mut inner),
                KeySelectionStrategy::First => available[0],
                KeySelectionStrategy::Random => {
                    available[rand::rng().random_range(0..available.len())]
                }
            }
        };

        inner.last_selected = Some(chosen);
        self.publish_metrics(&inner.states);
        info!(key = %mask_key(&self.keys[chosen]), "acquired key");
        Ok(chosen)
    }

    fn pick_round_robin(&self, inner: &mut Inner) -> KeyId {
        let n = self.keys.len();
        for step in 0..n {
            let idx = (inner.cursor + step) % n;
            if matches!(inner.states[idx], KeyState::Active) {
                inner.cursor = (idx + 1) % n;
                return idx;
            }
        }
        unreachable!("caller already verified at least one key is active")
    }

    pub async fn penalize(&self, id: KeyId, reset_hint: Option<SystemTime>) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let until = match reset_hint {
            Some(hint) => match hint.duration_since(SystemTime::now()) {
                Ok(remaining) if !remaining.is_zero() => {
                    info!(key = %mask_key(&self.keys[id]), "honoring upstream reset hint");
                    now + remaining
                }
                _ => {
                    warn!(
                        key = %mask_key(&self.keys[id]),
                        "reset hint is not in the future, falling back to default cooldown"
                    );
                    now + self.opts.cooldown_default
                }
            },
            None => {
                info!(key = %mask_key(&self.keys[id]), "cooling down with default duration");
                now + self.opts.cooldown_default
            }
        };

        inner.states[id] = KeyState::Cooling { until };
        self.publish_metrics(&inner.states);
    }

    pub async fn snapshot_counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().await;
        count_states(&inner.states)
    }

    fn publish_metrics(&self, states: &[KeyState]) {
        let (active, cooling) = count_states(states);
        metrics::gauge!("active_keys").set(active as f64);
        metrics::gauge!("cooling_keys").set(cooling as f64);
    }
}

fn sweep(states: &mut [KeyState], now: Instant) {
    for state in states.iter_mut() {
        if let KeyState::Cooling { until } = state
            && *until <= now
        {
            *state = KeyState::Active;
        }
    }
}

fn count_states(states: &[KeyState]) -> (usize, usize) {
    let cooling = states
        .iter()
        .filter(|s| matches!(s, KeyState::Cooling { .. }))
        .count();
    (states.len() - cooling, cooling)
}

/// Masks all but the first 4 and last 4 characters of a key. Keys shorter
/// than 9 characters are masked down to `***` entirely rather than partially
/// revealed through an overlapping prefix/suffix.
pub fn mask_key(key: &str) -> String {
    let len = key.chars().count();
    if len < 9 {
        return "***".to_string();
    }
    let chars: Vec<char> = key.chars().collect();
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[len - 4..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(len - 8))
}
