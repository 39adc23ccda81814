//! The state machine around the single live [`OperationalState`].
//!
//! All mutation happens under one async mutex, and an accepted change is
//! written to the cache **before** the call returns, so a caller that
//! reads immediately after an update sees its own write. Durable
//! persistence lags behind on the background loop's interval — recovery
//! therefore prefers the cache when both tiers have a snapshot.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mowos_cache::{CacheCategory, SensorCache};
use mowos_store::StateStore;
use mowos_types::{
    Checkpoint, Metadata, MowerState, OpMode, OperationalState, StateTransition,
};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::transitions::{TransitionCheck, transition_allowed};

/// Cache key of the live state snapshot (category `state`).
const CURRENT_KEY: &str = "current";

/// Recovery-map flag set by failures that need operator attention.
const UNRESOLVED_ERROR_KEY: &str = "unresolved_error";

/// Recovery-map key holding the snapshot taken by an emergency stop.
const PRE_EMERGENCY_KEY: &str = "pre_emergency_state";

// ---------------------------------------------------------------------------
// Config & update types
// ---------------------------------------------------------------------------

/// Tunables for the state machine.
#[derive(Debug, Clone)]
pub struct StateMachineConfig {
    /// Minimum battery level for [`StateMachine::can_resume_operation`].
    pub battery_resume_floor: f64,
    /// Transitions retained in the audit ring.
    pub history_capacity: usize,
    /// How often the background loop flushes state to the store.
    pub persist_interval: Duration,
    /// Transitions bundled into a checkpoint.
    pub checkpoint_transitions: usize,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            battery_resume_floor: 0.20,
            history_capacity: 100,
            persist_interval: Duration::from_secs(30),
            checkpoint_transitions: 20,
        }
    }
}

/// A partial update to the live state. Unset fields keep their value.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub state: Option<MowerState>,
    pub mode: Option<OpMode>,
    pub battery_level: Option<f64>,
    /// `Some(None)` clears the current task.
    pub current_task: Option<Option<String>>,
    pub progress: Option<f64>,
    pub estimated_completion: Option<Option<DateTime<Utc>>>,
    /// Merged into the live metadata; new keys win.
    pub metadata: Metadata,
    /// Recorded on the audit transition, if one happens.
    pub reason: Option<String>,
}

impl StateUpdate {
    /// An update requesting a transition to `state`.
    pub fn to(state: MowerState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: OpMode) -> Self {
        self.mode = Some(mode);
        self
    }

    #[must_use]
    pub fn with_battery(mut self, level: f64) -> Self {
        self.battery_level = Some(level);
        self
    }

    #[must_use]
    pub fn with_task(mut self, task: Option<String>) -> Self {
        self.current_task = Some(task);
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

// ---------------------------------------------------------------------------
// StateMachine
// ---------------------------------------------------------------------------

struct Inner {
    state: OperationalState,
    history: VecDeque<StateTransition>,
    recovery_data: Metadata,
}

/// The validated operational state machine.
///
/// Cheaply cloneable; all clones share the same live state, history ring,
/// and recovery map.
#[derive(Clone)]
pub struct StateMachine {
    cache: SensorCache,
    store: StateStore,
    config: Arc<StateMachineConfig>,
    inner: Arc<Mutex<Inner>>,
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StateMachine {
    /// Create a machine in the default `Starting` state. Call
    /// [`StateMachine::recover`] before serving callers.
    pub fn new(cache: SensorCache, store: StateStore, config: StateMachineConfig) -> Self {
        Self {
            cache,
            store,
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(Inner {
                state: OperationalState::default(),
                history: VecDeque::new(),
                recovery_data: Metadata::new(),
            })),
            shutdown: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    // -- recovery -----------------------------------------------------------

    /// Recover the last known state: cache first, then the durable store,
    /// else a fresh `Starting` snapshot with an empty battery.
    ///
    /// Never panics and never returns an error — a failure anywhere in the
    /// path degrades to `Error`/`Safety` with full diagnostics, because a
    /// controller that cannot remember where it was must not guess.
    pub async fn recover(&self) -> OperationalState {
        let cached: Option<OperationalState> =
            self.cache.get(CacheCategory::State, CURRENT_KEY).await;

        let stored = match self.store.latest().await {
            Ok(stored) => stored,
            Err(err) => {
                error!(%err, "state recovery failed, entering degraded safety state");
                return self.enter_degraded(format!("recovery failed: {err}")).await;
            }
        };

        let recovered = match (cached, stored) {
            (Some(cached), Some(stored)) => {
                if stored.last_update > cached.last_update {
                    warn!(
                        cache_ts = %cached.last_update,
                        store_ts = %stored.last_update,
                        "store snapshot is newer than cache; preferring cache per recovery policy"
                    );
                }
                cached
            }
            (Some(cached), None) => cached,
            (None, Some(stored)) => {
                debug!("no cached state, recovered from durable store");
                stored
            }
            (None, None) => {
                info!("no prior state found, initializing fresh");
                OperationalState::default()
            }
        };

        info!(state = %recovered.state, battery = recovered.battery_level, "state recovered");

        let mut inner = self.inner.lock().await;
        inner.state = recovered.clone();
        self.cache
            .put(CacheCategory::State, CURRENT_KEY, &inner.state, None)
            .await;
        recovered
    }

    async fn enter_degraded(&self, reason: String) -> OperationalState {
        let mut degraded = OperationalState::default();
        degraded.state = MowerState::Error;
        degraded.mode = OpMode::Safety;
        degraded
            .metadata
            .insert("recovery_error".to_string(), serde_json::json!(reason));

        let mut inner = self.inner.lock().await;
        inner.state = degraded.clone();
        inner
            .recovery_data
            .insert(UNRESOLVED_ERROR_KEY.to_string(), serde_json::json!(true));
        self.cache
            .put(CacheCategory::State, CURRENT_KEY, &inner.state, None)
            .await;
        degraded
    }

    // -- updates ------------------------------------------------------------

    /// Apply a partial update, validating any requested transition.
    ///
    /// Returns `false` — with zero mutation — when the requested transition
    /// is absent from the table and the source state is recognized. An
    /// unrecognized source passes with a warning: older firmware may have
    /// left the machine in a state this build cannot validate, and refusing
    /// every exit would strand it there.
    ///
    /// The cache write happens before this returns; store persistence is
    /// the background loop's job.
    pub async fn update(&self, update: StateUpdate) -> bool {
        let mut inner = self.inner.lock().await;

        let transition = match &update.state {
            Some(target) => match transition_allowed(&inner.state.state, target) {
                TransitionCheck::Allowed => inner.state.state != *target,
                TransitionCheck::UnknownSource => {
                    warn!(
                        from = %inner.state.state,
                        to = %target,
                        "permitting transition from unrecognized state"
                    );
                    true
                }
                TransitionCheck::Rejected => {
                    warn!(
                        from = %inner.state.state,
                        to = %target,
                        "transition rejected, state unchanged"
                    );
                    return false;
                }
            },
            None => false,
        };

        let now = Utc::now();
        if transition {
            let target = update.state.clone().unwrap_or(MowerState::Error);
            let record = StateTransition {
                from: inner.state.state.clone(),
                to: target.clone(),
                timestamp: now,
                reason: update.reason.clone(),
            };
            Self::push_history(&mut inner.history, record, self.config.history_capacity);
            debug!(from = %inner.state.state, to = %target, "state transition accepted");
            inner.state.state = target;
        }

        if let Some(mode) = update.mode {
            inner.state.mode = mode;
        }
        if let Some(level) = update.battery_level {
            inner.state.battery_level = level.clamp(0.0, 1.0);
        }
        if let Some(task) = update.current_task {
            inner.state.current_task = task;
        }
        if let Some(progress) = update.progress {
            inner.state.progress = progress.clamp(0.0, 1.0);
        }
        if let Some(estimated) = update.estimated_completion {
            inner.state.estimated_completion = estimated;
        }
        for (key, value) in update.metadata {
            inner.state.metadata.insert(key, value);
        }
        inner.state.last_update = now;

        // Synchronous cache write: read-your-writes for state.
        self.cache
            .put(CacheCategory::State, CURRENT_KEY, &inner.state, None)
            .await;
        true
    }

    fn push_history(
        history: &mut VecDeque<StateTransition>,
        record: StateTransition,
        capacity: usize,
    ) {
        if history.len() >= capacity {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// Force `EmergencyStop`/`Safety` from any state, no table check.
    ///
    /// The pre-stop state is snapshotted into the recovery map for the
    /// postmortem, and the unresolved-error flag blocks resumption until
    /// it is cleared.
    pub async fn emergency_stop(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        warn!(from = %inner.state.state, %reason, "emergency stop");

        let prior = inner.state.clone();
        if let Ok(snapshot) = serde_json::to_value(&prior) {
            inner
                .recovery_data
                .insert(PRE_EMERGENCY_KEY.to_string(), snapshot);
        }
        inner
            .recovery_data
            .insert(UNRESOLVED_ERROR_KEY.to_string(), serde_json::json!(true));

        let record = StateTransition {
            from: prior.state,
            to: MowerState::EmergencyStop,
            timestamp: now,
            reason: Some(reason.clone()),
        };
        Self::push_history(&mut inner.history, record, self.config.history_capacity);

        inner.state.state = MowerState::EmergencyStop;
        inner.state.mode = OpMode::Safety;
        inner.state.progress = 0.0;
        inner.state.estimated_completion = None;
        inner
            .state
            .metadata
            .insert("emergency_reason".to_string(), serde_json::json!(reason));
        inner.state.metadata.insert(
            "emergency_at".to_string(),
            serde_json::json!(now.to_rfc3339()),
        );
        inner.state.last_update = now;

        self.cache
            .put(CacheCategory::State, CURRENT_KEY, &inner.state, None)
            .await;
    }

    /// Whether normal operation may resume: parked or charging, battery
    /// above the floor, and no unresolved error.
    pub async fn can_resume_operation(&self) -> bool {
        let inner = self.inner.lock().await;
        let parked = matches!(inner.state.state, MowerState::Idle | MowerState::Charging);
        let charged = inner.state.battery_level >= self.config.battery_resume_floor;
        let unresolved = inner
            .recovery_data
            .get(UNRESOLVED_ERROR_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        parked && charged && !unresolved
    }

    /// Clear the unresolved-error flag once the operator has dealt with it.
    pub async fn clear_error(&self) {
        let mut inner = self.inner.lock().await;
        inner.recovery_data.remove(UNRESOLVED_ERROR_KEY);
    }

    // -- checkpoints --------------------------------------------------------

    /// Snapshot the live state, recovery map, and recent transitions under
    /// `name`. The bundle lives in the cache's checkpoint category and
    /// expires on that category's TTL.
    pub async fn checkpoint(&self, name: &str) -> bool {
        let inner = self.inner.lock().await;
        let transitions: Vec<StateTransition> = inner
            .history
            .iter()
            .rev()
            .take(self.config.checkpoint_transitions)
            .rev()
            .cloned()
            .collect();
        let bundle = Checkpoint {
            name: name.to_string(),
            created_at: Utc::now(),
            state: inner.state.clone(),
            recovery_data: inner.recovery_data.clone(),
            transitions,
        };
        drop(inner);

        let stored = self
            .cache
            .put(CacheCategory::Checkpoint, name, &bundle, None)
            .await;
        if stored {
            info!(checkpoint = name, "checkpoint created");
        }
        stored
    }

    /// Replace the live state and recovery map with a checkpoint's bundle.
    ///
    /// A synthetic `checkpoint_restore` transition is appended so the audit
    /// ring shows the rollback.
    pub async fn restore(&self, name: &str) -> crate::StateResult<OperationalState> {
        let bundle: Checkpoint = self
            .cache
            .get(CacheCategory::Checkpoint, name)
            .await
            .ok_or_else(|| crate::StateError::CheckpointNotFound {
                name: name.to_string(),
            })?;

        let mut inner = self.inner.lock().await;
        let record = StateTransition {
            from: inner.state.state.clone(),
            to: bundle.state.state.clone(),
            timestamp: Utc::now(),
            reason: Some(format!("checkpoint_restore:{name}")),
        };
        Self::push_history(&mut inner.history, record, self.config.history_capacity);

        inner.state = bundle.state.clone();
        inner.recovery_data = bundle.recovery_data.clone();
        self.cache
            .put(CacheCategory::State, CURRENT_KEY, &inner.state, None)
            .await;

        info!(checkpoint = name, state = %bundle.state.state, "checkpoint restored");
        Ok(bundle.state)
    }

    // -- accessors ----------------------------------------------------------

    /// A copy of the live state.
    pub async fn current_state(&self) -> OperationalState {
        self.inner.lock().await.state.clone()
    }

    /// The audit ring, oldest first.
    pub async fn history(&self) -> Vec<StateTransition> {
        self.inner.lock().await.history.iter().cloned().collect()
    }

    /// A copy of the recovery map.
    pub async fn recovery_data(&self) -> Metadata {
        self.inner.lock().await.recovery_data.clone()
    }

    /// Insert an entry into the recovery map.
    pub async fn set_recovery_entry(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.lock().await.recovery_data.insert(key.into(), value);
    }

    // -- persistence loop ---------------------------------------------------

    /// Flush the live state to the durable store and refresh the cache TTL.
    ///
    /// Store failures are logged and retried on the next tick; durable
    /// state trails the cache by at most one interval.
    pub async fn flush(&self) {
        let state = self.current_state().await;
        if let Err(err) = self.store.insert(&state).await {
            warn!(%err, "state flush to store failed, will retry next interval");
        }
        self.cache
            .put(CacheCategory::State, CURRENT_KEY, &state, None)
            .await;
    }

    /// Spawn the background persistence loop.
    ///
    /// The loop suspends only on its own timer, performs one final flush on
    /// shutdown, and is joined via the returned handle.
    pub fn spawn_persistence_loop(&self) -> JoinHandle<()> {
        let machine = self.clone();
        tokio::spawn(async move {
            info!(
                interval_secs = machine.config.persist_interval.as_secs(),
                "state persistence loop started"
            );
            let mut interval = tokio::time::interval(machine.config.persist_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => machine.flush().await,
                    _ = machine.notify.notified() => {
                        if machine.shutdown.load(Ordering::Acquire) {
                            break;
                        }
                    }
                }
            }
            machine.flush().await;
            info!("state persistence loop stopped");
        })
    }

    /// Signal the persistence loop to stop after a final flush.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use mowos_cache::CacheConfig;
    use mowos_store::Database;

    async fn setup() -> StateMachine {
        let cache = SensorCache::new(CacheConfig::default()).unwrap();
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        StateMachine::new(cache, StateStore::new(db), StateMachineConfig::default())
    }

    async fn setup_idle() -> StateMachine {
        let machine = setup().await;
        machine.recover().await;
        assert!(machine.update(StateUpdate::to(MowerState::Idle)).await);
        machine
    }

    #[tokio::test]
    async fn fresh_recovery_initializes_starting() {
        let machine = setup().await;
        let state = machine.recover().await;
        assert_eq!(state.state, MowerState::Starting);
        assert_eq!(state.battery_level, 0.0);
    }

    #[tokio::test]
    async fn accepted_sequence_lands_on_last_transition() {
        let machine = setup_idle().await;

        assert!(
            machine
                .update(StateUpdate::to(MowerState::Active).with_battery(0.95))
                .await
        );
        assert!(
            machine
                .update(StateUpdate::to(MowerState::Charging).with_battery(0.75))
                .await
        );

        let state = machine.current_state().await;
        assert_eq!(state.state, MowerState::Charging);
        assert!((state.battery_level - 0.75).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn rejected_transition_mutates_nothing() {
        let machine = setup_idle().await;
        machine
            .update(
                StateUpdate::to(MowerState::Active)
                    .with_battery(0.9)
                    .with_task(Some("zone_a".into())),
            )
            .await;
        assert!(machine.update(StateUpdate::to(MowerState::Navigating)).await);

        let before_state = serde_json::to_string(&machine.current_state().await).unwrap();
        let before_history = serde_json::to_string(&machine.history().await).unwrap();

        // Navigating -> Charging is not in the table.
        let mut rejected = StateUpdate::to(MowerState::Charging).with_battery(0.1);
        rejected
            .metadata
            .insert("should_not_appear".to_string(), serde_json::json!(true));
        assert!(!machine.update(rejected).await);

        let after_state = serde_json::to_string(&machine.current_state().await).unwrap();
        let after_history = serde_json::to_string(&machine.history().await).unwrap();
        assert_eq!(before_state, after_state);
        assert_eq!(before_history, after_history);
        assert_eq!(machine.current_state().await.state, MowerState::Navigating);
    }

    #[tokio::test]
    async fn unknown_source_state_passes_with_warning() {
        let machine = setup().await;
        {
            // Simulate recovery from an older firmware's state string.
            let mut inner = machine.inner.lock().await;
            inner.state.state = MowerState::Unknown("legacy_docking".to_string());
        }
        assert!(machine.update(StateUpdate::to(MowerState::Idle)).await);
        assert_eq!(machine.current_state().await.state, MowerState::Idle);
    }

    #[tokio::test]
    async fn metadata_merge_new_keys_win() {
        let machine = setup_idle().await;

        let mut first = StateUpdate::default();
        first
            .metadata
            .insert("zone".to_string(), serde_json::json!("a"));
        first
            .metadata
            .insert("pass".to_string(), serde_json::json!(1));
        machine.update(first).await;

        let mut second = StateUpdate::default();
        second
            .metadata
            .insert("zone".to_string(), serde_json::json!("b"));
        machine.update(second).await;

        let state = machine.current_state().await;
        assert_eq!(state.metadata["zone"], serde_json::json!("b"));
        assert_eq!(state.metadata["pass"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn battery_and_progress_are_clamped() {
        let machine = setup_idle().await;
        machine
            .update(StateUpdate::default().with_battery(1.8).with_progress(-0.3))
            .await;
        let state = machine.current_state().await;
        assert_eq!(state.battery_level, 1.0);
        assert_eq!(state.progress, 0.0);
    }

    #[tokio::test]
    async fn history_ring_is_bounded() {
        let cache = SensorCache::new(CacheConfig::default()).unwrap();
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let machine = StateMachine::new(
            cache,
            StateStore::new(db),
            StateMachineConfig {
                history_capacity: 4,
                ..StateMachineConfig::default()
            },
        );
        machine.recover().await;
        machine.update(StateUpdate::to(MowerState::Idle)).await;

        for _ in 0..3 {
            machine.update(StateUpdate::to(MowerState::Active)).await;
            machine.update(StateUpdate::to(MowerState::Idle)).await;
        }

        let history = machine.history().await;
        assert_eq!(history.len(), 4);
        // The ring keeps the most recent transitions.
        assert_eq!(history.last().unwrap().to, MowerState::Idle);
    }

    #[tokio::test]
    async fn emergency_stop_succeeds_from_any_state() {
        for target in [MowerState::Idle, MowerState::Active, MowerState::ShuttingDown] {
            let machine = setup_idle().await;
            if target != MowerState::Idle {
                machine.update(StateUpdate::to(target.clone())).await;
            }

            machine.emergency_stop("obstacle detected").await;
            let state = machine.current_state().await;
            assert_eq!(state.state, MowerState::EmergencyStop);
            assert_eq!(state.mode, OpMode::Safety);
            assert_eq!(
                state.metadata["emergency_reason"],
                serde_json::json!("obstacle detected")
            );
            assert!(!machine.can_resume_operation().await);

            let recovery = machine.recovery_data().await;
            assert!(recovery.contains_key("pre_emergency_state"));
        }
    }

    #[tokio::test]
    async fn can_resume_requires_parked_charged_and_clear() {
        let machine = setup_idle().await;

        // Idle but empty battery.
        assert!(!machine.can_resume_operation().await);

        machine.update(StateUpdate::default().with_battery(0.5)).await;
        assert!(machine.can_resume_operation().await);

        // Below the floor.
        machine.update(StateUpdate::default().with_battery(0.1)).await;
        assert!(!machine.can_resume_operation().await);

        // Unresolved error blocks resumption even when parked and charged.
        machine.update(StateUpdate::default().with_battery(0.9)).await;
        machine
            .set_recovery_entry("unresolved_error", serde_json::json!(true))
            .await;
        assert!(!machine.can_resume_operation().await);
        machine.clear_error().await;
        assert!(machine.can_resume_operation().await);
    }

    #[tokio::test]
    async fn checkpoint_restore_reproduces_snapshot() {
        let machine = setup_idle().await;
        machine
            .update(
                StateUpdate::to(MowerState::Active)
                    .with_battery(0.8)
                    .with_task(Some("zone_a".into())),
            )
            .await;
        machine
            .set_recovery_entry("waypoint", serde_json::json!([3.5, 7.25]))
            .await;

        assert!(machine.checkpoint("before_navigating").await);
        let snapshot = machine.current_state().await;
        let snapshot_recovery = machine.recovery_data().await;

        // Intervening updates.
        machine.update(StateUpdate::to(MowerState::Navigating)).await;
        machine
            .update(StateUpdate::default().with_battery(0.4))
            .await;
        machine
            .set_recovery_entry("waypoint", serde_json::json!([9.0, 9.0]))
            .await;

        let restored = machine.restore("before_navigating").await.unwrap();
        assert_eq!(restored.state, MowerState::Active);
        assert_eq!(
            serde_json::to_string(&machine.current_state().await).unwrap(),
            serde_json::to_string(&snapshot).unwrap()
        );
        assert_eq!(machine.recovery_data().await, snapshot_recovery);

        // The rollback shows up in the audit ring.
        let history = machine.history().await;
        let last = history.last().unwrap();
        assert_eq!(last.to, MowerState::Active);
        assert!(
            last.reason
                .as_deref()
                .unwrap()
                .starts_with("checkpoint_restore")
        );
    }

    #[tokio::test]
    async fn restore_missing_checkpoint_errors() {
        let machine = setup_idle().await;
        let result = machine.restore("never_created").await;
        assert!(matches!(
            result,
            Err(crate::StateError::CheckpointNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn recovery_prefers_cache_over_store() {
        let cache = SensorCache::new(CacheConfig::default()).unwrap();
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let store = StateStore::new(db);

        // Durable snapshot says Charging; cache says Active and is what the
        // machine wrote last.
        let mut stored = OperationalState::default();
        stored.state = MowerState::Charging;
        store.insert(&stored).await.unwrap();

        let mut cached = OperationalState::default();
        cached.state = MowerState::Active;
        cache
            .put(CacheCategory::State, CURRENT_KEY, &cached, None)
            .await;

        let machine = StateMachine::new(cache, store, StateMachineConfig::default());
        let recovered = machine.recover().await;
        assert_eq!(recovered.state, MowerState::Active);
    }

    #[tokio::test]
    async fn recovery_falls_back_to_store() {
        let cache = SensorCache::new(CacheConfig::default()).unwrap();
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let store = StateStore::new(db);

        let mut stored = OperationalState::default();
        stored.state = MowerState::Charging;
        stored.battery_level = 0.6;
        store.insert(&stored).await.unwrap();

        let machine = StateMachine::new(cache, store, StateMachineConfig::default());
        let recovered = machine.recover().await;
        assert_eq!(recovered.state, MowerState::Charging);
        assert!((recovered.battery_level - 0.6).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn broken_store_degrades_to_safety_instead_of_crashing() {
        let cache = SensorCache::new(CacheConfig::default()).unwrap();
        // No migrations: the states table does not exist, so recovery's
        // store read fails.
        let db = Database::open_in_memory().unwrap();
        let machine = StateMachine::new(cache, StateStore::new(db), StateMachineConfig::default());

        let recovered = machine.recover().await;
        assert_eq!(recovered.state, MowerState::Error);
        assert_eq!(recovered.mode, OpMode::Safety);
        assert!(recovered.metadata.contains_key("recovery_error"));
        assert!(!machine.can_resume_operation().await);
    }

    #[tokio::test]
    async fn persistence_loop_flushes_and_drains_on_shutdown() {
        let cache = SensorCache::new(CacheConfig::default()).unwrap();
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let store = StateStore::new(db);
        let machine = StateMachine::new(
            cache,
            store.clone(),
            StateMachineConfig {
                persist_interval: Duration::from_millis(20),
                ..StateMachineConfig::default()
            },
        );
        machine.recover().await;
        machine.update(StateUpdate::to(MowerState::Idle)).await;

        let handle = machine.spawn_persistence_loop();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(store.latest().await.unwrap().is_some());

        // A change right before shutdown still reaches the store via the
        // final flush.
        machine.update(StateUpdate::to(MowerState::Charging)).await;
        machine.shutdown();
        handle.await.unwrap();

        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.state, MowerState::Charging);
    }
}
