//! Instance registry and reconnection state machine
//!
//! One [`InstanceHandle`] per configured backend, keyed by instance id.
//! The whole set is rebuilt on configuration reload: old handles are
//! shut down (timers cleared, sessions closed) before the new map is
//! swapped in, so readers never observe a half-rebuilt registry.

use crate::adapter::{AdapterFactory, BackendAdapter};
use crate::error::SeedhubError;
use crate::sequencer::RequestSequencer;
use chrono::{DateTime, Utc};
use seedhub_types::{
    ClientInstance, ClientKind, ConnectionState, CoreEvent, InstanceConfig, InstanceStatus,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

/// Connection bookkeeping for one instance
struct ConnState {
    state: ConnectionState,
    last_error: Option<String>,
    last_error_time: Option<DateTime<Utc>>,
}

/// One configured backend instance: its adapter, its request sequencer
/// and its connection state machine.
pub struct InstanceHandle {
    config: InstanceConfig,
    adapter: Arc<dyn BackendAdapter>,
    sequencer: RequestSequencer,
    conn: parking_lot::RwLock<ConnState>,
    /// At most one reconnect timer per instance; scheduling while a
    /// timer is live is a no-op
    reconnect_timer: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    reconnect_delay: Duration,
    /// Set once by `shutdown()`. A timer task that already fired and
    /// vacated its slot must not reopen the retired session.
    closed: AtomicBool,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl InstanceHandle {
    fn new(
        config: InstanceConfig,
        adapter: Arc<dyn BackendAdapter>,
        reconnect_delay: Duration,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Arc<Self> {
        let sequencer = RequestSequencer::new(&config.id);
        Arc::new(Self {
            config,
            adapter,
            sequencer,
            conn: parking_lot::RwLock::new(ConnState {
                state: ConnectionState::Disconnected,
                last_error: None,
                last_error_time: None,
            }),
            reconnect_timer: parking_lot::Mutex::new(None),
            reconnect_delay,
            closed: AtomicBool::new(false),
            event_tx,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn kind(&self) -> ClientKind {
        self.config.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn adapter(&self) -> &Arc<dyn BackendAdapter> {
        &self.adapter
    }

    pub fn sequencer(&self) -> &RequestSequencer {
        &self.sequencer
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.conn.read().state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Runtime view of this instance for diagnostics and snapshots
    pub fn status(&self) -> InstanceStatus {
        let conn = self.conn.read();
        InstanceStatus {
            id: self.config.id.clone(),
            kind: self.config.kind,
            display_name: self.config.display_name.clone(),
            enabled: self.config.enabled,
            connection_state: conn.state,
            last_error: conn.last_error.clone(),
            last_error_time: conn.last_error_time,
            pending_requests: self.sequencer.pending_count(),
            last_fetch_error: None,
        }
    }

    pub fn client_instance(&self) -> ClientInstance {
        let conn = self.conn.read();
        ClientInstance {
            id: self.config.id.clone(),
            kind: self.config.kind,
            display_name: self.config.display_name.clone(),
            enabled: self.config.enabled,
            connection_state: conn.state,
            last_error: conn.last_error.clone(),
            last_error_time: conn.last_error_time,
        }
    }

    fn set_state(&self, state: ConnectionState, error: Option<String>) {
        {
            let mut conn = self.conn.write();
            conn.state = state;
            if let Some(message) = &error {
                conn.last_error = Some(message.clone());
                conn.last_error_time = Some(Utc::now());
            }
        }
        let _ = self.event_tx.send(CoreEvent::InstanceStateChanged {
            id: self.config.id.clone(),
            state,
            error,
        });
    }

    /// Connect this instance through its sequencer.
    ///
    /// Idempotent: a no-op while already connecting or connected. On
    /// failure the error is recorded on the instance and a single
    /// reconnect timer is scheduled; the error never propagates.
    pub async fn connect(self: &Arc<Self>) {
        if !self.config.enabled || self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let conn = self.conn.read();
            if matches!(
                conn.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                return;
            }
        }

        self.set_state(ConnectionState::Connecting, None);
        info!("Connecting instance {}", self.config.id);

        let adapter = self.adapter.clone();
        let result = self.sequencer.run(async move { adapter.connect().await }).await;

        match result {
            Ok(()) => {
                info!("Instance {} connected", self.config.id);
                self.set_state(ConnectionState::Connected, None);
            }
            Err(e) => {
                warn!("Instance {} failed to connect: {}", self.config.id, e);
                self.set_state(ConnectionState::Disconnected, Some(e.to_string()));
                self.schedule_reconnect();
            }
        }
    }

    /// Schedule a reconnect attempt after the configured delay.
    ///
    /// Idempotent while a timer is live, so repeated failures cannot
    /// leak timers or spawn duplicate reconnect loops.
    pub fn schedule_reconnect(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut timer = self.reconnect_timer.lock();
        if let Some(handle) = timer.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        self.set_state(ConnectionState::ReconnectScheduled, None);
        let handle = self.clone();
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(handle.reconnect_delay).await;
            // Release the timer slot before attempting, so a failed
            // attempt can schedule the next one
            *handle.reconnect_timer.lock() = None;
            handle.connect().await;
        }));
    }

    /// Tear this instance down: clear any reconnect timer and close the
    /// backend session. Used during registry rebuild and shutdown.
    pub async fn shutdown(&self) {
        // Marked before the timer check: a timer that fired and emptied
        // its slot already sees the handle as retired
        self.closed.store(true, Ordering::Release);
        if let Some(timer) = self.reconnect_timer.lock().take() {
            timer.abort();
        }
        if let Err(e) = self.adapter.disconnect().await {
            warn!("Instance {} disconnect failed: {}", self.config.id, e);
        }
        self.conn.write().state = ConnectionState::Disconnected;
    }
}

/// Holds one handle per configured instance.
///
/// Read-many/write-rare: writes only happen during wholesale rebuild on
/// configuration reload.
pub struct InstanceRegistry {
    instances: RwLock<HashMap<String, Arc<InstanceHandle>>>,
    factory: Arc<dyn AdapterFactory>,
    reconnect_delay: parking_lot::RwLock<Duration>,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl InstanceRegistry {
    pub fn new(
        factory: Arc<dyn AdapterFactory>,
        reconnect_delay: Duration,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            factory,
            reconnect_delay: parking_lot::RwLock::new(reconnect_delay),
            event_tx,
        }
    }

    /// Change the delay applied to handles built by subsequent rebuilds
    pub fn set_reconnect_delay(&self, delay: Duration) {
        *self.reconnect_delay.write() = delay;
    }

    /// Replace the whole instance set from configuration.
    ///
    /// New handles are constructed first; if any adapter fails to build
    /// the current registry is left untouched. Old handles are shut down
    /// before the swap so no timer or session outlives its config.
    pub async fn rebuild(&self, configs: &[InstanceConfig]) -> Result<(), SeedhubError> {
        let reconnect_delay = *self.reconnect_delay.read();
        let mut fresh = HashMap::new();
        for config in configs {
            if fresh.contains_key(&config.id) {
                return Err(SeedhubError::Validation(format!(
                    "Duplicate instance id: {}",
                    config.id
                )));
            }
            let adapter = self.factory.build(config)?;
            let handle = InstanceHandle::new(
                config.clone(),
                adapter,
                reconnect_delay,
                self.event_tx.clone(),
            );
            fresh.insert(config.id.clone(), handle);
        }

        let old = {
            let mut instances = self.instances.write().await;
            std::mem::replace(&mut *instances, fresh)
        };

        for (_, handle) in old {
            handle.shutdown().await;
        }

        info!("Registry rebuilt with {} instances", configs.len());
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<InstanceHandle>> {
        self.instances.read().await.get(id).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<InstanceHandle>> {
        self.instances.read().await.values().cloned().collect()
    }

    /// Enabled instances only; the aggregation loop and swarm refresh
    /// operate on this set
    pub async fn enabled(&self) -> Vec<Arc<InstanceHandle>> {
        self.instances
            .read()
            .await
            .values()
            .filter(|h| h.is_enabled())
            .cloned()
            .collect()
    }

    /// Enabled instances that currently hold a live session
    pub async fn connected(&self) -> Vec<Arc<InstanceHandle>> {
        self.instances
            .read()
            .await
            .values()
            .filter(|h| h.is_enabled() && h.is_connected())
            .cloned()
            .collect()
    }

    /// Connect every enabled instance concurrently
    pub async fn connect_enabled(&self) {
        let handles = self.enabled().await;
        let connects = handles.iter().map(|h| h.connect());
        futures::future::join_all(connects).await;
    }

    /// Shut down every instance (timers cleared, sessions closed)
    pub async fn shutdown(&self) {
        let handles = self.all().await;
        for handle in handles {
            handle.shutdown().await;
        }
    }
}
