//! Schedule-leader election (spec §4.G). Grounded in
//! `durable::worker::pool::WorkerPool`'s poll-loop/heartbeat-loop pair, each
//! running until a `watch::Receiver<bool>` signals shutdown: here the same
//! shape drives "try to acquire the lock" and "renew it while held" instead
//! of "poll for tasks" and "report load".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dockyard_events::{DomainEvent, EventBus};
use dockyard_persistence::store::Store;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

pub const SCHEDULE_LEADER_NAMESPACE: &str = "schedule-leader";

#[derive(Debug, Clone)]
pub struct ScheduleLeaderConfig {
    pub owner_id: String,
    pub lock_ttl: Duration,
    pub acquire_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl ScheduleLeaderConfig {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            lock_ttl: Duration::from_secs(30),
            acquire_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Holds the current leadership bit. `is_leader()` is what [`crate::schedule`]
/// consults before running a materialization pass.
pub struct ScheduleLeader {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    config: ScheduleLeaderConfig,
    is_leader: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ScheduleLeader {
    pub fn new(store: Arc<dyn Store>, events: Arc<EventBus>, config: ScheduleLeaderConfig) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            store,
            events,
            config,
            is_leader: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            handle: std::sync::Mutex::new(None),
        })
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    #[instrument(skip(self))]
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut acquire_ticker = tokio::time::interval(this.config.acquire_interval);
            let mut heartbeat_ticker = tokio::time::interval(this.config.heartbeat_interval);

            loop {
                tokio::select! {
                    _ = acquire_ticker.tick(), if !this.is_leader() => {
                        this.try_acquire().await;
                    }
                    _ = heartbeat_ticker.tick(), if this.is_leader() => {
                        this.renew().await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("schedule leader loop: shutdown requested");
                        break;
                    }
                }
            }
        });

        *self.handle.lock().unwrap() = Some(handle);
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if self.is_leader.swap(false, Ordering::AcqRel) {
            let _ = self
                .store
                .release_lock(SCHEDULE_LEADER_NAMESPACE, &self.config.owner_id)
                .await;
            self.events.publish(DomainEvent::ScheduleLeaderLost {
                owner_id: self.config.owner_id.clone(),
                occurred_at: chrono::Utc::now(),
            });
        }
    }

    async fn try_acquire(&self) {
        match self
            .store
            .try_acquire_lock(
                SCHEDULE_LEADER_NAMESPACE,
                &self.config.owner_id,
                chrono::Utc::now(),
                self.config.lock_ttl,
            )
            .await
        {
            Ok(true) => {
                if !self.is_leader.swap(true, Ordering::AcqRel) {
                    info!(owner_id = %self.config.owner_id, "acquired schedule leadership");
                    self.events.publish(DomainEvent::ScheduleLeaderAcquired {
                        owner_id: self.config.owner_id.clone(),
                        occurred_at: chrono::Utc::now(),
                    });
                }
            }
            Ok(false) => {}
            Err(err) => error!(error = %err, "schedule leader lock acquisition failed"),
        }
    }

    async fn renew(&self) {
        match self
            .store
            .try_acquire_lock(
                SCHEDULE_LEADER_NAMESPACE,
                &self.config.owner_id,
                chrono::Utc::now(),
                self.config.lock_ttl,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                if self.is_leader.swap(false, Ordering::AcqRel) {
                    info!(owner_id = %self.config.owner_id, "lost schedule leadership");
                    self.events.publish(DomainEvent::ScheduleLeaderLost {
                        owner_id: self.config.owner_id.clone(),
                        occurred_at: chrono::Utc::now(),
                    });
                }
            }
            Err(err) => {
                error!(error = %err, "schedule leader heartbeat failed");
                self.is_leader.store(false, Ordering::Release);
            }
        }
    }
}
