//! Cron scheduler with single-leader election.
//!
//! Any number of scheduler instances may run; the TTL-bound leader key
//! guarantees at most one of them fires cron timers at a time. The
//! leader keeps the key alive by extending its TTL on every election
//! tick; losing the key stops the timers until the next acquisition.
//! Becoming leader also replays at most one missed firing per scheduled
//! function.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::{now_millis, CronExecution, Event};
use crate::executor::{Client, EventBus, Handler, WorchEvent};
use crate::storage::{DocStore, KeySpace, KvStore};

use super::cron;
use super::error::{Result, ScheduleError};

/// Scheduler tuning knobs; the defaults match the engine's contract
/// (election on, 60 s leadership TTL, 30 s election tick).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub leader_election: bool,
    pub leader_ttl: Duration,
    pub leader_check_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            leader_election: true,
            leader_ttl: Duration::from_secs(60),
            leader_check_interval: Duration::from_secs(30),
        }
    }
}

/// One cron-bearing handler, validated at construction.
struct ScheduledFunction {
    function_id: String,
    expression: String,
    schedule: ::cron::Schedule,
}

struct SchedulerCore {
    client: Arc<Client>,
    kv: Arc<dyn KvStore>,
    doc: Arc<dyn DocStore>,
    keys: KeySpace,
    bus: EventBus,
    functions: Vec<Arc<ScheduledFunction>>,
}

impl SchedulerCore {
    /// Fires one scheduled function: submit through the client, stamp the
    /// cron bookkeeping, announce the trigger.
    async fn fire(&self, function: &ScheduledFunction, is_missed: bool) {
        let now = now_millis();
        let event = Event::new(function.function_id.clone(), json!({}));

        let execution_id = match self.client.submit(event).await {
            Ok(id) => id,
            Err(e) => {
                error!(
                    "scheduled submit failed for {}: {}",
                    function.function_id, e
                );
                self.bus.emit(WorchEvent::Error {
                    message: format!("scheduled submit failed for {}: {}", function.function_id, e),
                });
                return;
            }
        };

        let next_scheduled_time = cron::next_fire(&function.schedule, Utc::now())
            .map(|next| next.timestamp_millis())
            .unwrap_or(now);
        let record = CronExecution {
            function_id: function.function_id.clone(),
            last_execution_time: now,
            next_scheduled_time,
            cron_expression: function.expression.clone(),
            updated_at: now,
        };
        if let Err(e) = self.doc.upsert_cron_execution(&record).await {
            warn!(
                "failed to stamp cron execution for {}: {}",
                function.function_id, e
            );
        }

        info!(
            "schedule fired: function={} execution={} missed={}",
            function.function_id, execution_id, is_missed
        );
        self.bus.emit(WorchEvent::ScheduleTriggered {
            function_id: function.function_id.clone(),
            execution_id,
            timestamp: now,
            is_missed,
        });
    }

    /// One catch-up pass, run once per leadership acquisition.
    ///
    /// Conservative by design: a single missed firing is replayed per
    /// function no matter how long the outage was, and only when the
    /// seconds-field interval estimate says a period definitely elapsed.
    async fn replay_missed(&self) {
        for function in &self.functions {
            let record = match self.doc.find_cron_execution(&function.function_id).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(
                        "missed-run lookup failed for {}: {}",
                        function.function_id, e
                    );
                    continue;
                }
            };
            let Some(record) = record else {
                // Never fired; the regular timer will handle it.
                continue;
            };
            if cron::should_have_run(
                &function.expression,
                record.last_execution_time,
                now_millis(),
            ) {
                info!("replaying missed execution for {}", function.function_id);
                self.bus.emit(WorchEvent::ScheduleMissed {
                    function_id: function.function_id.clone(),
                });
                self.fire(function, true).await;
            }
        }
    }
}

/// The cron scheduler; see the module docs.
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    config: SchedulerConfig,
    instance_id: String,
    running: AtomicBool,
    is_leader: Arc<AtomicBool>,
    cancel: CancellationToken,
    timer_token: tokio::sync::Mutex<Option<CancellationToken>>,
    election_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Builds a scheduler over the cron-bearing subset of `handlers`.
    ///
    /// Every expression is validated here; a scheduler that cannot fire
    /// all of its functions refuses to exist.
    pub fn new(
        client: Arc<Client>,
        kv: Arc<dyn KvStore>,
        doc: Arc<dyn DocStore>,
        handlers: &[Handler],
        queue_prefix: &str,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let mut functions = Vec::new();
        for handler in handlers {
            if let Some(expression) = handler.cron() {
                let schedule = cron::parse(expression)?;
                functions.push(Arc::new(ScheduledFunction {
                    function_id: handler.id().to_string(),
                    expression: expression.to_string(),
                    schedule,
                }));
            }
        }
        if functions.is_empty() {
            return Err(ScheduleError::NoScheduledHandlers);
        }

        Ok(Self {
            core: Arc::new(SchedulerCore {
                client,
                kv,
                doc,
                keys: KeySpace::new(queue_prefix),
                bus: EventBus::new(),
                functions,
            }),
            config,
            instance_id: Uuid::new_v4().simple().to_string(),
            running: AtomicBool::new(false),
            is_leader: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            timer_token: tokio::sync::Mutex::new(None),
            election_handle: tokio::sync::Mutex::new(None),
        })
    }

    /// Replaces the bus so scheduler events land on a shared one.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        // Arc::get_mut is safe here: nothing else holds the core before start().
        Arc::get_mut(&mut self.core)
            .expect("scheduler core uniquely owned before start")
            .bus = bus;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.core.bus
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ScheduleError::AlreadyRunning);
        }

        for function in &self.core.functions {
            self.core.bus.emit(WorchEvent::ScheduleRegistered {
                function_id: function.function_id.clone(),
            });
        }

        if !self.config.leader_election {
            // Single-instance mode: schedule unconditionally, no leader key.
            self.is_leader.store(true, Ordering::SeqCst);
            let token = self.cancel.child_token();
            start_timers(&self.core, &token);
            *self.timer_token.lock().await = Some(token);
            self.core.replay_missed().await;
            return Ok(());
        }

        let core = Arc::clone(&self.core);
        let config = self.config.clone();
        let instance_id = self.instance_id.clone();
        let is_leader = Arc::clone(&self.is_leader);
        let cancel = self.cancel.clone();
        let timer_slot = TimerSlot {
            core: Arc::clone(&self.core),
            token: Arc::new(tokio::sync::Mutex::new(None)),
        };
        // The election loop owns timer lifecycle from here on.
        *self.timer_token.lock().await = None;

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(config.leader_check_interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticks.tick() => {
                        election_tick(&core, &config, &instance_id, &is_leader, &timer_slot).await;
                    }
                }
            }
            // Leaving the loop tears the timers down with the child token.
            timer_slot.stop().await;
        });
        *self.election_handle.lock().await = Some(handle);
        info!("scheduler started (instance {})", self.instance_id);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(ScheduleError::NotRunning);
        }
        self.cancel.cancel();

        if let Some(handle) = self.election_handle.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(token) = self.timer_token.lock().await.take() {
            token.cancel();
        }

        if self.is_leader.swap(false, Ordering::SeqCst) && self.config.leader_election {
            if let Err(e) = self.core.kv.delete(&self.core.keys.leader()).await {
                warn!("failed to release leader key: {}", e);
            }
        }
        self.core.bus.emit(WorchEvent::Stopped);
        info!("scheduler stopped (instance {})", self.instance_id);
        Ok(())
    }
}

/// The per-leadership timer token, shared between election ticks.
#[derive(Clone)]
struct TimerSlot {
    core: Arc<SchedulerCore>,
    token: Arc<tokio::sync::Mutex<Option<CancellationToken>>>,
}

impl TimerSlot {
    async fn start(&self) {
        let token = CancellationToken::new();
        start_timers(&self.core, &token);
        *self.token.lock().await = Some(token);
    }

    async fn stop(&self) {
        if let Some(token) = self.token.lock().await.take() {
            token.cancel();
        }
    }
}

/// One election tick: leaders renew or concede, followers try to acquire.
async fn election_tick(
    core: &Arc<SchedulerCore>,
    config: &SchedulerConfig,
    instance_id: &str,
    is_leader: &Arc<AtomicBool>,
    timers: &TimerSlot,
) {
    let leader_key = core.keys.leader();

    if is_leader.load(Ordering::SeqCst) {
        match core.kv.remaining_ttl(&leader_key).await {
            Ok(ttl) if ttl > 0 => {
                if let Err(e) = core.kv.extend_ttl(&leader_key, config.leader_ttl).await {
                    warn!("failed to extend leadership: {}", e);
                }
            }
            Ok(_) => {
                // The key expired under us; stop scheduling immediately.
                warn!("leadership lost (key expired)");
                is_leader.store(false, Ordering::SeqCst);
                core.bus.emit(WorchEvent::LeaderLost);
                timers.stop().await;
            }
            Err(e) => {
                warn!("leadership check failed: {}", e);
            }
        }
        return;
    }

    match core
        .kv
        .set_if_absent_with_ttl(&leader_key, instance_id, config.leader_ttl)
        .await
    {
        Ok(true) => {
            info!("leadership acquired by instance {}", instance_id);
            is_leader.store(true, Ordering::SeqCst);
            core.bus.emit(WorchEvent::LeaderAcquired);
            timers.start().await;
            core.replay_missed().await;
        }
        Ok(false) => {
            debug!("leadership held elsewhere; idling");
        }
        Err(e) => {
            warn!("leadership acquisition failed: {}", e);
        }
    }
}

/// Spawns one timer task per scheduled function under `token`.
fn start_timers(core: &Arc<SchedulerCore>, token: &CancellationToken) {
    for function in &core.functions {
        let core = Arc::clone(core);
        let function = Arc::clone(function);
        let token = token.clone();
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = cron::next_fire(&function.schedule, now) else {
                    warn!("no upcoming firing for {}", function.function_id);
                    break;
                };
                let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {
                        core.fire(&function, false).await;
                    }
                }
            }
            debug!("timer for {} stopped", function.function_id);
        });
    }
}
