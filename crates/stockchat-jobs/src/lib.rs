use std::sync::Arc;
use std::time::Duration;

use stockchat_agent::build_agents;
use stockchat_core::{AppContext, now_epoch_secs};
use stockchat_providers::ProviderRegistry;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum SchedulerInitError {
    #[error("job '{0}' must have a non-zero interval")]
    ZeroInterval(String),
    #[error("scheduler is already running")]
    AlreadyStarted,
    #[error("jobs cannot be added while the scheduler is running")]
    MutatedWhileRunning,
}

type JobFn = Arc<dyn Fn() + Send + Sync>;

struct JobSpec {
    name: String,
    interval: Duration,
    run: JobFn,
}

/// Fixed-interval background runner with at-least-once semantics per tick.
/// Job bodies block (map scans, provider construction), so each run is
/// dispatched to the blocking pool rather than an async worker.
#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<JobSpec>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(
        &mut self,
        name: impl Into<String>,
        interval: Duration,
        run: impl Fn() + Send + Sync + 'static,
    ) -> Result<(), SchedulerInitError> {
        let name = name.into();
        if interval.is_zero() {
            return Err(SchedulerInitError::ZeroInterval(name));
        }
        if self.is_running() {
            return Err(SchedulerInitError::MutatedWhileRunning);
        }
        self.jobs.push(JobSpec {
            name,
            interval,
            run: Arc::new(run),
        });
        Ok(())
    }

    /// Spawn one ticking task per job. Must run inside a tokio runtime.
    pub fn start(&mut self) -> Result<(), SchedulerInitError> {
        if self.is_running() {
            return Err(SchedulerInitError::AlreadyStarted);
        }
        for job in &self.jobs {
            let name = job.name.clone();
            let run = Arc::clone(&job.run);
            let interval = job.interval;
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // The first tick fires immediately; jobs should wait one
                // full interval before their first run.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let run = Arc::clone(&run);
                    let job_name = name.clone();
                    if let Err(err) = tokio::task::spawn_blocking(move || run()).await {
                        // A panicking run must not take the schedule down.
                        error!("scheduled job '{job_name}' panicked: {err}");
                    }
                }
            });
            self.handles.push(handle);
        }
        info!("scheduler started with {} job(s)", self.jobs.len());
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        info!("scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }
}

/// Drop one session's memory in both agents.
pub fn clear_session_memory(ctx: &AppContext, session_id: i64) {
    ctx.sql_agent().memory().clear_history_by_id(session_id);
    ctx.nlp_agent().memory().clear_history_by_id(session_id);
}

/// Scan the activity tracker and evict every session idle longer than the
/// timeout. Per-session work is independent; one session's trouble never
/// stops the scan. Returns how many sessions were evicted.
pub fn evict_idle_sessions(ctx: &AppContext, now_secs: i64, timeout_secs: i64) -> usize {
    let snapshot = ctx.activity().snapshot();
    let mut evicted = 0_usize;
    for (session_id, last_seen) in snapshot {
        if now_secs.saturating_sub(last_seen) > timeout_secs {
            clear_session_memory(ctx, session_id);
            ctx.activity().remove(session_id);
            info!("session {session_id} idle for over {timeout_secs}s, memory evicted");
            evicted += 1;
        }
    }
    evicted
}

/// Rebuild both agents from the current configuration, carrying the open
/// engine handle over to the new SQL agent. On any failure the previous
/// agents stay in service untouched.
pub fn rotate_models(ctx: &AppContext) {
    let registry = ProviderRegistry::with_defaults();
    let current = ctx.sql_agent();
    let Some(engine) = current.engine().cloned() else {
        error!("model rotation skipped: current SQL agent has no engine handle");
        return;
    };

    match build_agents(ctx.config(), &registry, engine) {
        Ok((sql_agent, nlp_agent)) => {
            ctx.replace_agents(sql_agent, nlp_agent);
            info!("agents rebuilt from configuration");
        }
        Err(err) => {
            error!("model rotation failed, previous agents stay in service: {err}");
        }
    }
}

/// Register the two maintenance jobs with their configured intervals.
pub fn install_jobs(
    scheduler: &mut Scheduler,
    ctx: Arc<AppContext>,
) -> Result<(), SchedulerInitError> {
    let memory = ctx.config().memory.clone();
    let timeout_secs = memory.timeout_seconds as i64;

    let reaper_ctx = Arc::clone(&ctx);
    scheduler.schedule(
        "session-reaper",
        Duration::from_secs(memory.reaper_interval_seconds),
        move || {
            evict_idle_sessions(&reaper_ctx, now_epoch_secs(), timeout_secs);
        },
    )?;

    let rotation_ctx = Arc::clone(&ctx);
    scheduler.schedule(
        "model-rotation",
        Duration::from_secs(memory.rotation_interval_seconds),
        move || {
            rotate_models(&rotation_ctx);
        },
    )?;

    Ok(())
}
