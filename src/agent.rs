//! Lifecycle controller.
//!
//! Owns the top-level state machine (Stopped → Starting → Running → Stopping
//! → Stopped), the master server list, the scheduler, and the executor
//! repositories. All lifecycle transitions (`start`, `stop`, `reload`, the
//! shutdown hook) serialize on one mutex, so a reload can never interleave
//! with a stop and readers always observe a complete configuration
//! generation, never a partial one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use prometheus::{IntCounter, IntGauge, Registry};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::client::MBeanClient;
use crate::config::{parse_servers, AgentConfig};
use crate::error::{AgentError, AgentResult};
use crate::executors::{ExecutorRepository, PoolMetrics, PoolRole};
use crate::jobs::ServerJob;
use crate::model::{ProcessConfig, Server};
use crate::scheduler::{create_trigger, next_job_key, Scheduler};
use crate::watcher::ConfigWatcher;

/// Quiet window required after the last filesystem event before a reload
/// actually runs. A newer event cancels the pending reload and rearms it.
pub const RELOAD_DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Self-observability for the agent process itself, registered once at
/// startup and unregistered at final shutdown. Pool gauges, by contrast,
/// cycle with every configuration generation.
struct AgentMetrics {
    servers_configured: IntGauge,
    reloads_total: IntCounter,
}

impl AgentMetrics {
    fn new() -> Self {
        Self {
            servers_configured: IntGauge::new(
                "beanpoll_servers_configured",
                "Servers in the active configuration",
            )
            .expect("valid gauge opts"),
            reloads_total: IntCounter::new(
                "beanpoll_reloads_total",
                "Completed configuration reloads",
            )
            .expect("valid counter opts"),
        }
    }

    fn register(&self, registry: &Registry) {
        for result in [
            registry.register(Box::new(self.servers_configured.clone())),
            registry.register(Box::new(self.reloads_total.clone())),
        ] {
            if let Err(e) = result {
                error!(error = %e, "failed to register agent metric");
            }
        }
    }

    fn unregister(&self, registry: &Registry) {
        let _ = registry.unregister(Box::new(self.servers_configured.clone()));
        let _ = registry.unregister(Box::new(self.reloads_total.clone()));
    }
}

/// Everything guarded by the lifecycle mutex.
struct Lifecycle {
    state: State,
    /// The authoritative list of active servers, replaced wholesale on
    /// reload. A server appears at most once.
    servers: Vec<Arc<Server>>,
    scheduler: Scheduler,
    query_executors: ExecutorRepository,
    result_executors: ExecutorRepository,
    watcher: Option<ConfigWatcher>,
    registered_pool_metrics: Vec<PoolMetrics>,
    process_metrics_registered: bool,
    metrics_server: Option<JoinHandle<()>>,
}

pub struct Agent {
    config: AgentConfig,
    client: Arc<dyn MBeanClient>,
    registry: Registry,
    metrics: AgentMetrics,
    lifecycle: Mutex<Lifecycle>,
    /// Single-slot debounce timer for reloads; a new request cancels the
    /// pending one. One slot means reloads can never run concurrently.
    pending_reload: StdMutex<Option<JoinHandle<()>>>,
    /// Whether the process-exit hook should still run `stop_services`.
    /// Disarmed by an explicit `stop()` so shutdown never runs twice.
    exit_hook_armed: AtomicBool,
    stopped: Notify,
}

impl Agent {
    pub fn new(config: AgentConfig, client: Arc<dyn MBeanClient>) -> Arc<Self> {
        let pool_capacity = config.pool_capacity;
        Arc::new(Self {
            config,
            client,
            registry: Registry::new(),
            metrics: AgentMetrics::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: State::Stopped,
                servers: Vec::new(),
                scheduler: Scheduler::new(),
                query_executors: ExecutorRepository::new(PoolRole::Query, pool_capacity),
                result_executors: ExecutorRepository::new(PoolRole::Result, pool_capacity),
                watcher: None,
                registered_pool_metrics: Vec::new(),
                process_metrics_registered: false,
                metrics_server: None,
            }),
            pending_reload: StdMutex::new(None),
            exit_hook_armed: AtomicBool::new(false),
            stopped: Notify::new(),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn metric_registry(&self) -> &Registry {
        &self.registry
    }

    /// Completed reloads since startup.
    pub fn reload_count(&self) -> u64 {
        self.metrics.reloads_total.get()
    }

    pub async fn state(&self) -> State {
        self.lifecycle.lock().await.state
    }

    /// Snapshot of the master server list.
    pub async fn servers(&self) -> Vec<Arc<Server>> {
        self.lifecycle.lock().await.servers.clone()
    }

    pub async fn scheduled_job_count(&self) -> usize {
        self.lifecycle.lock().await.scheduler.job_count()
    }

    pub async fn scheduled_job_keys(&self) -> Vec<String> {
        self.lifecycle.lock().await.scheduler.job_keys()
    }

    /// Transition Stopped → Starting → Running. On any startup error the
    /// partially acquired resources are released best-effort and the agent
    /// returns to Stopped.
    pub async fn start(self: &Arc<Self>) -> AgentResult<()> {
        let mut lc = self.lifecycle.lock().await;
        if lc.state != State::Stopped {
            return Err(AgentError::AlreadyStarted);
        }
        info!(path = %self.config.config_path.display(), "starting beanpoll");
        lc.state = State::Starting;
        match self.start_services(&mut lc).await {
            Ok(()) => {
                lc.state = State::Running;
                self.exit_hook_armed.store(true, Ordering::SeqCst);
                info!("beanpoll running");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "startup failed, releasing partial resources");
                let _ = self.stop_services(&mut lc).await;
                lc.state = State::Stopped;
                Err(e)
            }
        }
    }

    /// Transition Running → Stopping → Stopped.
    pub async fn stop(&self) -> AgentResult<()> {
        let mut lc = self.lifecycle.lock().await;
        if lc.state != State::Running {
            return Err(AgentError::AlreadyStopped);
        }
        info!("stopping beanpoll");
        lc.state = State::Stopping;
        // Disarm the exit hook so process termination does not tear down a
        // second time.
        self.exit_hook_armed.store(false, Ordering::SeqCst);
        let result = self.stop_services(&mut lc).await;
        lc.state = State::Stopped;
        self.stopped.notify_waiters();
        result
    }

    /// Atomically replace the live configuration with whatever is on disk.
    /// Only valid while running; any failure is propagated to the caller,
    /// and the debounce path escalates it to a process exit.
    pub async fn reload(&self) -> AgentResult<()> {
        let mut lc = self.lifecycle.lock().await;
        if lc.state != State::Running {
            return Err(AgentError::NotRunning);
        }
        self.restart_system(&mut lc).await
    }

    /// One-shot convenience path: schedule a fixed set of servers, give the
    /// jobs a bounded grace interval to produce samples, then stop.
    pub async fn run_standalone(self: &Arc<Self>, process: ProcessConfig) -> AgentResult<()> {
        {
            let mut lc = self.lifecycle.lock().await;
            if lc.state != State::Stopped {
                return Err(AgentError::AlreadyStarted);
            }
            lc.state = State::Starting;
            lc.scheduler.start();
            lc.servers = process.servers;
            self.build_executors(&mut lc);
            self.register_observability(&mut lc);
            match self.schedule_servers(&mut lc).await {
                Ok(()) => lc.state = State::Running,
                Err(e) => {
                    let _ = self.stop_services(&mut lc).await;
                    lc.state = State::Stopped;
                    return Err(e);
                }
            }
        }
        info!(
            grace = ?self.config.standalone_grace,
            "standalone run scheduled, waiting for jobs to drain"
        );
        tokio::time::sleep(self.config.standalone_grace).await;
        self.stop().await
    }

    /// Process-exit path. Runs the service teardown at most once, and only
    /// if an explicit `stop()` has not already disarmed it.
    pub async fn shutdown_hook(&self) {
        if !self.exit_hook_armed.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("shutdown signal received");
        let mut lc = self.lifecycle.lock().await;
        if lc.state != State::Running {
            return;
        }
        lc.state = State::Stopping;
        if let Err(e) = self.stop_services(&mut lc).await {
            error!(error = %e, "error during shutdown");
        }
        lc.state = State::Stopped;
        self.stopped.notify_waiters();
    }

    /// Resolves once the agent has reached Stopped through `stop()` or the
    /// shutdown hook.
    pub async fn wait_stopped(&self) {
        self.stopped.notified().await;
    }

    /// Debounced reload request from the watcher (or any management
    /// surface): cancel the pending reload, schedule a fresh one a debounce
    /// interval out.
    pub fn schedule_reload(self: &Arc<Self>) {
        let agent = Arc::clone(self);
        let mut pending = self.pending_reload.lock().expect("reload slot lock");
        if let Some(prior) = pending.take() {
            prior.abort();
            debug!("superseded pending reload");
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(RELOAD_DEBOUNCE).await;
            match agent.reload().await {
                Ok(()) => {}
                Err(AgentError::NotRunning) => debug!("reload skipped, agent not running"),
                Err(e) => {
                    // Reload failures are fatal; the supervisor restarts the
                    // agent with a consistent view of the configuration.
                    error!(error = %e, "configuration reload failed, exiting");
                    std::process::exit(1);
                }
            }
        }));
    }

    async fn start_services(self: &Arc<Self>, lc: &mut Lifecycle) -> AgentResult<()> {
        lc.scheduler.start();

        let watch_dir = self.config.watch_dir();
        let filter_config = self.config.clone();
        let agent = Arc::downgrade(self);
        let watcher = ConfigWatcher::start(
            &watch_dir,
            move |path| filter_config.is_process_config_file(path),
            move || {
                if let Some(agent) = agent.upgrade() {
                    agent.schedule_reload();
                }
            },
        )?;
        lc.watcher = Some(watcher);

        self.startup_system(lc).await?;

        if self.config.metrics_port != 0 && lc.metrics_server.is_none() {
            lc.metrics_server = Some(serve_metrics(
                self.registry.clone(),
                self.config.metrics_port,
            ));
        }
        Ok(())
    }

    /// The Starting substeps shared by startup and reload: parse files into
    /// the master list, build pools, register observability, start writers,
    /// validate, and schedule.
    async fn startup_system(&self, lc: &mut Lifecycle) -> AgentResult<()> {
        self.load_servers(lc).await?;
        self.build_executors(lc);
        self.register_observability(lc);
        self.schedule_servers(lc).await?;
        Ok(())
    }

    /// Reload critical section. The scheduler keeps running throughout; the
    /// job set visible to it is either the old one (before the delete) or
    /// the new one (after rescheduling), never a mixture.
    async fn restart_system(&self, lc: &mut Lifecycle) -> AgentResult<()> {
        info!("reloading configuration");
        lc.scheduler.delete_all_jobs();
        for metrics in lc.registered_pool_metrics.drain(..) {
            metrics.unregister(&self.registry);
        }
        lc.query_executors.clear().await;
        lc.result_executors.clear().await;
        self.startup_system(lc).await?;
        self.metrics.reloads_total.inc();
        info!(servers = lc.servers.len(), "reload complete");
        Ok(())
    }

    /// Close the previous generation's writers and replace the master list
    /// with the parsed current on-disk configuration.
    async fn load_servers(&self, lc: &mut Lifecycle) -> AgentResult<()> {
        self.stop_writers_and_clear_master_list(lc).await;
        let files = self.config.process_config_files()?;
        let servers = parse_servers(&files, self.config.continue_on_error)?;
        info!(
            files = files.len(),
            servers = servers.len(),
            "configuration loaded"
        );
        lc.servers = servers;
        Ok(())
    }

    /// Close every writer reachable from the master server list and empty
    /// the list. Used by shutdown and by each re-read of the config files.
    /// Returns the number of writers that failed to close.
    async fn stop_writers_and_clear_master_list(&self, lc: &mut Lifecycle) -> usize {
        let mut failures = 0;
        for server in &lc.servers {
            for writer in server.all_writers() {
                if let Err(e) = writer.close().await {
                    failures += 1;
                    error!(
                        server = %server.key(),
                        writer = writer.kind(),
                        error = %e,
                        "error stopping writer"
                    );
                }
            }
        }
        lc.servers.clear();
        failures
    }

    fn build_executors(&self, lc: &mut Lifecycle) {
        for server in &lc.servers {
            lc.query_executors.put(server);
            lc.result_executors.put(server);
        }
    }

    fn register_observability(&self, lc: &mut Lifecycle) {
        if !lc.process_metrics_registered {
            self.metrics.register(&self.registry);
            lc.process_metrics_registered = true;
        }
        for metrics in lc
            .query_executors
            .metrics()
            .into_iter()
            .chain(lc.result_executors.metrics())
        {
            if let Err(e) = metrics.register(&self.registry) {
                error!(error = %e, "failed to register pool metrics");
            }
            lc.registered_pool_metrics.push(metrics);
        }
        self.metrics.servers_configured.set(lc.servers.len() as i64);
    }

    /// Start every writer, validate each `(server, query, writer)` triple,
    /// and schedule one job per server. Any failure here fails the whole
    /// startup or reload.
    async fn schedule_servers(&self, lc: &mut Lifecycle) -> AgentResult<()> {
        for server in &lc.servers {
            for writer in server.all_writers() {
                writer
                    .start()
                    .await
                    .map_err(|e| AgentError::WriterStart {
                        server: server.key(),
                        message: e.to_string(),
                    })?;
            }
            for query in &server.queries {
                for writer in server.writers_for(query) {
                    writer.validate_setup(server, query)?;
                }
            }

            let (Some(query_pool), Some(result_pool)) = (
                lc.query_executors.executor_for(server),
                lc.result_executors.executor_for(server),
            ) else {
                return Err(AgentError::Scheduler(format!(
                    "no executor pools for {}",
                    server.key()
                )));
            };
            let key = next_job_key(server);
            let trigger = create_trigger(server, self.config.run_period_seconds, key.clone());
            let job = ServerJob::new(
                Arc::clone(server),
                Arc::clone(&self.client),
                query_pool,
                result_pool,
            );
            lc.scheduler.schedule_job(key, trigger, move || job.run())?;
        }
        Ok(())
    }

    /// Teardown, in the reverse of the startup order. Every step is
    /// best-effort; failures are logged and folded into one composite error.
    async fn stop_services(&self, lc: &mut Lifecycle) -> AgentResult<()> {
        let mut failures: Vec<String> = Vec::new();

        if let Some(pending) = self.pending_reload.lock().expect("reload slot lock").take() {
            pending.abort();
        }

        lc.scheduler.stop(self.config.scheduler_grace).await;
        debug!("scheduler stopped");

        lc.query_executors.clear().await;
        lc.result_executors.clear().await;
        debug!("executor pools shut down");

        if let Some(watcher) = lc.watcher.take() {
            watcher.stop();
            debug!("configuration watcher stopped");
        }

        let close_failures = self.stop_writers_and_clear_master_list(lc).await;
        if close_failures > 0 {
            failures.push(format!("{close_failures} writer(s) failed to close"));
        }

        for metrics in lc.registered_pool_metrics.drain(..) {
            metrics.unregister(&self.registry);
        }
        if lc.process_metrics_registered {
            self.metrics.unregister(&self.registry);
            lc.process_metrics_registered = false;
        }
        if let Some(server) = lc.metrics_server.take() {
            server.abort();
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AgentError::Shutdown(failures.join("; ")))
        }
    }
}

/// Serve the metric registry in text exposition format.
fn serve_metrics(registry: Registry, port: u16) -> JoinHandle<()> {
    use axum::routing::get;
    use axum::Router;

    let app = Router::new().route(
        "/metrics",
        get(move || async move {
            let encoder = prometheus::TextEncoder::new();
            encoder
                .encode_to_string(&registry.gather())
                .unwrap_or_default()
        }),
    );
    tokio::spawn(async move {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                info!(%addr, "serving metrics");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "metrics endpoint failed");
                }
            }
            Err(e) => error!(%addr, error = %e, "failed to bind metrics endpoint"),
        }
    })
}
