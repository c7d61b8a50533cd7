mod state;
mod tokens;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::time::Duration;

use rayon::{Scope, ThreadPoolBuilder};
use tracing::{Level, debug, info, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::{BuildCache, LocalBuildCache};
use crate::config::EngineConfig;
use crate::core::Identity;
use crate::error::{FingerprintError, PlanError};
use crate::expiry::{BackOff, Expiration};
use crate::fingerprint::Fingerprinter;
use crate::item::WorkItem;
use crate::outcome::{BuildResult, Listener, NodeOutcome};
use crate::plan::{ExecutionPlan, PlanBuilder};
use crate::store::FingerprintStore;
use crate::utils::{style_build, style_task};

use self::state::Schedule;
use self::worker::Worker;

/// How often the coordinator wakes up to check for cancellation and back-off
/// while actions are running.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Shared flag used to stop a running build.
///
/// Cancellation is cooperative: no new work item is started once the flag is
/// set, and the ones already running are allowed to finish.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs execution plans.
///
/// The engine owns everything that outlives a single plan: the configuration,
/// the fingerprint store, the optional build cache and the listeners.
///
/// # Example
///
/// ```rust,no_run
/// use kasane::{ActionContext, CancellationToken, Engine, EngineConfig, WorkItem};
///
/// fn compile(_: &ActionContext) -> anyhow::Result<()> {
///     Ok(())
/// }
///
/// let engine = Engine::new(EngineConfig::default()).unwrap();
/// let items = vec![WorkItem::builder("compile", compile).output_dir("out").build()];
///
/// let result = engine.run(items, ["compile"], &CancellationToken::new()).unwrap();
/// std::process::exit(result.exit_code());
/// ```
pub struct Engine {
    config: EngineConfig,
    fingerprinter: Fingerprinter,
    store: FingerprintStore,
    cache: Option<Arc<dyn BuildCache>>,
    listeners: Vec<Arc<dyn Listener>>,
    guard: Option<Arc<dyn Expiration>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, FingerprintError> {
        let fingerprinter = Fingerprinter::with_excludes(&config.excludes)?;
        let store = FingerprintStore::new(&config.cache_dir);
        let cache = config.build_cache.then(|| {
            Arc::new(LocalBuildCache::new(config.build_cache_dir())) as Arc<dyn BuildCache>
        });

        Ok(Self {
            config,
            fingerprinter,
            store,
            cache,
            listeners: Vec::new(),
            guard: None,
        })
    }

    /// Replaces the build cache used for cacheable work items.
    pub fn with_build_cache(mut self, cache: Arc<dyn BuildCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Registers a listener. Listeners are notified in registration order.
    pub fn with_listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Condition polled before every dispatch round to limit parallelism
    /// under resource pressure.
    pub fn with_expiration(mut self, guard: Arc<dyn Expiration>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &FingerprintStore {
        &self.store
    }

    /// Plans and executes the requested work items.
    pub fn run<I>(
        &self,
        items: impl IntoIterator<Item = WorkItem>,
        requested: impl IntoIterator<Item = I>,
        cancel: &CancellationToken,
    ) -> Result<BuildResult, PlanError>
    where
        I: Into<Identity>,
    {
        let mut builder = PlanBuilder::new();
        for item in items {
            builder.add(item);
        }
        for identity in requested {
            builder.request(identity);
        }

        let plan = builder.build()?;
        Ok(self.execute(&plan, cancel))
    }

    /// Executes a plan with at most `max_parallelism` actions at a time.
    pub fn execute(&self, plan: &ExecutionPlan, cancel: &CancellationToken) -> BuildResult {
        let max = self.config.max_parallelism.max(1);

        let pool = ThreadPoolBuilder::new()
            .num_threads(max)
            .thread_name(|i| format!("kasane-worker-{i}"))
            .build();

        match pool {
            Ok(pool) => pool.in_place_scope(|scope| self.coordinate(scope, plan, cancel, max)),
            Err(e) => {
                warn!("couldn't build a dedicated thread pool, using the global one: {e}");
                rayon::in_place_scope(|scope| self.coordinate(scope, plan, cancel, max))
            }
        }
    }

    /// The coordinator loop. It runs on the calling thread and is the only
    /// place where node states change, workers report back over a channel.
    fn coordinate<'s>(
        &'s self,
        scope: &Scope<'s>,
        plan: &'s ExecutionPlan,
        cancel: &CancellationToken,
        max: usize,
    ) -> BuildResult {
        let root_span = tracing::span!(Level::INFO, "build");
        root_span.pb_set_length(plan.len() as u64);
        root_span.pb_set_style(&style_build());
        root_span.pb_set_message("Building...");
        let _enter = root_span.enter();

        let mut schedule = Schedule::new(
            plan.graph(),
            self.listeners.clone(),
            self.config.failure_mode,
            root_span.clone(),
        );

        let (sender, receiver) = channel::<(usize, NodeOutcome)>();
        let back_off = BackOff::new(max);
        let task_style = style_task();

        let mut in_flight = 0;
        let mut cancelled = false;
        let mut limit = max;

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                warn!(running = in_flight, "build cancelled, waiting for running items to finish");
            }

            if !cancelled {
                let current = match &self.guard {
                    Some(guard) => back_off.parallelism(&guard.should_expire()),
                    None => max,
                };
                if current != limit {
                    debug!(from = limit, to = current, "adjusting parallelism");
                    limit = current;
                }

                while in_flight < limit
                    && let Some(node) = schedule.next()
                {
                    let item = schedule.item(node).clone();
                    let worker = Worker {
                        fingerprinter: &self.fingerprinter,
                        store: &self.store,
                        cache: self.cache.as_deref(),
                    };
                    let sender = sender.clone();
                    let parent = root_span.clone();
                    let style = task_style.clone();

                    scope.spawn(move |_| {
                        let name = &item.identity;
                        let span =
                            tracing::span!(parent: &parent, Level::INFO, "item", name = %name);
                        span.pb_set_style(&style);
                        span.pb_set_message(&format!("Running {}", item.identity));
                        let _enter = span.enter();

                        let outcome = worker.run(&item, span.clone());
                        let _ = sender.send((node, outcome));
                    });

                    in_flight += 1;
                }
            }

            if in_flight == 0 {
                break;
            }

            match receiver.recv_timeout(POLL_INTERVAL) {
                Ok((node, outcome)) => {
                    in_flight -= 1;
                    if let NodeOutcome::Failed(detail) = &outcome {
                        warn!(item = %schedule.item(node).identity, "failed: {detail}");
                    }
                    schedule.complete(node, outcome);
                    if schedule.is_stopped() && in_flight > 0 {
                        debug!(running = in_flight, "stopped dispatching after a failure");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let result = schedule.finish(cancelled);
        info!("{result}");
        result
    }
}
