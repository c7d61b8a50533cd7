//! Conditions under which a long-running build should slow down or stop.
//!
//! An [`Expiration`] reports whether it has triggered and how urgent the
//! situation is. Conditions compose with [`AllOf`] and [`AnyOf`], and the
//! scheduler turns the current result into a parallelism limit through
//! [`BackOff`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use sysinfo::System;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    #[default]
    None,
    Low,
    Elevated,
    Immediate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpirationResult {
    pub triggered: bool,
    pub reason: Option<String>,
    pub priority: Priority,
}

impl ExpirationResult {
    pub fn not_triggered() -> Self {
        Self::default()
    }

    /// Not triggered, but signalling pressure at the given priority.
    pub fn pressure(priority: Priority) -> Self {
        Self {
            triggered: false,
            reason: None,
            priority,
        }
    }

    pub fn triggered(reason: impl Into<String>, priority: Priority) -> Self {
        Self {
            triggered: true,
            reason: Some(reason.into()),
            priority,
        }
    }
}

pub trait Expiration: Send + Sync {
    fn should_expire(&self) -> ExpirationResult;
}

/// Triggers only when every child triggers.
///
/// The reason is the conjunction of the children's reasons and the priority is
/// the lowest one among them. While not triggered, the highest child priority
/// is reported so that pressure is still visible.
pub struct AllOf(Vec<Box<dyn Expiration>>);

impl AllOf {
    pub fn new(children: Vec<Box<dyn Expiration>>) -> Self {
        Self(children)
    }
}

impl Expiration for AllOf {
    fn should_expire(&self) -> ExpirationResult {
        let results: Vec<ExpirationResult> = self.0.iter().map(|c| c.should_expire()).collect();
        if results.is_empty() {
            return ExpirationResult::not_triggered();
        }

        if !results.iter().all(|r| r.triggered) {
            let priority = results.iter().map(|r| r.priority).max().unwrap_or_default();
            return ExpirationResult::pressure(priority);
        }

        let reason = results
            .iter()
            .filter_map(|r| r.reason.as_deref())
            .collect::<Vec<_>>()
            .join(" and ");
        let priority = results.iter().map(|r| r.priority).min().unwrap_or_default();

        ExpirationResult::triggered(reason, priority)
    }
}

/// Triggers when any child triggers, reporting the most urgent one.
pub struct AnyOf(Vec<Box<dyn Expiration>>);

impl AnyOf {
    pub fn new(children: Vec<Box<dyn Expiration>>) -> Self {
        Self(children)
    }
}

impl Expiration for AnyOf {
    fn should_expire(&self) -> ExpirationResult {
        let mut highest = Priority::None;
        let mut chosen: Option<ExpirationResult> = None;

        for result in self.0.iter().map(|c| c.should_expire()) {
            highest = highest.max(result.priority);
            if !result.triggered {
                continue;
            }
            match &chosen {
                Some(current) if current.priority >= result.priority => {}
                _ => chosen = Some(result),
            }
        }

        chosen.unwrap_or_else(|| ExpirationResult::pressure(highest))
    }
}

/// Never triggers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Never;

impl Expiration for Never {
    fn should_expire(&self) -> ExpirationResult {
        ExpirationResult::not_triggered()
    }
}

/// Triggers once nothing has called [`IdleTimeout::touch`] for a while.
#[derive(Debug)]
pub struct IdleTimeout {
    timeout: Duration,
    last: Mutex<Instant>,
}

impl IdleTimeout {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        if let Ok(mut last) = self.last.lock() {
            *last = Instant::now();
        }
    }
}

impl Expiration for IdleTimeout {
    fn should_expire(&self) -> ExpirationResult {
        let idle = match self.last.lock() {
            Ok(last) => last.elapsed(),
            Err(_) => return ExpirationResult::not_triggered(),
        };

        match idle >= self.timeout {
            true => ExpirationResult::triggered(format!("idle for {:.1?}", idle), Priority::Low),
            false => ExpirationResult::not_triggered(),
        }
    }
}

type MemorySampler = Box<dyn Fn() -> (u64, u64) + Send + Sync>;

/// Watches memory usage reported by a sampler returning `(used, total)`.
///
/// Above the elevated threshold the condition reports pressure, above the
/// expire threshold it triggers.
pub struct MemoryPressure {
    sample: MemorySampler,
    elevated: f64,
    expire: f64,
}

impl MemoryPressure {
    pub fn new(
        sample: impl Fn() -> (u64, u64) + Send + Sync + 'static,
        elevated: f64,
        expire: f64,
    ) -> Self {
        Self {
            sample: Box::new(sample),
            elevated,
            expire,
        }
    }

    /// Measures the memory of the whole machine, refreshed on every check.
    pub fn system(elevated: f64, expire: f64) -> Self {
        let system = Mutex::new(System::new());
        let sample = move || match system.lock() {
            Ok(mut system) => {
                system.refresh_memory();
                (system.used_memory(), system.total_memory())
            }
            Err(_) => (0, 0),
        };

        Self::new(sample, elevated, expire)
    }
}

impl Expiration for MemoryPressure {
    fn should_expire(&self) -> ExpirationResult {
        let (used, total) = (self.sample)();
        if total == 0 {
            return ExpirationResult::not_triggered();
        }

        let ratio = used as f64 / total as f64;
        if ratio >= self.expire {
            let reason = format!(
                "memory usage at {:.0}% exceeds {:.0}%",
                ratio * 100.0,
                self.expire * 100.0
            );
            ExpirationResult::triggered(reason, Priority::Immediate)
        } else if ratio >= self.elevated {
            ExpirationResult::pressure(Priority::Elevated)
        } else {
            ExpirationResult::not_triggered()
        }
    }
}

/// Triggers after [`StopRequested::request`] was called on any clone.
#[derive(Debug, Clone, Default)]
pub struct StopRequested(Arc<AtomicBool>);

impl StopRequested {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Expiration for StopRequested {
    fn should_expire(&self) -> ExpirationResult {
        match self.0.load(Ordering::SeqCst) {
            true => ExpirationResult::triggered("stop requested", Priority::Immediate),
            false => ExpirationResult::not_triggered(),
        }
    }
}

/// Maps an [`ExpirationResult`] to how many nodes may run at once.
#[derive(Debug, Clone, Copy)]
pub struct BackOff {
    max: usize,
}

impl BackOff {
    pub fn new(max: usize) -> Self {
        Self { max: max.max(1) }
    }

    pub fn parallelism(&self, result: &ExpirationResult) -> usize {
        if result.triggered {
            1
        } else if result.priority >= Priority::Elevated {
            (self.max / 2).max(1)
        } else {
            self.max
        }
    }
}

/// Polls a condition on a background thread and calls back once when it
/// triggers. Polling stops when the monitor is dropped.
pub struct ExpirationMonitor {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ExpirationMonitor {
    pub fn start<F>(condition: Arc<dyn Expiration>, interval: Duration, on_expire: F) -> Self
    where
        F: FnOnce(ExpirationResult) + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                let result = condition.should_expire();
                if result.triggered {
                    let reason = result.reason.as_deref().unwrap_or_default();
                    info!(reason, "expiration triggered");
                    on_expire(result);
                    return;
                }

                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => return,
                }
            }
        });

        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }
}

impl Drop for ExpirationMonitor {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(ExpirationResult);

    impl Expiration for Fixed {
        fn should_expire(&self) -> ExpirationResult {
            self.0.clone()
        }
    }

    fn fired(reason: &str, priority: Priority) -> Box<dyn Expiration> {
        Box::new(Fixed(ExpirationResult::triggered(reason, priority)))
    }

    fn quiet(priority: Priority) -> Box<dyn Expiration> {
        Box::new(Fixed(ExpirationResult::pressure(priority)))
    }

    #[test]
    fn test_all_of() {
        let all = AllOf::new(vec![fired("a", Priority::Immediate), fired("b", Priority::Low)]);
        assert_eq!(all.should_expire(), ExpirationResult::triggered("a and b", Priority::Low));

        let all = AllOf::new(vec![fired("a", Priority::Low), quiet(Priority::Elevated)]);
        assert_eq!(all.should_expire(), ExpirationResult::pressure(Priority::Elevated));

        assert!(!AllOf::new(vec![]).should_expire().triggered);
    }

    #[test]
    fn test_any_of() {
        let any = AnyOf::new(vec![
            fired("low", Priority::Low),
            quiet(Priority::None),
            fired("urgent", Priority::Immediate),
            fired("also urgent", Priority::Immediate),
        ]);
        assert_eq!(any.should_expire(), ExpirationResult::triggered("urgent", Priority::Immediate));

        let any = AnyOf::new(vec![quiet(Priority::Low), quiet(Priority::Elevated)]);
        assert_eq!(any.should_expire(), ExpirationResult::pressure(Priority::Elevated));
    }

    #[test]
    fn test_back_off() {
        let back_off = BackOff::new(8);
        assert_eq!(back_off.parallelism(&ExpirationResult::not_triggered()), 8);
        assert_eq!(back_off.parallelism(&ExpirationResult::pressure(Priority::Elevated)), 4);
        assert_eq!(back_off.parallelism(&ExpirationResult::triggered("x", Priority::Low)), 1);
        let pressure = ExpirationResult::pressure(Priority::Immediate);
        assert_eq!(BackOff::new(1).parallelism(&pressure), 1);
    }

    #[test]
    fn test_memory_pressure_thresholds() {
        let at = |used| MemoryPressure::new(move || (used, 100), 0.75, 0.9);

        assert_eq!(at(10).should_expire(), ExpirationResult::not_triggered());
        assert_eq!(at(80).should_expire(), ExpirationResult::pressure(Priority::Elevated));

        let result = at(95).should_expire();
        assert!(result.triggered);
        assert_eq!(result.priority, Priority::Immediate);
    }

    #[test]
    fn test_system_memory_is_measured() {
        let result = MemoryPressure::system(2.0, 2.0).should_expire();
        assert!(!result.triggered);

        let result = MemoryPressure::system(0.0, 0.0).should_expire();
        assert!(result.triggered);
        assert_eq!(result.priority, Priority::Immediate);
    }

    #[test]
    fn test_idle_timeout() {
        let idle = IdleTimeout::new(Duration::from_millis(30));
        assert!(!idle.should_expire().triggered);

        thread::sleep(Duration::from_millis(40));
        assert!(idle.should_expire().triggered);

        idle.touch();
        assert!(!idle.should_expire().triggered);
    }

    #[test]
    fn test_monitor_fires_once() {
        let stop = StopRequested::new();
        let (tx, rx) = mpsc::channel();

        let guard = Arc::new(stop.clone());
        let monitor = ExpirationMonitor::start(guard, Duration::from_millis(5), move |result| {
            tx.send(result).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(30)).is_err());
        stop.request();

        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.reason.as_deref(), Some("stop requested"));
        drop(monitor);
        assert!(rx.recv().is_err());
    }
}
