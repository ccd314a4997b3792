/*!
 * Bounded, self-sizing worker pool for tile pipelines
 *
 * Tiles are independent, so workers simply drain a shared queue. A manager
 * thread samples CPU and memory usage every few seconds and moves the number
 * of active workers inside [min_workers, max_workers]. Each job runs on its
 * own thread so a hung tile can be abandoned after the hard timeout.
 */

use crate::types::{MosaicError, MosaicResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Usage reported when the platform offers nothing to sample
const NEUTRAL_USAGE: f64 = 0.5;

/// How long an inactive worker waits before checking again
const IDLE_POLL: Duration = Duration::from_millis(25);

/// Worker pool parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub initial_workers: usize,
    /// Manager sampling period, clamped to 1-5 s
    pub sample_interval_ms: u64,
    /// Hard per-tile timeout
    pub tile_timeout_ms: u64,
    /// Shrink above this utilisation
    pub critical_usage: f64,
    /// Grow by two below this utilisation while work is queued
    pub low_usage: f64,
    /// Grow by one below this utilisation while work is queued
    pub moderate_usage: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self {
            min_workers: 1,
            max_workers: (cores * 2).max(2),
            initial_workers: cores.clamp(1, 4),
            sample_interval_ms: 2000,
            tile_timeout_ms: 30 * 60 * 1000,
            critical_usage: 0.9,
            low_usage: 0.5,
            moderate_usage: 0.75,
        }
    }
}

impl SchedulerConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.clamp(1000, 5000))
    }

    pub fn tile_timeout(&self) -> Duration {
        Duration::from_millis(self.tile_timeout_ms)
    }

    pub fn policy(&self) -> ScalingPolicy {
        ScalingPolicy {
            min_workers: self.min_workers.max(1),
            max_workers: self.max_workers.max(self.min_workers.max(1)),
            critical_usage: self.critical_usage,
            low_usage: self.low_usage,
            moderate_usage: self.moderate_usage,
        }
    }
}

/// Utilisation in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
}

impl ResourceUsage {
    /// The tighter of the two resources drives scaling
    pub fn peak(&self) -> f64 {
        self.cpu.max(self.memory)
    }
}

pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Linux sampler over /proc/loadavg and /proc/meminfo
#[derive(Debug, Clone)]
pub struct ProcResourceSampler {
    cores: usize,
}

impl Default for ProcResourceSampler {
    fn default() -> Self {
        Self { cores: thread::available_parallelism().map(|n| n.get()).unwrap_or(1) }
    }
}

impl ResourceSampler for ProcResourceSampler {
    fn sample(&self) -> ResourceUsage {
        let cpu = std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|s| parse_loadavg(&s))
            .map(|load| (load / self.cores as f64).clamp(0.0, 1.0))
            .unwrap_or(NEUTRAL_USAGE);
        let memory = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|s| parse_meminfo(&s))
            .unwrap_or(NEUTRAL_USAGE);
        ResourceUsage { cpu, memory }
    }
}

/// Sampler that always reports the same usage
#[derive(Debug, Clone, Copy)]
pub struct StaticSampler(pub ResourceUsage);

impl ResourceSampler for StaticSampler {
    fn sample(&self) -> ResourceUsage {
        self.0
    }
}

/// One-minute load average
fn parse_loadavg(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

/// Used memory fraction: 1 - MemAvailable / MemTotal
fn parse_meminfo(content: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        content
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some((1.0 - available / total).clamp(0.0, 1.0))
}

/// Worker sizing rule
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    pub min_workers: usize,
    pub max_workers: usize,
    pub critical_usage: f64,
    pub low_usage: f64,
    pub moderate_usage: f64,
}

impl ScalingPolicy {
    pub fn next_worker_count(&self, current: usize, usage: f64, queued: usize) -> usize {
        let next = if usage > self.critical_usage {
            current.saturating_sub(1)
        } else if queued > 0 && usage < self.low_usage {
            current + 2
        } else if queued > 0 && usage < self.moderate_usage {
            current + 1
        } else {
            current
        };
        next.clamp(self.min_workers, self.max_workers)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs independent jobs on a resizable pool with a hard per-job timeout
pub struct WorkerScheduler {
    config: SchedulerConfig,
    sampler: Arc<dyn ResourceSampler>,
}

impl WorkerScheduler {
    pub fn new(config: SchedulerConfig, sampler: Arc<dyn ResourceSampler>) -> Self {
        Self { config, sampler }
    }

    pub fn with_proc_sampler(config: SchedulerConfig) -> Self {
        Self::new(config, Arc::new(ProcResourceSampler::default()))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run every job; results come back in job order
    pub fn run<J, R, F>(&self, jobs: Vec<J>, work: F) -> Vec<MosaicResult<R>>
    where
        J: Send + 'static,
        R: Send + 'static,
        F: Fn(J) -> MosaicResult<R> + Send + Sync + 'static,
    {
        let total = jobs.len();
        if total == 0 {
            return Vec::new();
        }

        let policy = self.config.policy();
        let timeout = self.config.tile_timeout();
        let interval = self.config.sample_interval();

        let queue: Arc<Mutex<VecDeque<(usize, J)>>> =
            Arc::new(Mutex::new(jobs.into_iter().enumerate().collect()));
        let results: Arc<Mutex<Vec<Option<MosaicResult<R>>>>> =
            Arc::new(Mutex::new((0..total).map(|_| None).collect()));
        let target = Arc::new(AtomicUsize::new(
            self.config.initial_workers.clamp(policy.min_workers, policy.max_workers),
        ));
        let done = Arc::new(AtomicBool::new(false));
        let work = Arc::new(work);

        log::info!(
            "🚀 Scheduling {} tile(s) on {}-{} workers (start {})",
            total,
            policy.min_workers,
            policy.max_workers,
            target.load(Ordering::SeqCst)
        );

        let manager = {
            let queue = Arc::clone(&queue);
            let target = Arc::clone(&target);
            let done = Arc::clone(&done);
            let sampler = Arc::clone(&self.sampler);
            let policy = policy.clone();
            thread::spawn(move || {
                let step = Duration::from_millis(50);
                let mut waited = Duration::ZERO;
                while !done.load(Ordering::SeqCst) {
                    thread::sleep(step);
                    waited += step;
                    if waited < interval {
                        continue;
                    }
                    waited = Duration::ZERO;
                    let usage = sampler.sample();
                    let queued = lock(&queue).len();
                    let current = target.load(Ordering::SeqCst);
                    let next = policy.next_worker_count(current, usage.peak(), queued);
                    if next != current {
                        log::debug!(
                            "Workers {} -> {} (cpu {:.2}, mem {:.2}, queued {})",
                            current,
                            next,
                            usage.cpu,
                            usage.memory,
                            queued
                        );
                        target.store(next, Ordering::SeqCst);
                    }
                }
            })
        };

        let workers: Vec<_> = (0..policy.max_workers.min(total))
            .map(|slot| {
                let queue = Arc::clone(&queue);
                let results = Arc::clone(&results);
                let target = Arc::clone(&target);
                let work = Arc::clone(&work);
                thread::spawn(move || loop {
                    if slot >= target.load(Ordering::SeqCst) {
                        if lock(&queue).is_empty() {
                            break;
                        }
                        thread::sleep(IDLE_POLL);
                        continue;
                    }
                    let Some((index, job)) = lock(&queue).pop_front() else {
                        break;
                    };
                    let outcome = run_with_timeout(Arc::clone(&work), job, timeout, index);
                    lock(&results)[index] = Some(outcome);
                })
            })
            .collect();

        for worker in workers {
            if worker.join().is_err() {
                log::error!("A scheduler worker panicked");
            }
        }
        done.store(true, Ordering::SeqCst);
        if manager.join().is_err() {
            log::error!("The scheduler manager panicked");
        }

        let mut slots = lock(&results);
        slots
            .drain(..)
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(MosaicError::Unknown("job finished without a result".to_string()))
                })
            })
            .collect()
    }
}

/// Run one job on its own thread; a timeout abandons the thread
fn run_with_timeout<J, R, F>(
    work: Arc<F>,
    job: J,
    timeout: Duration,
    index: usize,
) -> MosaicResult<R>
where
    J: Send + 'static,
    R: Send + 'static,
    F: Fn(J) -> MosaicResult<R> + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name(format!("tile-{}", index))
        .spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| work(job))).unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(MosaicError::Unknown(format!("tile pipeline panicked: {}", message)))
            });
            // the receiver is gone when the job already timed out
            let _ = tx.send(outcome);
        });
    if let Err(e) = spawned {
        return Err(MosaicError::Unknown(format!("could not spawn tile thread: {}", e)));
    }

    match rx.recv_timeout(timeout) {
        Ok(outcome) => outcome,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            log::warn!("Job {} exceeded {:?}; abandoning it", index, timeout);
            Err(MosaicError::Timeout(timeout))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(MosaicError::Unknown(format!("job {} exited without reporting", index)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FailureReason;

    fn policy() -> ScalingPolicy {
        SchedulerConfig { min_workers: 1, max_workers: 8, ..Default::default() }.policy()
    }

    fn scheduler(max_workers: usize, timeout_ms: u64) -> WorkerScheduler {
        WorkerScheduler::new(
            SchedulerConfig {
                min_workers: 1,
                max_workers,
                initial_workers: max_workers,
                sample_interval_ms: 1000,
                tile_timeout_ms: timeout_ms,
                ..Default::default()
            },
            Arc::new(StaticSampler(ResourceUsage { cpu: 0.2, memory: 0.3 })),
        )
    }

    #[test]
    fn test_scaling_rules() {
        let p = policy();
        assert_eq!(p.next_worker_count(4, 0.95, 10), 3);
        assert_eq!(p.next_worker_count(4, 0.3, 10), 6);
        assert_eq!(p.next_worker_count(4, 0.6, 10), 5);
        assert_eq!(p.next_worker_count(4, 0.8, 10), 4);
        // idle queue holds steady
        assert_eq!(p.next_worker_count(4, 0.1, 0), 4);
        // bounds
        assert_eq!(p.next_worker_count(8, 0.1, 5), 8);
        assert_eq!(p.next_worker_count(1, 0.99, 5), 1);
    }

    #[test]
    fn test_proc_parsers() {
        assert_eq!(parse_loadavg("1.50 0.80 0.60 2/345 6789\n"), Some(1.5));
        let meminfo = "MemTotal:       16000000 kB\n\
                       MemFree:         1000000 kB\n\
                       MemAvailable:    4000000 kB\n";
        let used = parse_meminfo(meminfo).unwrap();
        assert!((used - 0.75).abs() < 1e-12);
        assert_eq!(parse_meminfo("MemTotal: 10 kB\n"), None);
    }

    #[test]
    fn test_results_keep_job_order() {
        let results = scheduler(3, 10_000).run((0..20).collect(), |n: u64| {
            thread::sleep(Duration::from_millis(20 - n));
            Ok(n * n)
        });
        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, (0..20).map(|n| n * n).collect::<Vec<_>>());
    }

    #[test]
    fn test_panics_and_timeouts_become_failures() {
        let results = scheduler(2, 200).run(vec![0u32, 1, 2], |n: u32| match n {
            0 => Ok(n),
            1 => panic!("boom"),
            _ => {
                thread::sleep(Duration::from_secs(3));
                Ok(n)
            }
        });
        assert_eq!(*results[0].as_ref().unwrap(), 0);
        let panicked = results[1].as_ref().unwrap_err();
        assert_eq!(panicked.failure_reason(), FailureReason::Unknown);
        assert!(panicked.to_string().contains("boom"));
        assert!(matches!(results[2], Err(MosaicError::Timeout(_))));
    }

    #[test]
    fn test_empty_job_list() {
        let results: Vec<MosaicResult<()>> = scheduler(2, 1000).run(Vec::<u8>::new(), |_| Ok(()));
        assert!(results.is_empty());
    }
}
