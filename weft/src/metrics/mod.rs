//! Process-level counters and bounded per-tool timers.
//!
//! Counters cover what external monitors watch: reconnects, READY timeouts,
//! close statuses, tool invocations and their outcomes. The per-tool timer
//! cache is bounded (max entries, access expiry); evictions are logged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

const MAX_TIMER_ENTRIES: usize = 256;
const TIMER_ACCESS_EXPIRY: Duration = Duration::from_secs(600);

#[derive(Debug)]
struct TimerEntry {
    total: Duration,
    count: u64,
    last_access: Instant,
}

/// Runtime counters shared across sessions.
#[derive(Debug, Default)]
pub struct Metrics {
    pub reconnects: AtomicU64,
    pub ready_timeouts: AtomicU64,
    pub normal_closes: AtomicU64,
    pub abnormal_closes: AtomicU64,
    pub tool_invocations: AtomicU64,
    pub tool_successes: AtomicU64,
    pub tool_failures: AtomicU64,
    timers: RwLock<HashMap<String, TimerEntry>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one tool invocation's wall time.
    pub fn record_tool_time(&self, tool: &str, elapsed: Duration) {
        let mut timers = match self.timers.write() {
            Ok(t) => t,
            Err(p) => p.into_inner(),
        };
        let now = Instant::now();
        timers.retain(|name, entry| {
            let keep = now.duration_since(entry.last_access) < TIMER_ACCESS_EXPIRY;
            if !keep {
                tracing::debug!(tool = %name, "tool timer evicted (expired)");
            }
            keep
        });
        if let Some(entry) = timers.get_mut(tool) {
            entry.total += elapsed;
            entry.count += 1;
            entry.last_access = now;
            return;
        }
        if timers.len() >= MAX_TIMER_ENTRIES {
            if let Some(oldest) = timers
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            {
                timers.remove(&oldest);
                tracing::debug!(tool = %oldest, "tool timer evicted (capacity)");
            }
        }
        timers.insert(
            tool.to_string(),
            TimerEntry {
                total: elapsed,
                count: 1,
                last_access: now,
            },
        );
    }

    /// Point-in-time copy of all counters and timers.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let timers = match self.timers.read() {
            Ok(t) => t,
            Err(p) => p.into_inner(),
        };
        MetricsSnapshot {
            reconnects: self.reconnects.load(Ordering::Relaxed),
            ready_timeouts: self.ready_timeouts.load(Ordering::Relaxed),
            normal_closes: self.normal_closes.load(Ordering::Relaxed),
            abnormal_closes: self.abnormal_closes.load(Ordering::Relaxed),
            tool_invocations: self.tool_invocations.load(Ordering::Relaxed),
            tool_successes: self.tool_successes.load(Ordering::Relaxed),
            tool_failures: self.tool_failures.load(Ordering::Relaxed),
            tool_timers: timers
                .iter()
                .map(|(name, e)| ToolTimerSnapshot {
                    tool: name.clone(),
                    count: e.count,
                    total: e.total,
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ToolTimerSnapshot {
    pub tool: String,
    pub count: u64,
    pub total: Duration,
}

#[derive(Clone, Debug)]
pub struct MetricsSnapshot {
    pub reconnects: u64,
    pub ready_timeouts: u64,
    pub normal_closes: u64,
    pub abnormal_closes: u64,
    pub tool_invocations: u64,
    pub tool_successes: u64,
    pub tool_failures: u64,
    pub tool_timers: Vec<ToolTimerSnapshot>,
}
