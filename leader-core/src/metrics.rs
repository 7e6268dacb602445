//! Prometheus-style metrics for the coordinator
//!
//! Each supervisor owns one [`LeaderMetrics`]; nothing here is global so
//! several supervisors can live in one process (tests, demo binary).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Counter metric (monotonically increasing)
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
            help,
        }
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug)]
pub struct Gauge {
    value: AtomicI64,
    name: &'static str,
    help: &'static str,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name,
            help,
        }
    }

    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Histogram for work latency
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>,
    sum_micros: AtomicU64,
    count: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Histogram {
    /// Create with default buckets, sized for maintenance jobs
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self::with_buckets(
            name,
            help,
            vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0],
        )
    }

    pub fn with_buckets(name: &'static str, help: &'static str, bounds: Vec<f64>) -> Self {
        Self {
            buckets: bounds.into_iter().map(|b| (b, AtomicU64::new(0))).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name,
            help,
        }
    }

    /// Record one observation
    pub fn observe(&self, elapsed: Duration) {
        let value = elapsed.as_secs_f64();
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);

        for (bound, count) in &self.buckets {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut output = format!(
            "# HELP {} {}\n# TYPE {} histogram\n",
            self.name, self.help, self.name
        );

        for (bound, count) in &self.buckets {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "{}_bucket{{le=\"+Inf\"}} {}\n",
            self.name,
            self.count()
        ));

        let sum_secs = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        output.push_str(&format!("{}_count {}\n", self.name, self.count()));

        output
    }
}

/// Metrics for one supervisor
#[derive(Debug)]
pub struct LeaderMetrics {
    /// Completed work items
    pub work_performed: Counter,
    /// Work items currently executing
    pub work_in_flight: Gauge,
    /// Leadership generations started by this node
    pub generations: Counter,
    /// Times this node lost leadership while leading
    pub demotions: Counter,
    /// Failed campaign attempts
    pub campaign_failures: Counter,
    /// 1 while this node is leading
    pub is_leader: Gauge,
    /// Wall time of completed work
    pub work_duration: Histogram,
}

impl LeaderMetrics {
    pub fn new() -> Self {
        Self {
            work_performed: Counter::new(
                "leader_work_performed_total",
                "Total work items completed on this node",
            ),
            work_in_flight: Gauge::new("leader_work_in_flight", "Work items currently executing"),
            generations: Counter::new(
                "leader_generations_total",
                "Leadership generations started by this node",
            ),
            demotions: Counter::new(
                "leader_demotions_total",
                "Times this node lost leadership while leading",
            ),
            campaign_failures: Counter::new(
                "leader_campaign_failures_total",
                "Campaign attempts that failed with an error",
            ),
            is_leader: Gauge::new("leader_is_leader", "Whether this node currently leads"),
            work_duration: Histogram::new(
                "leader_work_duration_seconds",
                "Wall time of completed work items",
            ),
        }
    }

    /// Export all metrics in Prometheus text format
    pub fn export(&self) -> String {
        let mut output = String::new();

        output.push_str(&self.work_performed.to_prometheus());
        output.push_str(&self.generations.to_prometheus());
        output.push_str(&self.demotions.to_prometheus());
        output.push_str(&self.campaign_failures.to_prometheus());

        output.push_str(&self.work_in_flight.to_prometheus());
        output.push_str(&self.is_leader.to_prometheus());

        output.push_str(&self.work_duration.to_prometheus());

        output
    }
}

impl Default for LeaderMetrics {
    fn default() -> Self {
        Self::new()
    }
}
