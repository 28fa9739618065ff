//! φ-accrual failure detection. Each endpoint gets a bounded window of
//! heartbeat inter-arrival samples; suspicion is the improbability of the
//! current silence under an exponential fit of that window.

use crate::endpoint::EndpointId;
use crate::telemetry::MetricsRegistry;
use log::{debug, trace};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// 1 / ln(10): converts the exponential tail exponent into base-10 digits
/// of improbability.
const PHI_FACTOR: f64 = 0.434_294_481_903_251_83;

const SAMPLE_WINDOW: usize = 1000;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// φ above which an endpoint is convicted.
    pub phi_threshold: f64,
    /// Interval assumed before any real sample has arrived.
    pub bootstrap_interval: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            phi_threshold: 8.0,
            bootstrap_interval: Duration::from_secs(2),
        }
    }
}

/// Sliding window of inter-arrival intervals for one endpoint.
#[derive(Debug)]
struct ArrivalWindow {
    intervals_millis: VecDeque<u64>,
    last_arrival: Instant,
}

impl ArrivalWindow {
    fn new(now: Instant, bootstrap_interval: Duration) -> Self {
        let mut intervals_millis = VecDeque::with_capacity(SAMPLE_WINDOW);
        intervals_millis.push_back(bootstrap_interval.as_millis() as u64);
        Self {
            intervals_millis,
            last_arrival: now,
        }
    }

    fn record(&mut self, now: Instant) {
        let interval = now.saturating_duration_since(self.last_arrival);
        self.last_arrival = now;
        if self.intervals_millis.len() == SAMPLE_WINDOW {
            self.intervals_millis.pop_front();
        }
        self.intervals_millis.push_back(interval.as_millis() as u64);
    }

    fn mean_millis(&self) -> f64 {
        let sum: u64 = self.intervals_millis.iter().sum();
        (sum as f64 / self.intervals_millis.len() as f64).max(1.0)
    }

    fn phi(&self, now: Instant) -> f64 {
        let silence = now.saturating_duration_since(self.last_arrival).as_millis() as f64;
        PHI_FACTOR * silence / self.mean_millis()
    }
}

/// Outcome of interpreting an endpoint's window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interpretation {
    pub phi: f64,
    /// Present exactly once per threshold crossing; cleared by the next
    /// heartbeat report.
    pub conviction: Option<Conviction>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conviction {
    pub phi: f64,
}

#[derive(Debug)]
pub struct PhiFailureDetector {
    config: DetectorConfig,
    windows: HashMap<EndpointId, ArrivalWindow>,
    convicted: HashSet<EndpointId>,
}

impl PhiFailureDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
            convicted: HashSet::new(),
        }
    }

    /// Records a heartbeat arrival and re-arms conviction for the endpoint.
    pub fn report(&mut self, endpoint: &EndpointId, now: Instant) {
        match self.windows.get_mut(endpoint) {
            Some(window) => window.record(now),
            None => {
                trace!("first heartbeat sample for {endpoint}");
                self.windows.insert(
                    endpoint.clone(),
                    ArrivalWindow::new(now, self.config.bootstrap_interval),
                );
            }
        }
        self.convicted.remove(endpoint);
    }

    /// Current suspicion level, or `None` before any report.
    pub fn phi(&self, endpoint: &EndpointId, now: Instant) -> Option<f64> {
        self.windows.get(endpoint).map(|window| window.phi(now))
    }

    /// Evaluates the endpoint, producing a conviction on the first crossing
    /// of the threshold since its last heartbeat.
    pub fn interpret(&mut self, endpoint: &EndpointId, now: Instant) -> Option<Interpretation> {
        let phi = self.phi(endpoint, now)?;
        let conviction = if phi > self.config.phi_threshold && !self.convicted.contains(endpoint) {
            self.convicted.insert(endpoint.clone());
            debug!("convicting {endpoint} with phi {phi:.2}");
            Some(Conviction { phi })
        } else {
            None
        };
        Some(Interpretation { phi, conviction })
    }

    /// Emits a conviction regardless of φ. Used when a peer announces
    /// shutdown and must be treated as down immediately.
    pub fn force_conviction(&mut self, endpoint: &EndpointId, now: Instant) -> Conviction {
        let phi = self.phi(endpoint, now).unwrap_or(f64::INFINITY);
        self.convicted.insert(endpoint.clone());
        Conviction { phi }
    }

    /// Discards all history for an endpoint.
    pub fn remove(&mut self, endpoint: &EndpointId) {
        self.windows.remove(endpoint);
        self.convicted.remove(endpoint);
    }

    pub fn is_monitoring(&self, endpoint: &EndpointId) -> bool {
        self.windows.contains_key(endpoint)
    }

    pub fn publish_metrics(&self, metrics: &mut MetricsRegistry, now: Instant) {
        metrics.set_monitored_endpoints(self.windows.len());
        for window in self.windows.values() {
            let silence =
                now.saturating_duration_since(window.last_arrival).as_millis() as u64;
            metrics.observe_silence_millis(silence);
        }
    }
}
