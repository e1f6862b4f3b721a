//! In-memory collection of network and simulation quality metrics.
//!
//! Samples are kept as time series for the session and flushed on shutdown
//! as one compact JSON document. Jitter follows RFC 3550 section A.8: the
//! smoothed estimate moves toward each new inter-arrival delta by 1/16.

use std::io;
use std::path::Path;
use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct RttSample {
    pub t: f64,
    pub rtt_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JitterSample {
    pub t: f64,
    pub jitter_ms: f64,
    pub instant_jitter_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LossSample {
    pub t: f64,
    pub loss: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BandwidthSample {
    pub t: f64,
    pub sent_bytes: u64,
    pub recv_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionErrorSample {
    pub t: f64,
    pub error: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickTimeSample {
    pub tick: u32,
    pub duration_ms: f64,
}

/// Collects RTT, jitter, loss, bandwidth, prediction error, and tick time
/// series for one session.
#[derive(Debug, Serialize)]
pub struct MetricsLogger {
    rtt: Vec<RttSample>,
    jitter: Vec<JitterSample>,
    packet_loss: Vec<LossSample>,
    bandwidth: Vec<BandwidthSample>,
    prediction_error: Vec<PredictionErrorSample>,
    tick_times: Vec<TickTimeSample>,

    #[serde(skip)]
    start: Instant,
    #[serde(skip)]
    prev_rtt: Option<f64>,
    #[serde(skip)]
    smoothed_jitter: f64,
    #[serde(skip)]
    last_rtt: f64,
}

impl MetricsLogger {
    pub fn new() -> Self {
        Self {
            rtt: Vec::new(),
            jitter: Vec::new(),
            packet_loss: Vec::new(),
            bandwidth: Vec::new(),
            prediction_error: Vec::new(),
            tick_times: Vec::new(),
            start: Instant::now(),
            prev_rtt: None,
            smoothed_jitter: 0.0,
            last_rtt: 0.0,
        }
    }

    fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Records a round-trip time sample and updates the jitter estimate.
    pub fn log_rtt(&mut self, rtt_ms: f64) {
        let t = self.elapsed();
        self.last_rtt = rtt_ms;
        self.rtt.push(RttSample { t, rtt_ms });

        if let Some(prev) = self.prev_rtt {
            let delta = (rtt_ms - prev).abs();
            self.smoothed_jitter += (delta - self.smoothed_jitter) / 16.0;
            self.jitter.push(JitterSample {
                t,
                jitter_ms: self.smoothed_jitter,
                instant_jitter_ms: delta,
            });
        }
        self.prev_rtt = Some(rtt_ms);
    }

    pub fn log_packet_loss(&mut self, loss_rate: f64) {
        let t = self.elapsed();
        self.packet_loss.push(LossSample { t, loss: loss_rate });
    }

    pub fn log_bandwidth(&mut self, sent_bytes: u64, recv_bytes: u64) {
        let t = self.elapsed();
        self.bandwidth.push(BandwidthSample {
            t,
            sent_bytes,
            recv_bytes,
        });
    }

    pub fn log_prediction_error(&mut self, error: f32) {
        let t = self.elapsed();
        self.prediction_error.push(PredictionErrorSample { t, error });
    }

    pub fn log_tick_time(&mut self, tick: u32, duration_ms: f64) {
        self.tick_times.push(TickTimeSample { tick, duration_ms });
    }

    pub fn current_rtt(&self) -> f64 {
        self.last_rtt
    }

    pub fn current_jitter(&self) -> f64 {
        self.smoothed_jitter
    }

    /// Serializes all series as one compact (newline-free) JSON document.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Flushes the JSON document to disk.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let json = self.to_json().map_err(io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Summary statistics for the shutdown log line.
    pub fn summary(&self) -> MetricsSummary {
        let mut summary = MetricsSummary::default();

        if !self.rtt.is_empty() {
            let mut sorted: Vec<f64> = self.rtt.iter().map(|s| s.rtt_ms).collect();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let n = sorted.len();
            summary.rtt_mean = Some(sorted.iter().sum::<f64>() / n as f64);
            summary.rtt_min = Some(sorted[0]);
            summary.rtt_max = Some(sorted[n - 1]);
            summary.rtt_p50 = Some(sorted[n / 2]);
            summary.rtt_p95 = Some(sorted[(n * 95 / 100).min(n - 1)]);
            summary.rtt_p99 = Some(sorted[(n * 99 / 100).min(n - 1)]);
        }

        if !self.jitter.is_empty() {
            let total: f64 = self.jitter.iter().map(|s| s.jitter_ms).sum();
            summary.jitter_mean = Some(total / self.jitter.len() as f64);
        }

        if !self.packet_loss.is_empty() {
            let total: f64 = self.packet_loss.iter().map(|s| s.loss).sum();
            summary.loss_rate_mean = Some(total / self.packet_loss.len() as f64);
        }

        if !self.tick_times.is_empty() {
            let durations: Vec<f64> = self.tick_times.iter().map(|s| s.duration_ms).collect();
            summary.tick_time_mean =
                Some(durations.iter().sum::<f64>() / durations.len() as f64);
            summary.tick_time_max = durations.iter().copied().reduce(f64::max);
        }

        summary
    }
}

impl Default for MetricsLogger {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregates computed by [`MetricsLogger::summary`]; fields are `None` when
/// no samples of that kind were collected.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSummary {
    pub rtt_mean: Option<f64>,
    pub rtt_min: Option<f64>,
    pub rtt_max: Option<f64>,
    pub rtt_p50: Option<f64>,
    pub rtt_p95: Option<f64>,
    pub rtt_p99: Option<f64>,
    pub jitter_mean: Option<f64>,
    pub loss_rate_mean: Option<f64>,
    pub tick_time_mean: Option<f64>,
    pub tick_time_max: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn jitter_follows_rfc3550_recurrence() {
        let mut metrics = MetricsLogger::new();
        metrics.log_rtt(100.0);
        metrics.log_rtt(120.0);
        metrics.log_rtt(110.0);

        // J starts at 0: after |120-100| = 20, J = 20/16; after |110-120| =
        // 10, J = J + (10 - J)/16.
        let j1 = 20.0 / 16.0;
        let j2 = j1 + (10.0 - j1) / 16.0;
        assert_eq!(metrics.jitter.len(), 2);
        assert_approx_eq!(metrics.jitter[0].jitter_ms, j1, 1e-9);
        assert_approx_eq!(metrics.jitter[1].jitter_ms, j2, 1e-9);
        assert_approx_eq!(metrics.current_jitter(), j2, 1e-9);
    }

    #[test]
    fn first_rtt_produces_no_jitter_sample() {
        let mut metrics = MetricsLogger::new();
        metrics.log_rtt(50.0);
        assert_eq!(metrics.rtt.len(), 1);
        assert!(metrics.jitter.is_empty());
        assert_eq!(metrics.current_rtt(), 50.0);
    }

    #[test]
    fn json_document_is_newline_free() {
        let mut metrics = MetricsLogger::new();
        metrics.log_rtt(10.0);
        metrics.log_rtt(12.0);
        metrics.log_packet_loss(0.05);
        metrics.log_bandwidth(1024, 2048);
        metrics.log_prediction_error(1.5);
        metrics.log_tick_time(1, 0.4);

        let json = metrics.to_json().unwrap();
        assert!(!json.contains('\n'));
        for key in [
            "rtt",
            "jitter",
            "packet_loss",
            "bandwidth",
            "prediction_error",
            "tick_times",
        ] {
            assert!(json.contains(key), "missing series {}", key);
        }
    }

    #[test]
    fn summary_aggregates() {
        let mut metrics = MetricsLogger::new();
        for rtt in [10.0, 20.0, 30.0] {
            metrics.log_rtt(rtt);
        }
        metrics.log_tick_time(1, 0.5);
        metrics.log_tick_time(2, 1.5);

        let summary = metrics.summary();
        assert_approx_eq!(summary.rtt_mean.unwrap(), 20.0, 1e-9);
        assert_eq!(summary.rtt_min, Some(10.0));
        assert_eq!(summary.rtt_max, Some(30.0));
        assert_approx_eq!(summary.tick_time_mean.unwrap(), 1.0, 1e-9);
        assert_eq!(summary.tick_time_max, Some(1.5));
        assert!(summary.loss_rate_mean.is_none());
    }
}
