//! Latency probing: round-trip samples, rolling statistics, missed probes.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// Configuration for the latency probe.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Whether the probe runs at all. Default: true.
    pub enabled: bool,
    /// Time between probes. Default: 5 s.
    pub interval: Duration,
    /// How long to wait for a response before recording a timeout. Default: 1 s.
    pub timeout: Duration,
    /// Request code used as the probe. Default: `"22"`.
    pub request_code: String,
    /// Consecutive timeouts treated as a dead connection. Default: 3.
    pub max_missed: u32,
    /// Number of samples kept for statistics. Default: 32.
    pub window_size: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(1),
            request_code: "22".to_string(),
            max_missed: 3,
            window_size: 32,
        }
    }
}

/// One latency measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencySample {
    /// A response arrived after this long.
    Measured(Duration),
    /// No response within the timeout; the timeout is an upper bound.
    TimedOut(Duration),
    /// The probe could not be sent.
    SendFailed,
}

impl LatencySample {
    /// Elapsed milliseconds, or `None` for [`LatencySample::SendFailed`].
    pub fn millis(&self) -> Option<u128> {
        match self {
            Self::Measured(d) | Self::TimedOut(d) => Some(d.as_millis()),
            Self::SendFailed => None,
        }
    }
}

impl fmt::Display for LatencySample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Measured(d) => write!(f, "{} ms", d.as_millis()),
            Self::TimedOut(d) => write!(f, ">{} ms (timeout)", d.as_millis()),
            Self::SendFailed => write!(f, "probe send failed"),
        }
    }
}

/// Snapshot of the rolling latency window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LatencyStats {
    /// Samples currently in the window.
    pub samples: usize,
    /// Mean round-trip time.
    pub average: Option<Duration>,
    /// Fastest round trip.
    pub min: Option<Duration>,
    /// Slowest round trip (timeouts count as the timeout).
    pub max: Option<Duration>,
    /// Sample standard deviation; needs at least two samples.
    pub jitter: Option<Duration>,
}

impl fmt::Display for LatencyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (Some(avg), Some(min), Some(max)) = (self.average, self.min, self.max) else {
            return f.write_str("no samples");
        };
        write!(
            f,
            "avg {} ms, min {} ms, max {} ms",
            avg.as_millis(),
            min.as_millis(),
            max.as_millis()
        )?;
        if let Some(jitter) = self.jitter {
            write!(f, ", jitter {} ms", jitter.as_millis())?;
        }
        write!(f, " over {}", self.samples)
    }
}

/// Tracks the outstanding probe and recent samples.
#[derive(Debug)]
pub struct LatencyProbe {
    config: ProbeConfig,
    pending_since: Option<Instant>,
    samples: VecDeque<Duration>,
    consecutive_missed: u32,
}

impl LatencyProbe {
    /// Create a probe tracker with the given configuration.
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.window_size),
            config,
            pending_since: None,
            consecutive_missed: 0,
        }
    }

    /// The probe configuration.
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Record that a probe was written.
    pub fn on_sent(&mut self) {
        self.pending_since = Some(Instant::now());
    }

    /// Whether a probe is awaiting its response.
    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some()
    }

    /// When the outstanding probe times out, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending_since.map(|sent| sent + self.config.timeout)
    }

    /// Complete the outstanding probe because inbound data arrived.
    ///
    /// Returns `None` if no probe was pending.
    pub fn on_response(&mut self) -> Option<LatencySample> {
        let sent = self.pending_since.take()?;
        let rtt = sent.elapsed();
        self.consecutive_missed = 0;
        self.push_sample(rtt);
        Some(LatencySample::Measured(rtt))
    }

    /// Complete the outstanding probe as timed out.
    pub fn on_timeout(&mut self) -> Option<LatencySample> {
        self.pending_since.take()?;
        self.consecutive_missed += 1;
        self.push_sample(self.config.timeout);
        Some(LatencySample::TimedOut(self.config.timeout))
    }

    /// Record that the probe could not be written.
    pub fn on_send_failed(&mut self) -> LatencySample {
        self.pending_since = None;
        self.consecutive_missed += 1;
        LatencySample::SendFailed
    }

    /// Whether enough consecutive probes were missed to consider the link dead.
    pub fn is_unresponsive(&self) -> bool {
        self.config.max_missed > 0 && self.consecutive_missed >= self.config.max_missed
    }

    /// Consecutive missed probes.
    pub fn consecutive_missed(&self) -> u32 {
        self.consecutive_missed
    }

    /// Forget the outstanding probe and missed count (new connection).
    pub fn reset(&mut self) {
        self.pending_since = None;
        self.consecutive_missed = 0;
    }

    fn push_sample(&mut self, rtt: Duration) {
        if self.config.window_size == 0 {
            return;
        }
        if self.samples.len() >= self.config.window_size {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt);
    }

    /// Average latency over the rolling window.
    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: Duration = self.samples.iter().sum();
        Some(sum / self.samples.len() as u32)
    }

    /// Minimum latency in the rolling window.
    pub fn min(&self) -> Option<Duration> {
        self.samples.iter().min().copied()
    }

    /// Maximum latency in the rolling window.
    pub fn max(&self) -> Option<Duration> {
        self.samples.iter().max().copied()
    }

    /// Jitter: sample standard deviation of the rolling window.
    pub fn jitter(&self) -> Option<Duration> {
        if self.samples.len() < 2 {
            return None;
        }

        let avg = self.average()?.as_secs_f64();
        let variance: f64 = self
            .samples
            .iter()
            .map(|s| {
                let diff = s.as_secs_f64() - avg;
                diff * diff
            })
            .sum::<f64>()
            / (self.samples.len() - 1) as f64;

        Some(Duration::from_secs_f64(variance.sqrt()))
    }

    /// Number of samples in the rolling window.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Current window statistics.
    pub fn stats(&self) -> LatencyStats {
        LatencyStats {
            samples: self.samples.len(),
            average: self.average(),
            min: self.min(),
            max: self.max(),
            jitter: self.jitter(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(max_missed: u32, window_size: usize) -> LatencyProbe {
        LatencyProbe::new(ProbeConfig {
            max_missed,
            window_size,
            timeout: Duration::from_millis(250),
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_measures_elapsed_time() {
        let mut probe = probe(3, 8);
        probe.on_sent();
        tokio::time::advance(Duration::from_millis(40)).await;

        assert_eq!(
            probe.on_response(),
            Some(LatencySample::Measured(Duration::from_millis(40)))
        );
        assert!(!probe.is_pending());
        assert_eq!(probe.on_response(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_follows_timeout() {
        let mut probe = probe(3, 8);
        assert_eq!(probe.deadline(), None);
        let before = Instant::now();
        probe.on_sent();
        assert_eq!(probe.deadline(), Some(before + Duration::from_millis(250)));
    }

    #[test]
    fn test_timeouts_accumulate_until_unresponsive() {
        let mut probe = probe(3, 8);
        for expected in 1..=3 {
            probe.on_sent();
            assert_eq!(
                probe.on_timeout(),
                Some(LatencySample::TimedOut(Duration::from_millis(250)))
            );
            assert_eq!(probe.consecutive_missed(), expected);
        }
        assert!(probe.is_unresponsive());

        probe.on_sent();
        probe.on_response();
        assert!(!probe.is_unresponsive());
        assert_eq!(probe.consecutive_missed(), 0);
    }

    #[test]
    fn test_send_failure_is_sentinel() {
        let mut probe = probe(0, 8);
        assert_eq!(probe.on_send_failed(), LatencySample::SendFailed);
        assert_eq!(LatencySample::SendFailed.millis(), None);
        // max_missed = 0 disables the liveness check.
        assert!(!probe.is_unresponsive());
    }

    #[test]
    fn test_timeout_without_pending_probe_is_ignored() {
        let mut probe = probe(3, 8);
        assert_eq!(probe.on_timeout(), None);
        assert_eq!(probe.consecutive_missed(), 0);
    }

    #[test]
    fn test_rolling_window_statistics() {
        let mut probe = probe(3, 3);
        for ms in [10, 20, 30, 40] {
            probe.push_sample(Duration::from_millis(ms));
        }
        assert_eq!(probe.sample_count(), 3);
        assert_eq!(probe.min(), Some(Duration::from_millis(20)));
        assert_eq!(probe.max(), Some(Duration::from_millis(40)));
        assert_eq!(probe.average(), Some(Duration::from_millis(30)));

        let jitter_ms = probe.jitter().unwrap().as_secs_f64() * 1000.0;
        assert!((jitter_ms - 10.0).abs() < 0.5, "jitter {jitter_ms:.2}ms");
    }

    #[test]
    fn test_empty_probe_has_no_statistics() {
        let probe = probe(3, 8);
        assert!(probe.average().is_none());
        assert!(probe.min().is_none());
        assert!(probe.jitter().is_none());
        assert_eq!(probe.stats(), LatencyStats::default());
        assert_eq!(probe.stats().to_string(), "no samples");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_snapshot_includes_timeouts() {
        let mut probe = probe(3, 8);
        probe.on_sent();
        tokio::time::advance(Duration::from_millis(50)).await;
        probe.on_response();
        probe.on_sent();
        probe.on_timeout();

        let stats = probe.stats();
        assert_eq!(stats.samples, 2);
        assert_eq!(stats.min, Some(Duration::from_millis(50)));
        assert_eq!(stats.max, Some(Duration::from_millis(250)));
        assert_eq!(stats.average, Some(Duration::from_millis(150)));
        assert!(stats.jitter.is_some());
        assert!(stats.to_string().starts_with("avg 150 ms, min 50 ms, max 250 ms"));

        // Send failures are not round trips and leave the window alone.
        probe.on_send_failed();
        assert_eq!(probe.stats().samples, 2);
    }
}
