//! Worker-count autoscaling.
//!
//! Observes queue depth and utilization and produces a desired worker count.
//! Demand is smoothed exponentially (`S_t = alpha * X_t + (1 - alpha) *
//! S_{t-1}`) and a least-squares trend over the recent window amplifies
//! scale-up when demand is rising. Scale-up is aggressive with a short
//! cooldown; scale-down is conservative with a long one. The target is
//! always clamped to the configured bounds.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct AutoscalerConfig {
    /// Smoothing factor for demand.
    pub alpha: f64,
    pub min_workers: u32,
    pub max_workers: u32,
    /// Samples kept for the trend regression.
    pub window: usize,
    /// Seconds-scale cooldown between scale-ups.
    pub up_cooldown: Duration,
    /// Minutes-scale cooldown between scale-downs.
    pub down_cooldown: Duration,
    /// How far ahead (in sample intervals) the trend projects on scale-up.
    pub trend_lookahead: f64,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            min_workers: 1,
            max_workers: 64,
            window: 12,
            up_cooldown: Duration::from_secs(15),
            down_cooldown: Duration::from_secs(300),
            trend_lookahead: 3.0,
        }
    }
}

/// Scaling decision emitted by [`Autoscaler::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Up(u32),
    Down(u32),
    Hold,
}

pub struct Autoscaler {
    config: AutoscalerConfig,
    smoothed: Option<f64>,
    samples: VecDeque<f64>,
    current_target: u32,
    last_up: Option<Instant>,
    last_down: Option<Instant>,
}

impl Autoscaler {
    pub fn new(config: AutoscalerConfig, initial_workers: u32) -> Self {
        let current_target = initial_workers.clamp(config.min_workers, config.max_workers);
        Self {
            config,
            smoothed: None,
            samples: VecDeque::new(),
            current_target,
            last_up: None,
            last_down: None,
        }
    }

    pub fn target(&self) -> u32 {
        self.current_target
    }

    /// Feed one observation and get the scaling decision.
    ///
    /// Demand is expressed in worker units: the number of busy workers plus
    /// the queued actions waiting for one.
    pub fn observe(&mut self, queue_depth: u32, busy_workers: u32, now: Instant) -> ScaleDecision {
        let demand = queue_depth as f64 + busy_workers as f64;

        let smoothed = match self.smoothed {
            Some(prev) => self.config.alpha * demand + (1.0 - self.config.alpha) * prev,
            None => demand,
        };
        self.smoothed = Some(smoothed);

        self.samples.push_back(demand);
        while self.samples.len() > self.config.window {
            self.samples.pop_front();
        }
        let slope = self.trend_slope();

        // Scale-up: trend-amplified projection of smoothed demand.
        let projected = smoothed + slope.max(0.0) * self.config.trend_lookahead;
        let up_target = (projected.ceil() as u32).clamp(self.config.min_workers, self.config.max_workers);
        if up_target > self.current_target && self.cooldown_ok(self.last_up, self.config.up_cooldown, now)
        {
            self.current_target = up_target;
            self.last_up = Some(now);
            tracing::info!(target = up_target, smoothed, slope, "autoscaler scaling up");
            return ScaleDecision::Up(up_target);
        }

        // Scale-down: conservative - only when smoothed demand sits well
        // below the current target, never while the trend is rising.
        let down_target =
            (smoothed.ceil() as u32).clamp(self.config.min_workers, self.config.max_workers);
        if slope <= 0.0
            && (down_target as f64) < self.current_target as f64 * 0.5
            && self.cooldown_ok(self.last_down, self.config.down_cooldown, now)
        {
            self.current_target = down_target;
            self.last_down = Some(now);
            tracing::info!(target = down_target, smoothed, "autoscaler scaling down");
            return ScaleDecision::Down(down_target);
        }

        ScaleDecision::Hold
    }

    fn cooldown_ok(&self, last: Option<Instant>, cooldown: Duration, now: Instant) -> bool {
        match last {
            Some(last) => now.duration_since(last) >= cooldown,
            None => true,
        }
    }

    /// Least-squares slope of the sample window, in demand units per sample.
    fn trend_slope(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let n_f = n as f64;
        let mean_x = (n_f - 1.0) / 2.0;
        let mean_y = self.samples.iter().sum::<f64>() / n_f;
        let mut num = 0.0;
        let mut den = 0.0;
        for (i, y) in self.samples.iter().enumerate() {
            let dx = i as f64 - mean_x;
            num += dx * (y - mean_y);
            den += dx * dx;
        }
        if den == 0.0 {
            0.0
        } else {
            num / den
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaler(min: u32, max: u32) -> Autoscaler {
        Autoscaler::new(
            AutoscalerConfig {
                min_workers: min,
                max_workers: max,
                up_cooldown: Duration::from_millis(0),
                down_cooldown: Duration::from_millis(0),
                ..AutoscalerConfig::default()
            },
            min,
        )
    }

    #[test]
    fn test_demand_spike_scales_up() {
        let mut scaler = scaler(1, 32);
        let now = Instant::now();
        let decision = scaler.observe(16, 1, now);
        assert!(matches!(decision, ScaleDecision::Up(t) if t > 1));
    }

    #[test]
    fn test_rising_trend_amplifies_target() {
        let mut flat = scaler(1, 64);
        let mut rising = scaler(1, 64);
        let now = Instant::now();

        for i in 0..8 {
            flat.observe(8, 0, now + Duration::from_secs(i));
            rising.observe((i * 3) as u32, 0, now + Duration::from_secs(i));
        }
        // Final demand equal; the rising series projects higher.
        let flat_final = flat.observe(21, 0, now + Duration::from_secs(9));
        let rising_final = rising.observe(21, 0, now + Duration::from_secs(9));
        let flat_target = match flat_final {
            ScaleDecision::Up(t) => t,
            _ => flat.target(),
        };
        let rising_target = match rising_final {
            ScaleDecision::Up(t) => t,
            _ => rising.target(),
        };
        assert!(rising_target >= flat_target);
    }

    #[test]
    fn test_scale_down_requires_sustained_low_demand() {
        let mut scaler = scaler(1, 64);
        let now = Instant::now();
        scaler.observe(32, 0, now);
        let high = scaler.target();
        assert!(high > 8);

        // One quiet sample is not enough: smoothing keeps demand up.
        let decision = scaler.observe(0, 0, now + Duration::from_secs(1));
        assert!(!matches!(decision, ScaleDecision::Down(_)) || scaler.target() > 1);

        // Sustained quiet eventually halves below the target and scales down.
        let mut scaled_down = false;
        for i in 2..30 {
            if let ScaleDecision::Down(t) = scaler.observe(0, 0, now + Duration::from_secs(i)) {
                assert!(t < high);
                scaled_down = true;
                break;
            }
        }
        assert!(scaled_down);
    }

    #[test]
    fn test_up_cooldown_blocks_rapid_scaling() {
        let mut scaler = Autoscaler::new(
            AutoscalerConfig {
                min_workers: 1,
                max_workers: 64,
                up_cooldown: Duration::from_secs(3600),
                ..AutoscalerConfig::default()
            },
            1,
        );
        let now = Instant::now();
        assert!(matches!(scaler.observe(16, 0, now), ScaleDecision::Up(_)));
        let first = scaler.target();
        // More demand immediately after: held by cooldown.
        assert_eq!(
            scaler.observe(64, 0, now + Duration::from_secs(1)),
            ScaleDecision::Hold
        );
        assert_eq!(scaler.target(), first);
    }

    #[test]
    fn test_target_clamped_to_bounds() {
        let mut scaler = scaler(2, 8);
        let now = Instant::now();
        scaler.observe(1000, 0, now);
        assert_eq!(scaler.target(), 8);

        for i in 1..40 {
            scaler.observe(0, 0, now + Duration::from_secs(i));
        }
        assert!(scaler.target() >= 2);
    }
}
