//! Throughput-driven automatic tier selection.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::ladder::{QualityLadder, TierIndex};
use crate::config::AbrSection;

/// Bytes moved over the wire for one segment.
#[derive(Debug, Clone, Copy)]
pub struct ThroughputSample {
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Dual-EWMA bandwidth estimate; the pessimistic of the two wins.
#[derive(Debug, Clone)]
pub struct ThroughputEstimator {
    fast: Ewma,
    slow: Ewma,
    initial_bps: u64,
}

impl ThroughputEstimator {
    const FAST_HALF_LIFE_SECS: f64 = 2.0;
    const SLOW_HALF_LIFE_SECS: f64 = 10.0;
    const MIN_SAMPLE_BYTES: u64 = 16_000;
    const MIN_ELAPSED_MS: f64 = 0.5;

    pub fn new(initial_bps: u64) -> Self {
        Self {
            fast: Ewma::new(Self::FAST_HALF_LIFE_SECS),
            slow: Ewma::new(Self::SLOW_HALF_LIFE_SECS),
            initial_bps,
        }
    }

    pub fn push(&mut self, sample: ThroughputSample) {
        if sample.bytes < Self::MIN_SAMPLE_BYTES {
            return;
        }
        let elapsed_ms = (sample.elapsed.as_secs_f64() * 1000.0).max(Self::MIN_ELAPSED_MS);
        let bps = sample.bytes as f64 * 8000.0 / elapsed_ms;
        let weight = elapsed_ms / 1000.0;
        self.fast.add(weight, bps);
        self.slow.add(weight, bps);
    }

    pub fn estimate_bps(&self) -> u64 {
        let estimate = self.fast.estimate().min(self.slow.estimate());
        if estimate > 0.0 {
            estimate.round() as u64
        } else {
            self.initial_bps
        }
    }
}

#[derive(Debug, Clone)]
struct Ewma {
    alpha: f64,
    last: f64,
    total_weight: f64,
}

impl Ewma {
    fn new(half_life_secs: f64) -> Self {
        Self {
            alpha: f64::exp(0.5_f64.ln() / half_life_secs.max(0.001)),
            last: 0.0,
            total_weight: 0.0,
        }
    }

    fn add(&mut self, weight: f64, value: f64) {
        let adjusted = self.alpha.powf(weight.max(0.0));
        self.last = value * (1.0 - adjusted) + adjusted * self.last;
        self.total_weight += weight.max(0.0);
    }

    fn estimate(&self) -> f64 {
        if self.total_weight <= 0.0 {
            return 0.0;
        }
        let zero_factor = 1.0 - self.alpha.powf(self.total_weight);
        self.last / zero_factor.max(1e-6)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbrReason {
    MinInterval,
    UpSwitch,
    DownSwitch,
    AlreadyOptimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbrDecision {
    pub target: TierIndex,
    pub reason: AbrReason,
}

impl AbrDecision {
    pub fn changed(&self, current: TierIndex) -> bool {
        self.target != current
    }
}

#[derive(Debug, Clone)]
pub struct AbrController {
    safety_factor: f64,
    min_switch_interval: Duration,
    estimator: ThroughputEstimator,
    last_switch: Option<Instant>,
}

impl AbrController {
    pub fn new(config: &AbrSection) -> Self {
        Self {
            safety_factor: config.safety_factor.max(1.0),
            min_switch_interval: config.min_switch_interval(),
            estimator: ThroughputEstimator::new(config.initial_bandwidth_bps),
            last_switch: None,
        }
    }

    pub fn push_sample(&mut self, sample: ThroughputSample) {
        self.estimator.push(sample);
    }

    pub fn estimate_bps(&self) -> u64 {
        self.estimator.estimate_bps()
    }

    /// Highest tier whose bandwidth fits the current estimate, else the lowest.
    pub fn fitting_tier(&self, ladder: &QualityLadder) -> Option<TierIndex> {
        let budget = self.estimator.estimate_bps() as f64 / self.safety_factor;
        let tiers = ladder.tiers();
        tiers
            .iter()
            .filter(|tier| tier.bandwidth as f64 <= budget)
            .max_by_key(|tier| tier.bandwidth)
            .or_else(|| tiers.first())
            .map(|tier| tier.index)
    }

    pub fn decide(&mut self, ladder: &QualityLadder, current: TierIndex, now: Instant) -> AbrDecision {
        let interval_elapsed = self
            .last_switch
            .map_or(true, |at| now.duration_since(at) >= self.min_switch_interval);
        if !interval_elapsed {
            return AbrDecision {
                target: current,
                reason: AbrReason::MinInterval,
            };
        }
        let Some(target) = self.fitting_tier(ladder) else {
            return AbrDecision {
                target: current,
                reason: AbrReason::AlreadyOptimal,
            };
        };
        let bandwidth = |index: TierIndex| ladder.get(index).map_or(0, |tier| tier.bandwidth);
        let reason = match bandwidth(target).cmp(&bandwidth(current)) {
            std::cmp::Ordering::Greater => AbrReason::UpSwitch,
            std::cmp::Ordering::Less => AbrReason::DownSwitch,
            std::cmp::Ordering::Equal => {
                return AbrDecision {
                    target: current,
                    reason: AbrReason::AlreadyOptimal,
                }
            }
        };
        debug!(
            target: "ingest.abr",
            from = %current,
            to = %target,
            estimate_bps = self.estimator.estimate_bps(),
            ?reason,
            "abr switch"
        );
        self.last_switch = Some(now);
        AbrDecision { target, reason }
    }

    /// Records a switch made outside `decide`, such as a viewer pin.
    pub fn note_switch(&mut self, now: Instant) {
        self.last_switch = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ladder::TierCandidate;

    fn ladder() -> QualityLadder {
        QualityLadder::build(&[
            TierCandidate {
                bandwidth: 400_000,
                height: Some(240),
            },
            TierCandidate {
                bandwidth: 1_200_000,
                height: Some(480),
            },
            TierCandidate {
                bandwidth: 3_000_000,
                height: Some(720),
            },
        ])
        .0
    }

    fn config(initial: u64) -> AbrSection {
        AbrSection {
            safety_factor: 1.25,
            min_switch_interval_secs: 4.0,
            initial_bandwidth_bps: initial,
        }
    }

    fn sample(bps: u64, secs: u64) -> ThroughputSample {
        ThroughputSample {
            bytes: bps / 8 * secs,
            elapsed: Duration::from_secs(secs),
        }
    }

    #[test]
    fn estimator_uses_initial_until_samples_arrive() {
        let mut estimator = ThroughputEstimator::new(900_000);
        assert_eq!(estimator.estimate_bps(), 900_000);
        estimator.push(ThroughputSample {
            bytes: 100,
            elapsed: Duration::from_millis(10),
        });
        assert_eq!(estimator.estimate_bps(), 900_000);
        estimator.push(sample(4_000_000, 2));
        let estimate = estimator.estimate_bps();
        assert!((3_900_000..=4_100_000).contains(&estimate), "{estimate}");
    }

    #[test]
    fn estimator_reacts_pessimistically_to_drops() {
        let mut estimator = ThroughputEstimator::new(0);
        for _ in 0..5 {
            estimator.push(sample(8_000_000, 2));
        }
        estimator.push(sample(1_000_000, 2));
        assert!(estimator.estimate_bps() < 8_000_000);
    }

    #[test]
    fn initial_pick_respects_safety_factor() {
        let controller = AbrController::new(&config(1_600_000));
        assert_eq!(controller.fitting_tier(&ladder()), Some(TierIndex(1)));
        let starved = AbrController::new(&config(10_000));
        assert_eq!(starved.fitting_tier(&ladder()), Some(TierIndex(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn switches_respect_min_interval() {
        let ladder = ladder();
        let mut controller = AbrController::new(&config(500_000));
        let now = Instant::now();
        for _ in 0..4 {
            controller.push_sample(sample(10_000_000, 2));
        }
        let up = controller.decide(&ladder, TierIndex(0), now);
        assert_eq!(up.reason, AbrReason::UpSwitch);
        assert_eq!(up.target, TierIndex(2));

        for _ in 0..10 {
            controller.push_sample(sample(300_000, 2));
        }
        let held = controller.decide(&ladder, TierIndex(2), now + Duration::from_secs(1));
        assert_eq!(held.reason, AbrReason::MinInterval);
        assert!(!held.changed(TierIndex(2)));

        let down = controller.decide(&ladder, TierIndex(2), now + Duration::from_secs(5));
        assert_eq!(down.reason, AbrReason::DownSwitch);
        assert_eq!(down.target, TierIndex(0));
    }

    #[tokio::test(start_paused = true)]
    async fn pin_then_auto_resumes_switching() {
        let ladder = ladder();
        let mut controller = AbrController::new(&config(500_000));
        let now = Instant::now();
        controller.note_switch(now);
        for _ in 0..4 {
            controller.push_sample(sample(10_000_000, 2));
        }
        assert_eq!(
            controller.decide(&ladder, TierIndex(0), now).reason,
            AbrReason::MinInterval
        );
        let later = now + Duration::from_secs(4);
        assert_eq!(
            controller.decide(&ladder, TierIndex(0), later).target,
            TierIndex(2)
        );
    }
}
