// Sticky rate-threshold detector.
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Raised,
    Cleared,
    Unchanged,
}

/// Current detector state. Only one record exists; no history is kept.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyRecord {
    pub active: bool,
    /// When the current suspicion was raised, unix millis.
    pub since: Option<u64>,
    pub observed_rate: f64,
    pub threshold: f64,
    pub transitions: u64,
}

#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    threshold: f64,
    // Clear only once the rate falls to `threshold - hysteresis`.
    hysteresis: f64,
    record: AnomalyRecord,
}

impl AnomalyDetector {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            hysteresis: 0.0,
            record: AnomalyRecord {
                active: false,
                since: None,
                observed_rate: 0.0,
                threshold,
                transitions: 0,
            },
        }
    }

    pub fn with_hysteresis(mut self, band: f64) -> Self {
        self.hysteresis = if band.is_finite() { band.max(0.0) } else { 0.0 };
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn record(&self) -> AnomalyRecord {
        self.record
    }

    pub fn is_active(&self) -> bool {
        self.record.active
    }

    /// Feed one rate observation. Logs and counts only on a state change.
    pub fn evaluate(&mut self, rate_per_second: f64, now_ms: u64) -> Transition {
        self.record.observed_rate = rate_per_second;
        let transition = if !self.record.active && rate_per_second > self.threshold {
            self.record.active = true;
            self.record.since = Some(now_ms);
            Transition::Raised
        } else if self.record.active && rate_per_second <= self.threshold - self.hysteresis {
            self.record.active = false;
            self.record.since = None;
            Transition::Cleared
        } else {
            Transition::Unchanged
        };

        match transition {
            Transition::Raised => {
                self.record.transitions += 1;
                metrics::counter!("fleetwatch_anomaly_transitions_total", "state" => "raised")
                    .increment(1);
                tracing::warn!(
                    rate = rate_per_second,
                    threshold = self.threshold,
                    "message rate above threshold, possible denial of service"
                );
            }
            Transition::Cleared => {
                self.record.transitions += 1;
                metrics::counter!("fleetwatch_anomaly_transitions_total", "state" => "cleared")
                    .increment(1);
                tracing::info!(
                    rate = rate_per_second,
                    threshold = self.threshold,
                    "message rate back under threshold"
                );
            }
            Transition::Unchanged => {}
        }
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sustained_excess_raises_exactly_once() {
        let mut detector = AnomalyDetector::new(50.0);
        let rates = [10.0, 50.0, 51.0, 80.0, 120.0, 60.0];
        let transitions: Vec<_> = rates
            .iter()
            .enumerate()
            .map(|(tick, rate)| detector.evaluate(*rate, tick as u64 * 1_000))
            .collect();
        assert_eq!(
            transitions
                .iter()
                .filter(|t| **t == Transition::Raised)
                .count(),
            1
        );
        assert_eq!(transitions[2], Transition::Raised);
        assert_eq!(detector.record().since, Some(2_000));
        assert_eq!(detector.record().transitions, 1);
    }

    #[test]
    fn rate_equal_to_threshold_clears() {
        let mut detector = AnomalyDetector::new(50.0);
        assert_eq!(detector.evaluate(60.0, 0), Transition::Raised);
        assert_eq!(detector.evaluate(50.0, 1_000), Transition::Cleared);
        assert!(!detector.is_active());
        assert_eq!(detector.record().since, None);
        assert_eq!(detector.record().observed_rate, 50.0);
    }

    #[test]
    fn hysteresis_band_delays_clearing() {
        let mut detector = AnomalyDetector::new(50.0).with_hysteresis(10.0);
        assert_eq!(detector.evaluate(55.0, 0), Transition::Raised);
        assert_eq!(detector.evaluate(45.0, 1_000), Transition::Unchanged);
        assert_eq!(detector.evaluate(40.0, 2_000), Transition::Cleared);
        assert_eq!(detector.record().transitions, 2);
    }

    #[test]
    fn zero_threshold_raises_on_any_traffic() {
        let mut detector = AnomalyDetector::new(0.0);
        assert_eq!(detector.evaluate(0.0, 0), Transition::Unchanged);
        assert_eq!(detector.evaluate(1.0, 1), Transition::Raised);
    }
}
