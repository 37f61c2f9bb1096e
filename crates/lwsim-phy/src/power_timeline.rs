//! Interference accounting for one (gateway, frequency) pair.
//!
//! Transmissions are stored in linear power and integrated exactly with a
//! sweep line, so every interferer counts in proportion to its real overlap
//! with the query window.

use lwsim_common::{EventId, SimTime};

/// One transmission's contribution to the received power.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerEntry {
    /// Transmission id.
    pub event_id: EventId,
    /// Start of the transmission.
    pub start: SimTime,
    /// End of the transmission (exclusive).
    pub end: SimTime,
    /// Received power in milliwatts.
    pub power_mw: f64,
}

/// Piecewise-constant received power on one frequency at one gateway.
#[derive(Debug, Clone, Default)]
pub struct PowerTimeline {
    entries: Vec<PowerEntry>,
}

impl PowerTimeline {
    /// Create an empty timeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transmission over `[start, end)`.
    pub fn add(&mut self, event_id: EventId, start: SimTime, end: SimTime, power_mw: f64) {
        self.entries.push(PowerEntry {
            event_id,
            start,
            end,
            power_mw,
        });
    }

    /// Drop every entry with `end <= horizon`. Returns how many were removed.
    pub fn prune(&mut self, horizon: SimTime) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.end > horizon);
        before - self.entries.len()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the timeline holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stored entries in insertion order.
    pub fn entries(&self) -> &[PowerEntry] {
        &self.entries
    }

    /// Power change schedule over `[t0, t1]`, ignoring `exclude`.
    ///
    /// Returns `(instant, level_mw)` steps: the level holds from each instant
    /// until the next one. The first step is always at `t0`.
    pub fn power_changes(
        &self,
        t0: SimTime,
        t1: SimTime,
        exclude: Option<EventId>,
    ) -> Vec<(SimTime, f64)> {
        let mut deltas: Vec<(SimTime, f64)> = Vec::new();
        let mut level_at_t0 = 0.0;
        for entry in self.entries.iter().filter(|e| Some(e.event_id) != exclude) {
            if entry.start <= t0 && t0 < entry.end {
                level_at_t0 += entry.power_mw;
            } else if t0 < entry.start && entry.start < t1 {
                deltas.push((entry.start, entry.power_mw));
            }
            if t0 < entry.end && entry.end < t1 {
                deltas.push((entry.end, -entry.power_mw));
            }
        }
        deltas.sort_by(|a, b| a.0.cmp(&b.0));

        let mut steps = vec![(t0, level_at_t0)];
        let mut level = level_at_t0;
        for (instant, delta) in deltas {
            level += delta;
            match steps.last_mut() {
                Some(last) if last.0 == instant => last.1 = level,
                _ => steps.push((instant, level)),
            }
        }
        for step in &mut steps {
            // Rounding residue from add/subtract must not go negative.
            step.1 = step.1.max(0.0);
        }
        steps
    }

    /// Time-averaged power over `[t0, t1]` plus `base_noise_mw`.
    pub fn average_power(&self, t0: SimTime, t1: SimTime, base_noise_mw: f64) -> f64 {
        self.average_power_inner(t0, t1, base_noise_mw, None)
    }

    /// Time-averaged power over `[t0, t1]` from every transmission except
    /// `exclude`, plus `base_noise_mw`.
    pub fn average_interference(
        &self,
        t0: SimTime,
        t1: SimTime,
        base_noise_mw: f64,
        exclude: EventId,
    ) -> f64 {
        self.average_power_inner(t0, t1, base_noise_mw, Some(exclude))
    }

    fn average_power_inner(
        &self,
        t0: SimTime,
        t1: SimTime,
        base_noise_mw: f64,
        exclude: Option<EventId>,
    ) -> f64 {
        let steps = self.power_changes(t0, t1, exclude);
        let span = (t1 - t0).as_secs();
        if span <= 0.0 {
            return base_noise_mw + steps.first().map(|s| s.1).unwrap_or(0.0);
        }

        let mut energy = 0.0;
        for (i, (instant, level)) in steps.iter().enumerate() {
            let next = steps.get(i + 1).map(|s| s.0).unwrap_or(t1);
            energy += level * (next - *instant).as_secs();
        }
        base_noise_mw + energy / span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: f64) -> SimTime {
        SimTime::from_secs(s)
    }

    #[test]
    fn test_empty_timeline_returns_noise() {
        let timeline = PowerTimeline::new();
        assert_eq!(timeline.average_power(t(0.0), t(1.0), 1e-12), 1e-12);
    }

    #[test]
    fn test_average_weights_by_overlap_duration() {
        let mut timeline = PowerTimeline::new();
        // 2 mW over the first quarter, 4 mW over the second half.
        timeline.add(EventId(1), t(0.0), t(0.25), 2.0);
        timeline.add(EventId(2), t(0.5), t(2.0), 4.0);

        let avg = timeline.average_power(t(0.0), t(1.0), 0.0);
        assert!((avg - (2.0 * 0.25 + 4.0 * 0.5)).abs() < 1e-12);
    }

    #[test]
    fn test_interference_excludes_own_signal() {
        let mut timeline = PowerTimeline::new();
        timeline.add(EventId(1), t(0.0), t(1.0), 10.0);
        timeline.add(EventId(2), t(0.5), t(1.5), 1.0);

        let avg = timeline.average_interference(t(0.0), t(1.0), 0.1, EventId(1));
        assert!((avg - (0.1 + 0.5)).abs() < 1e-12);
    }

    #[test]
    fn test_power_changes_schedule() {
        let mut timeline = PowerTimeline::new();
        timeline.add(EventId(1), t(0.0), t(2.0), 1.0);
        timeline.add(EventId(2), t(1.0), t(3.0), 2.0);
        timeline.add(EventId(3), t(2.0), t(4.0), 4.0);

        let steps = timeline.power_changes(t(0.5), t(3.5), None);
        assert_eq!(
            steps,
            vec![
                (t(0.5), 1.0),
                (t(1.0), 3.0),
                (t(2.0), 6.0),
                (t(3.0), 4.0),
            ]
        );
    }

    #[test]
    fn test_touching_intervals_do_not_overlap() {
        let mut timeline = PowerTimeline::new();
        timeline.add(EventId(1), t(0.0), t(1.0), 5.0);
        assert_eq!(timeline.average_power(t(1.0), t(2.0), 0.0), 0.0);
    }

    #[test]
    fn test_prune_removes_finished_entries() {
        let mut timeline = PowerTimeline::new();
        timeline.add(EventId(1), t(0.0), t(1.0), 1.0);
        timeline.add(EventId(2), t(0.5), t(2.0), 1.0);

        assert_eq!(timeline.prune(t(1.0)), 1);
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.entries()[0].event_id, EventId(2));
    }

    #[test]
    fn test_zero_length_window_reports_instantaneous_level() {
        let mut timeline = PowerTimeline::new();
        timeline.add(EventId(1), t(0.0), t(1.0), 3.0);
        assert_eq!(timeline.average_power(t(0.5), t(0.5), 1.0), 4.0);
    }
}
