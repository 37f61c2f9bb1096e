//! Node mobility models.

use lwsim_common::{Position, SimRng};
use lwsim_model::MobilityDef;
use rand::Rng;

/// Moves a node between `Mobility` events.
pub trait MobilityModel: Send {
    /// Seconds between steps, or `None` for a model that never moves.
    fn interval_s(&self) -> Option<f64>;

    /// Next position given the current one.
    fn step(&mut self, position: Position, rng: &mut SimRng) -> Position;
}

/// A node that stays put.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticMobility;

impl MobilityModel for StaticMobility {
    fn interval_s(&self) -> Option<f64> {
        None
    }

    fn step(&mut self, position: Position, _rng: &mut SimRng) -> Position {
        position
    }
}

/// Random direction and distance per step, clamped to a rectangle.
#[derive(Debug, Clone, Copy)]
pub struct RandomWalk {
    step_m: f64,
    interval_s: f64,
    min: Position,
    max: Position,
}

impl RandomWalk {
    /// Create a walk inside `[min_x, min_y, max_x, max_y]`.
    pub fn new(step_m: f64, interval_s: f64, bounds: [f64; 4]) -> Self {
        RandomWalk {
            step_m,
            interval_s,
            min: Position::new(bounds[0], bounds[1]),
            max: Position::new(bounds[2], bounds[3]),
        }
    }
}

impl MobilityModel for RandomWalk {
    fn interval_s(&self) -> Option<f64> {
        Some(self.interval_s)
    }

    fn step(&mut self, position: Position, rng: &mut SimRng) -> Position {
        let angle = rng.gen_range(0.0..std::f64::consts::TAU);
        let distance = if self.step_m > 0.0 {
            rng.gen_range(0.0..=self.step_m)
        } else {
            0.0
        };
        Position::new(
            (position.x + distance * angle.cos()).clamp(self.min.x, self.max.x),
            (position.y + distance * angle.sin()).clamp(self.min.y, self.max.y),
        )
    }
}

/// Build the model described by a node definition.
pub fn from_def(def: &MobilityDef) -> Box<dyn MobilityModel> {
    match def {
        MobilityDef::Static => Box::new(StaticMobility),
        MobilityDef::RandomWalk {
            step_m,
            interval_s,
            bounds,
        } => Box::new(RandomWalk::new(*step_m, *interval_s, *bounds)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lwsim_common::seeded_rng;

    #[test]
    fn test_static_never_moves() {
        let mut model = from_def(&MobilityDef::Static);
        let mut rng = seeded_rng(1);
        let p = Position::new(3.0, 4.0);
        assert!(model.interval_s().is_none());
        assert_eq!(model.step(p, &mut rng), p);
    }

    #[test]
    fn test_random_walk_stays_in_bounds() {
        let mut walk = RandomWalk::new(50.0, 10.0, [0.0, 0.0, 100.0, 100.0]);
        let mut rng = seeded_rng(7);
        let mut p = Position::new(50.0, 50.0);
        for _ in 0..1_000 {
            let next = walk.step(p, &mut rng);
            assert!(p.distance_to(&next) <= 50.0 + 1e-9);
            assert!((0.0..=100.0).contains(&next.x));
            assert!((0.0..=100.0).contains(&next.y));
            p = next;
        }
    }
}
