//! Synthetic detection source for demos and tests.
//!
//! Produces one drifting "duck" per frame so that a receiver has something
//! visibly moving to react to.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::detection::DetectionObject;

const LABEL: &str = "duck";
const CENTER_Y: f64 = 0.5;
/// Horizontal jitter around the image centre.
const CENTER_X_SPREAD: f64 = 0.3;
const BOX_WIDTH: f64 = 0.2;
const BOX_HEIGHT: f64 = 0.3;
const MIN_SCORE: f64 = 0.7;
const MAX_SCORE: f64 = 0.95;

pub struct SyntheticDetector {
    rng: StdRng,
}

impl SyntheticDetector {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic sequence for reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Detections for the next frame.
    pub fn next_frame(&mut self) -> Vec<DetectionObject> {
        let cx = 0.5 + CENTER_X_SPREAD * (self.rng.gen::<f64>() - 0.5);
        let score = self.rng.gen_range(MIN_SCORE..=MAX_SCORE);
        vec![DetectionObject::from_center(
            LABEL,
            round_to_hundredths(score),
            (cx, CENTER_Y),
            (BOX_WIDTH, BOX_HEIGHT),
        )]
    }
}

impl Default for SyntheticDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn round_to_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
