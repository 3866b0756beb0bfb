// =============================================================================
// Direction selection — one symmetric threshold for both sides
// =============================================================================
//
// A signed score (positive favours LONG, negative favours SHORT) passes for a
// side when `side.sign() * score >= entry_threshold`. The same threshold
// applies to both sides; there is no per-side offset.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::Side;

fn default_entry_threshold() -> f64 {
    0.6
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DirectionThreshold {
    #[serde(default = "default_entry_threshold")]
    pub entry_threshold: f64,
}

impl Default for DirectionThreshold {
    fn default() -> Self {
        Self {
            entry_threshold: default_entry_threshold(),
        }
    }
}

impl DirectionThreshold {
    /// A non-positive threshold would let both sides pass a zero score.
    pub fn validate(&self) -> EngineResult<()> {
        if !self.entry_threshold.is_finite() || self.entry_threshold <= 0.0 {
            return Err(EngineError::InvalidRiskParameter(format!(
                "entry_threshold must be positive, got {}",
                self.entry_threshold
            )));
        }
        Ok(())
    }
}

pub fn side_passes(side: Side, score: f64, threshold: &DirectionThreshold) -> bool {
    score.is_finite() && side.sign() * score >= threshold.entry_threshold
}

/// Pick the side a score supports, if any.
pub fn select_side(score: f64, threshold: &DirectionThreshold) -> Option<Side> {
    [Side::Long, Side::Short]
        .into_iter()
        .find(|side| side_passes(*side, score, threshold))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirrored_scores_select_mirrored_sides() {
        let t = DirectionThreshold::default();
        for score in [0.0, 0.3, 0.59, 0.6, 0.61, 0.9, 1.0] {
            let long = select_side(score, &t);
            let short = select_side(-score, &t);
            match long {
                Some(Side::Long) => assert_eq!(short, Some(Side::Short), "score {score}"),
                None => assert_eq!(short, None, "score {score}"),
                Some(Side::Short) => panic!("positive score chose SHORT"),
            }
        }
    }

    #[test]
    fn threshold_is_inclusive() {
        let t = DirectionThreshold { entry_threshold: 0.5 };
        assert_eq!(select_side(0.5, &t), Some(Side::Long));
        assert_eq!(select_side(-0.5, &t), Some(Side::Short));
        assert_eq!(select_side(0.49, &t), None);
        assert_eq!(select_side(f64::NAN, &t), None);
    }

    #[test]
    fn non_positive_threshold_is_invalid() {
        assert!(DirectionThreshold { entry_threshold: 0.0 }.validate().is_err());
        assert!(DirectionThreshold { entry_threshold: -0.2 }.validate().is_err());
        assert!(DirectionThreshold::default().validate().is_ok());
    }
}
