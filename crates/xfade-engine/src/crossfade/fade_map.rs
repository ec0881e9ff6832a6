use serde::Deserialize;

pub const DEFAULT_KNEE_LOCATION: f64 = 0.25;
pub const DEFAULT_LEVEL_AT_KNEE: f64 = 0.75;

/// Shapes the calculator's linear volume ramp before it is applied to a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FadeMap {
    #[default]
    Linear,
    /// Piecewise linear through `(0, 0)`, `(knee, level)` and `(1, 1)`; keeps both tracks loud
    /// through the middle of the fade.
    Knee { knee: f64, level: f64 },
}

impl FadeMap {
    pub fn knee() -> Self {
        FadeMap::Knee {
            knee: DEFAULT_KNEE_LOCATION,
            level: DEFAULT_LEVEL_AT_KNEE,
        }
    }

    pub fn map(&self, volume: f64) -> f64 {
        match *self {
            FadeMap::Linear => volume,
            FadeMap::Knee { knee, level } => {
                if knee <= 0.0 || knee >= 1.0 {
                    return volume;
                }
                if volume < knee {
                    volume / knee * level
                } else {
                    level + (volume - knee) / (1.0 - knee) * (1.0 - level)
                }
            }
        }
    }
}
