use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// A checkpoint in the linking flow, always within `1..=7`.
///
/// Construction goes through [`Stage::clamped`], so an out-of-range value can
/// never be observed. Deserialization accepts integers, floats and numeric
/// strings and clamps the result; anything unparseable becomes
/// [`Stage::NOT_STARTED`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Stage(u8);

impl Stage {
    pub const NOT_STARTED: Stage = Stage(1);
    pub const TWO_FACTOR_ENABLED: Stage = Stage(2);
    pub const LINK_GENERATED: Stage = Stage(3);
    pub const CODE_ISSUED: Stage = Stage(4);
    pub const VERIFYING: Stage = Stage(5);
    pub const LINKED: Stage = Stage(6);
    pub const UNLINKED: Stage = Stage(7);

    pub const MIN: Stage = Stage::NOT_STARTED;
    pub const MAX: Stage = Stage::UNLINKED;

    pub fn clamped(value: i64) -> Self {
        Stage(value.clamp(Self::MIN.0 as i64, Self::MAX.0 as i64) as u8)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Stages 3 and 4 run inside the time-boxed waiting window.
    pub fn is_waiting(self) -> bool {
        self == Self::LINK_GENERATED || self == Self::CODE_ISSUED
    }

    pub fn label(self) -> &'static str {
        match self.0 {
            1 => "not-started",
            2 => "two-factor-enabled",
            3 => "link-generated",
            4 => "code-issued",
            5 => "verifying",
            6 => "linked",
            _ => "unlinked",
        }
    }
}

impl Default for Stage {
    fn default() -> Self {
        Self::NOT_STARTED
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Stage> for i64 {
    fn from(stage: Stage) -> Self {
        stage.0 as i64
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStage {
    Int(i64),
    Float(f64),
    Text(String),
}

impl<'de> Deserialize<'de> for Stage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let stage = match RawStage::deserialize(deserializer)? {
            RawStage::Int(value) => Stage::clamped(value),
            RawStage::Float(value) if value.is_finite() => Stage::clamped(value.trunc() as i64),
            RawStage::Float(_) => Stage::NOT_STARTED,
            RawStage::Text(text) => text
                .trim()
                .parse::<i64>()
                .map(Stage::clamped)
                .unwrap_or(Stage::NOT_STARTED),
        };
        Ok(stage)
    }
}
