//! Session parameter types for the profiling coordinator

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Profiling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileMode {
    Cpu,
    Wall,
    Object,
    Retained,
}

impl ProfileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileMode::Cpu => "cpu",
            ProfileMode::Wall => "wall",
            ProfileMode::Object => "object",
            ProfileMode::Retained => "retained",
        }
    }

    /// Default sampling interval in microseconds (object counts allocations).
    pub fn default_interval(&self) -> u32 {
        match self {
            ProfileMode::Cpu | ProfileMode::Wall | ProfileMode::Retained => 1000,
            ProfileMode::Object => 2000,
        }
    }

    /// Intervals below this would make the engine overhead dominate the
    /// profiled workload.
    pub fn min_interval(&self) -> u32 {
        match self {
            ProfileMode::Cpu | ProfileMode::Wall | ProfileMode::Retained => 200,
            ProfileMode::Object => 400,
        }
    }
}

impl FromStr for ProfileMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(ProfileMode::Cpu),
            "wall" => Ok(ProfileMode::Wall),
            "object" => Ok(ProfileMode::Object),
            "retained" => Ok(ProfileMode::Retained),
            _ => anyhow::bail!("invalid mode {}", s),
        }
    }
}

impl fmt::Display for ProfileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for one profiling session, handed to the sampling engine on
/// start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionParams {
    pub mode: ProfileMode,

    /// Sampling interval in microseconds. Always >= 1.
    pub interval: u32,

    /// Skip samples taken while the runtime is collecting garbage.
    pub ignore_gc: bool,

    /// Free-form metadata recorded into the resulting profile.
    pub metadata: Map<String, Value>,
}

impl SessionParams {
    /// Parameters with the mode's default interval.
    pub fn new(mode: ProfileMode) -> Self {
        Self {
            mode,
            interval: mode.default_interval(),
            ignore_gc: false,
            metadata: Map::new(),
        }
    }

    /// Parameters with a caller-chosen interval, clamped to the mode's
    /// minimum.
    pub fn with_interval(mode: ProfileMode, interval: u32) -> Self {
        Self {
            interval: interval.max(mode.min_interval()),
            ..Self::new(mode)
        }
    }
}

impl Default for SessionParams {
    fn default() -> Self {
        Self::new(ProfileMode::Cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_round_trips_through_str() {
        for mode in [
            ProfileMode::Cpu,
            ProfileMode::Wall,
            ProfileMode::Object,
            ProfileMode::Retained,
        ] {
            assert_eq!(mode, mode.as_str().parse().unwrap());
        }
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        assert!("unsupported_mode".parse::<ProfileMode>().is_err());
    }

    #[test]
    fn test_mode_parse_is_case_insensitive() {
        assert_eq!(ProfileMode::Wall, "WALL".parse().unwrap());
    }

    #[test]
    fn test_new_uses_mode_default_interval() {
        assert_eq!(1000, SessionParams::new(ProfileMode::Cpu).interval);
        assert_eq!(2000, SessionParams::new(ProfileMode::Object).interval);
    }

    #[test]
    fn test_with_interval_clamps_to_mode_minimum() {
        assert_eq!(200, SessionParams::with_interval(ProfileMode::Cpu, 1).interval);
        assert_eq!(400, SessionParams::with_interval(ProfileMode::Object, 50).interval);
        assert_eq!(5000, SessionParams::with_interval(ProfileMode::Wall, 5000).interval);
    }

    #[test]
    fn test_default_params_profile_cpu() {
        let params = SessionParams::default();
        assert_eq!(ProfileMode::Cpu, params.mode);
        assert!(!params.ignore_gc);
        assert!(params.metadata.is_empty());
    }
}
