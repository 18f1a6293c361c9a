//! Row shapes shared by several areas of the relational store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::StoreError;

/// Health of an external dependency (knowledge provider, remote tool server).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(HealthState::Unknown),
            "healthy" => Ok(HealthState::Healthy),
            "unhealthy" => Ok(HealthState::Unhealthy),
            other => Err(StoreError::Serialization {
                reason: format!("unknown health state '{other}'"),
            }),
        }
    }
}

/// Generic AI configuration row (`ai_configs`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRow {
    pub key: String,
    /// Raw JSON text, placeholders unexpanded.
    pub value: String,
    pub enabled: bool,
    pub updated_at: i64,
}

/// Optimization configuration row (`ai_optimization_configs`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationConfigRow {
    pub config_type: String,
    pub config_key: String,
    pub value: String,
    pub enabled: bool,
    pub updated_at: i64,
}

/// Last recorded health probe for a provider or server.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HealthRecord {
    pub state: HealthState,
    /// Unix milliseconds of the last probe.
    pub last_check_at: Option<i64>,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_state_parse() {
        assert_eq!("healthy".parse::<HealthState>().unwrap(), HealthState::Healthy);
        assert!("sick".parse::<HealthState>().is_err());
        assert_eq!(HealthState::default(), HealthState::Unknown);
    }
}
