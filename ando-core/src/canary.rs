use serde::{Deserialize, Serialize};

/// A canary group fans a route out across multiple upstream versions
/// according to a traffic-splitting strategy. Unlike `Upstream.lb_type ==
/// "canary"`, a group can reference more than one upstream at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryGroup {
    pub group_id: String,
    pub strategy: CanaryStrategy,
    pub versions: Vec<VersionSpec>,
    #[serde(default)]
    pub desc: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanaryStrategy {
    Weighted,
    Percentage,
    Header { name: String },
    Cookie { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionSpec {
    pub version: String,
    pub upstream_id: String,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub percentage: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum CanaryValidationError {
    #[error("canary group has no versions")]
    Empty,
    #[error("weighted strategy requires a positive weight on every version")]
    MissingWeight,
    #[error("percentage strategy requires percentages summing to 100 (got {0})")]
    PercentageSum(f64),
    #[error("header/cookie strategy requires a non-empty name")]
    EmptyFieldName,
}

impl CanaryGroup {
    /// Validate the group's internal consistency. Does not check that
    /// referenced upstream ids exist — that is the watcher's job (C9),
    /// since it alone has visibility into the full candidate snapshot.
    pub fn validate(&self) -> Result<(), CanaryValidationError> {
        if self.versions.is_empty() {
            return Err(CanaryValidationError::Empty);
        }
        match &self.strategy {
            CanaryStrategy::Weighted => {
                if self.versions.iter().any(|v| v.weight.unwrap_or(0) == 0) {
                    return Err(CanaryValidationError::MissingWeight);
                }
            }
            CanaryStrategy::Percentage => {
                let sum: f64 = self.versions.iter().map(|v| v.percentage.unwrap_or(0.0)).sum();
                if (sum - 100.0).abs() > 0.01 {
                    return Err(CanaryValidationError::PercentageSum(sum));
                }
            }
            CanaryStrategy::Header { name } | CanaryStrategy::Cookie { name } => {
                if name.trim().is_empty() {
                    return Err(CanaryValidationError::EmptyFieldName);
                }
            }
        }
        Ok(())
    }

    pub fn upstream_ids(&self) -> impl Iterator<Item = &str> {
        self.versions.iter().map(|v| v.upstream_id.as_str())
    }
}
