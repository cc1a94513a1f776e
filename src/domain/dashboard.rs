//! Read-model aggregates for the portfolio dashboard.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Current portfolio valuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioValue {
    pub value: f64,
    /// Change versus the previous valuation, in percent.
    pub percentage_change: f64,
    pub last_updated: DateTime<Utc>,
}

/// Percent change from `previous` to `current`; `0.0` when `previous` is zero.
pub fn percentage_change(previous: f64, current: f64) -> f64 {
    if previous == 0.0 {
        0.0
    } else {
        (current - previous) / previous * 100.0
    }
}

/// Severity label attached to a risk level. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskStatus {
    Low,
    Moderate,
    Elevated,
    High,
    Critical,
}

/// One row of the risk scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskLevel {
    pub level: u8,
    pub status: RiskStatus,
    pub description: &'static str,
}

/// The ordered risk scale. Higher indices are strictly more severe.
pub const RISK_SCALE: [RiskLevel; 5] = [
    RiskLevel {
        level: 1,
        status: RiskStatus::Low,
        description: "Exposure is well diversified with minimal drawdown risk.",
    },
    RiskLevel {
        level: 2,
        status: RiskStatus::Moderate,
        description: "Balanced exposure with some concentration in volatile pools.",
    },
    RiskLevel {
        level: 3,
        status: RiskStatus::Elevated,
        description: "Concentration in volatile pools is rising; monitor closely.",
    },
    RiskLevel {
        level: 4,
        status: RiskStatus::High,
        description: "Significant exposure to volatile pairs and impermanent loss.",
    },
    RiskLevel {
        level: 5,
        status: RiskStatus::Critical,
        description: "Severe concentration risk; rebalancing is recommended.",
    },
];

/// A risk reading drawn from [`RISK_SCALE`].
///
/// Only constructible from a scale position, so level, status, and
/// description always agree. Deserialization rejects triples that do not
/// match a scale row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRiskScore", into = "RawRiskScore")]
pub struct RiskScore {
    index: usize,
}

impl RiskScore {
    /// Build the score at `index` on the scale, clamped to the last row.
    pub fn from_scale(index: usize) -> Self {
        Self {
            index: index.min(RISK_SCALE.len() - 1),
        }
    }

    /// Build the score for a 1-based level, if it exists on the scale.
    pub fn from_level(level: u8) -> Option<Self> {
        RISK_SCALE
            .iter()
            .position(|row| row.level == level)
            .map(|index| Self { index })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn level(&self) -> u8 {
        RISK_SCALE[self.index].level
    }

    pub fn status(&self) -> RiskStatus {
        RISK_SCALE[self.index].status
    }

    pub fn description(&self) -> &'static str {
        RISK_SCALE[self.index].description
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRiskScore {
    level: u8,
    status: RiskStatus,
    description: String,
}

impl From<RiskScore> for RawRiskScore {
    fn from(score: RiskScore) -> Self {
        Self {
            level: score.level(),
            status: score.status(),
            description: score.description().to_string(),
        }
    }
}

impl TryFrom<RawRiskScore> for RiskScore {
    type Error = String;

    fn try_from(raw: RawRiskScore) -> Result<Self, Self::Error> {
        let score = RiskScore::from_level(raw.level)
            .ok_or_else(|| format!("risk level {} is not on the scale", raw.level))?;
        if score.status() != raw.status || score.description() != raw.description {
            return Err(format!(
                "risk level {} does not match status {:?}",
                raw.level, raw.status
            ));
        }
        Ok(score)
    }
}

/// Performance figure of one tracked asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetPerformance {
    pub symbol: String,
    pub name: String,
    /// Period performance, in percent.
    pub performance: f64,
}

impl AssetPerformance {
    pub fn new(symbol: impl Into<String>, name: impl Into<String>, performance: f64) -> Self {
        Self {
            symbol: symbol.into(),
            name: name.into(),
            performance,
        }
    }
}

/// Sort best first.
pub fn rank_top_performers(assets: &mut [AssetPerformance]) {
    assets.sort_by(|a, b| b.performance.total_cmp(&a.performance));
}

/// Sort worst first.
pub fn rank_underperformers(assets: &mut [AssetPerformance]) {
    assets.sort_by(|a, b| a.performance.total_cmp(&b.performance));
}

/// One point of the historical performance series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformancePoint {
    pub date: NaiveDate,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardOverview {
    pub portfolio: PortfolioValue,
    pub risk: RiskScore,
    pub top_performers: Vec<AssetPerformance>,
    pub underperformers: Vec<AssetPerformance>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardPerformance {
    /// Oldest point first.
    pub historical_performance: Vec<PerformancePoint>,
}
