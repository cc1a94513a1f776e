//! The dashboard event catalogue.
//!
//! Every payload here is a [`BusEvent`] of [`DashboardEvents`]. The names
//! and payload shapes double as the wire contract for a networked push
//! channel: [`WireEvent`] serializes any of them as
//! `{"type": "<event-name>", "data": {...}}`.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::{BusEvent, Dispatch, EventBus, EventMap};
use crate::domain::{
    AssetPerformance, PastProposal, PerformancePoint, Proposal, ProposalId, RiskScore, VoteChoice,
};
use crate::error::BusError;

/// Catalogue marker for the dashboard bus.
#[derive(Debug)]
pub struct DashboardEvents;

impl EventMap for DashboardEvents {}

/// Bus carrying the dashboard catalogue.
pub type DashboardBus = EventBus<DashboardEvents>;

impl EventBus<DashboardEvents> {
    /// Process-wide dashboard bus.
    ///
    /// Components take their bus by injection; this is only the default
    /// for callers that want every consumer on one shared stream.
    pub fn global() -> &'static DashboardBus {
        static GLOBAL: OnceLock<DashboardBus> = OnceLock::new();
        GLOBAL.get_or_init(DashboardBus::new)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioValueUpdated {
    pub portfolio_value: f64,
    pub percentage_change: f64,
    pub last_updated: DateTime<Utc>,
}

/// A new risk reading. The score carries level, status, and description as
/// one consistent triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RiskScoreChanged {
    pub score: RiskScore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceDataUpdated {
    pub historical_performance: Vec<PerformancePoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetPerformanceChanged {
    pub top_performers: Vec<AssetPerformance>,
    pub underperformers: Vec<AssetPerformance>,
}

/// The caller changed their vote. Carries the full active collection so
/// every consumer re-renders from the same snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteSubmitted {
    pub proposal_id: ProposalId,
    pub vote: Option<VoteChoice>,
    pub updated_proposals: Vec<Proposal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalUpdated {
    pub proposal: Proposal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProposal {
    pub proposal: Proposal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalClosed {
    pub proposal_id: ProposalId,
    pub past_proposal: PastProposal,
}

macro_rules! catalogue {
    ($($ty:ident => $name:literal),+ $(,)?) => {
        $(
            impl BusEvent<DashboardEvents> for $ty {
                const NAME: &'static str = $name;
            }
        )+

        /// Any catalogued event, in its wire form.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "type", content = "data")]
        pub enum WireEvent {
            $(
                #[serde(rename = $name)]
                $ty($ty),
            )+
        }

        impl WireEvent {
            /// The catalogue name of the wrapped event.
            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$ty(_) => $name,)+
                }
            }

            /// Emit the wrapped payload on `bus`.
            ///
            /// # Errors
            ///
            /// Propagates [`BusError`] from [`EventBus::emit`].
            pub fn publish(&self, bus: &DashboardBus) -> Result<Dispatch, BusError> {
                match self {
                    $(Self::$ty(payload) => bus.emit(payload),)+
                }
            }
        }

        $(
            impl From<$ty> for WireEvent {
                fn from(payload: $ty) -> Self {
                    Self::$ty(payload)
                }
            }
        )+

        /// Every event name in the catalogue.
        pub const EVENT_NAMES: &[&str] = &[$($name),+];
    };
}

catalogue! {
    PortfolioValueUpdated => "portfolio-value-updated",
    RiskScoreChanged => "risk-score-changed",
    PerformanceDataUpdated => "performance-data-updated",
    AssetPerformanceChanged => "asset-performance-changed",
    VoteSubmitted => "vote-submitted",
    ProposalUpdated => "proposal-updated",
    NewProposal => "new-proposal",
    ProposalClosed => "proposal-closed",
}

impl WireEvent {
    /// Encode as the JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if a payload cannot be serialized.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode one event from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] for unknown event names or payloads
    /// that do not match the named event.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
