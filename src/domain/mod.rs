//! Domain models shared by the voting service, the generator, and the
//! synchronizer.

mod dashboard;
mod proposal;

pub use dashboard::{
    AssetPerformance, DashboardOverview, DashboardPerformance, PerformancePoint, PortfolioValue,
    RISK_SCALE, RiskLevel, RiskScore, RiskStatus, percentage_change, rank_top_performers,
    rank_underperformers,
};
pub use proposal::{
    PastProposal, Proposal, ProposalId, ProposalResult, Tally, VoteChoice, decide_outcome,
    quorum_reached,
};
