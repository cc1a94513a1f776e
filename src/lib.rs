//! Live-update core for a liquidity-pool governance dashboard.
//!
//! A typed [`EventBus`] carries the dashboard event catalogue. A
//! [`StreamingGenerator`] simulates the server push channel by publishing
//! market and proposal events on timers. The [`VotingService`] owns the
//! authoritative proposal book. Each mounted [`Synchronizer`] merges the
//! event stream into an immutable [`DashboardState`] for its observers.
//! [`Hub`] wires the pieces together.

mod bus;
pub mod domain;
mod error;
pub mod events;
mod generator;
mod hub;
mod source;
mod sync;
mod voting;

pub use bus::{BusEvent, Dispatch, EventBus, EventMap, MAX_EMIT_DEPTH, Subscription};
pub use error::{BusError, FetchError, HubError, VoteError};
pub use events::{DashboardBus, DashboardEvents, EVENT_NAMES, WireEvent};
pub use generator::{
    FeedState, GeneratorConfig, GeneratorHandle, OutsideVotes, StreamingGenerator, rerank_assets,
};
pub use hub::{Hub, HubBuilder};
pub use source::{
    BoxFuture, DataSource, FlakySource, MarketMirror, MarketSnapshot, SeedData, ServiceSource,
};
pub use sync::{DashboardState, LoadStatus, MAX_PENDING, SyncEvent, Synchronizer, reduce};
pub use voting::{ProposalBook, VotingConfig, VotingService, spawn_voting_service};
