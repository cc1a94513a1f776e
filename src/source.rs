//! The data-fetch boundary that seeds each synchronizer.
//!
//! A real deployment backs [`DataSource`] with HTTP calls. This crate ships
//! an in-memory [`SeedData`] snapshot, a [`ServiceSource`] that reads live
//! proposals from the voting service and live market data from a
//! [`MarketMirror`], and [`FlakySource`] for exercising failure and
//! latency paths.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};
use tokio::sync::watch;

use crate::domain::{
    AssetPerformance, DashboardOverview, DashboardPerformance, PastProposal, PerformancePoint,
    PortfolioValue, Proposal, ProposalId, ProposalResult, RiskScore, VoteChoice,
    rank_top_performers, rank_underperformers,
};
use crate::error::FetchError;
use crate::voting::VotingService;

/// Boxed future returned by [`DataSource`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Source of the initial snapshots a synchronizer loads on mount.
///
/// Every method may fail with a recoverable [`FetchError`].
pub trait DataSource: Send + Sync + 'static {
    fn active_proposals(&self) -> BoxFuture<'_, Result<Vec<Proposal>, FetchError>>;

    fn past_proposals(&self) -> BoxFuture<'_, Result<Vec<PastProposal>, FetchError>>;

    fn dashboard_overview(&self) -> BoxFuture<'_, Result<DashboardOverview, FetchError>>;

    fn dashboard_performance(&self) -> BoxFuture<'_, Result<DashboardPerformance, FetchError>>;
}

/// A complete, self-consistent starting snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedData {
    pub active: Vec<Proposal>,
    pub past: Vec<PastProposal>,
    pub overview: DashboardOverview,
    pub performance: DashboardPerformance,
}

fn days_before(today: NaiveDate, days: u64) -> NaiveDate {
    today.checked_sub_days(Days::new(days)).unwrap_or(today)
}

impl SeedData {
    /// Demo snapshot dated relative to today.
    pub fn demo() -> Self {
        let today = Utc::now().date_naive();
        const DAY: u64 = 86_400;

        let active = vec![
            Proposal::new(
                "prop-fee-tier",
                "Raise ETH/USDC pool fee to 0.35%",
                "Widen the fee tier on the ETH/USDC pool to compensate LPs for volatility.",
                "Fees",
            )
            .with_tally(420_000, 180_000, 500_000, 2_000_000)
            .with_time_remaining(2 * DAY + 4 * 3_600),
            Proposal::new(
                "prop-wsteth-collateral",
                "Accept wstETH as collateral",
                "Allow wstETH deposits as collateral at a 70% loan-to-value ratio.",
                "Listings",
            )
            .with_tally(150_000, 90_000, 400_000, 2_000_000)
            .with_time_remaining(5 * DAY),
            Proposal::new(
                "prop-lm-budget",
                "Fund liquidity mining for Q3",
                "Allocate 5% of the treasury to liquidity mining incentives.",
                "Treasury",
            )
            .with_tally(610_000, 420_000, 750_000, 2_500_000)
            .with_time_remaining(18 * 3_600),
        ];

        let past = vec![
            closed(
                "prop-oracle-switch",
                "Switch price oracle to TWAP",
                ProposalResult::Passed,
                Some(VoteChoice::For),
                "Risk",
                days_before(today, 6),
            ),
            closed(
                "prop-rebate",
                "Introduce maker rebates",
                ProposalResult::Failed,
                Some(VoteChoice::Against),
                "Fees",
                days_before(today, 13),
            ),
            closed(
                "prop-grants",
                "Create an ecosystem grants committee",
                ProposalResult::Failed,
                None,
                "Treasury",
                days_before(today, 21),
            ),
        ];

        let mut top_performers = vec![
            AssetPerformance::new("ETH", "Ethereum", 12.4),
            AssetPerformance::new("ARB", "Arbitrum", 8.7),
            AssetPerformance::new("OP", "Optimism", 5.1),
        ];
        rank_top_performers(&mut top_performers);
        let mut underperformers = vec![
            AssetPerformance::new("MATIC", "Polygon", -6.3),
            AssetPerformance::new("UNI", "Uniswap", -2.8),
        ];
        rank_underperformers(&mut underperformers);

        let values = [
            1_182_400.0,
            1_190_150.0,
            1_187_900.0,
            1_201_300.0,
            1_208_750.0,
            1_199_420.0,
            1_215_880.0,
            1_226_010.0,
            1_233_640.0,
            1_245_678.9,
        ];
        let historical_performance = values
            .iter()
            .enumerate()
            .map(|(i, &value)| PerformancePoint {
                date: days_before(today, (values.len() - 1 - i) as u64),
                value,
            })
            .collect();

        Self {
            active,
            past,
            overview: DashboardOverview {
                portfolio: PortfolioValue {
                    value: 1_245_678.9,
                    percentage_change: 0.98,
                    last_updated: Utc::now(),
                },
                risk: RiskScore::from_scale(1),
                top_performers,
                underperformers,
            },
            performance: DashboardPerformance {
                historical_performance,
            },
        }
    }
}

fn closed(
    id: &str,
    title: &str,
    result: ProposalResult,
    your_vote: Option<VoteChoice>,
    category: &str,
    date: NaiveDate,
) -> PastProposal {
    PastProposal {
        id: ProposalId::from(id),
        title: title.to_string(),
        result,
        your_vote,
        category: category.to_string(),
        date,
    }
}

fn ready<T: Send + 'static>(value: T) -> BoxFuture<'static, T> {
    Box::pin(std::future::ready(value))
}

impl DataSource for SeedData {
    fn active_proposals(&self) -> BoxFuture<'_, Result<Vec<Proposal>, FetchError>> {
        ready(Ok(self.active.clone()))
    }

    fn past_proposals(&self) -> BoxFuture<'_, Result<Vec<PastProposal>, FetchError>> {
        ready(Ok(self.past.clone()))
    }

    fn dashboard_overview(&self) -> BoxFuture<'_, Result<DashboardOverview, FetchError>> {
        ready(Ok(self.overview.clone()))
    }

    fn dashboard_performance(&self) -> BoxFuture<'_, Result<DashboardPerformance, FetchError>> {
        ready(Ok(self.performance.clone()))
    }
}

/// Market half of the dashboard: overview and performance.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    pub overview: DashboardOverview,
    pub performance: DashboardPerformance,
}

/// Latest market snapshot, shared by the feed that moves it and the
/// sources that serve it.
///
/// `Clone` is cheap; clones share one value. It outlives any single
/// generator run, so a restarted feed resumes from where the last one
/// stopped.
#[derive(Debug, Clone)]
pub struct MarketMirror {
    latest: Arc<watch::Sender<Arc<MarketSnapshot>>>,
}

impl MarketMirror {
    pub fn new(overview: DashboardOverview, performance: DashboardPerformance) -> Self {
        let (latest, _) = watch::channel(Arc::new(MarketSnapshot {
            overview,
            performance,
        }));
        Self {
            latest: Arc::new(latest),
        }
    }

    pub fn current(&self) -> Arc<MarketSnapshot> {
        Arc::clone(&self.latest.borrow())
    }

    /// Replace the shared snapshot.
    pub fn store(&self, overview: &DashboardOverview, performance: &DashboardPerformance) {
        self.latest.send_replace(Arc::new(MarketSnapshot {
            overview: overview.clone(),
            performance: performance.clone(),
        }));
    }
}

impl From<&SeedData> for MarketMirror {
    fn from(seed: &SeedData) -> Self {
        Self::new(seed.overview.clone(), seed.performance.clone())
    }
}

/// Reads proposals from the live [`VotingService`] and market data from a
/// [`MarketMirror`].
#[derive(Debug, Clone)]
pub struct ServiceSource {
    voting: VotingService,
    market: MarketMirror,
}

impl ServiceSource {
    pub fn new(voting: VotingService, market: MarketMirror) -> Self {
        Self { voting, market }
    }
}

impl DataSource for ServiceSource {
    fn active_proposals(&self) -> BoxFuture<'_, Result<Vec<Proposal>, FetchError>> {
        Box::pin(async move { self.voting.active_proposals().await.map_err(FetchError::from) })
    }

    fn past_proposals(&self) -> BoxFuture<'_, Result<Vec<PastProposal>, FetchError>> {
        Box::pin(async move { self.voting.past_proposals().await.map_err(FetchError::from) })
    }

    fn dashboard_overview(&self) -> BoxFuture<'_, Result<DashboardOverview, FetchError>> {
        ready(Ok(self.market.current().overview.clone()))
    }

    fn dashboard_performance(&self) -> BoxFuture<'_, Result<DashboardPerformance, FetchError>> {
        ready(Ok(self.market.current().performance.clone()))
    }
}

/// Wraps a source with injected latency and failures.
///
/// Each method call first sleeps for the configured delay, then fails with
/// [`FetchError::Unavailable`] while the failure budget lasts. The budget
/// counts individual calls, not whole snapshot loads.
#[derive(Debug)]
pub struct FlakySource<S> {
    inner: S,
    failures_left: AtomicUsize,
    delay: Duration,
}

impl<S: DataSource> FlakySource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Fail the next `calls` method calls.
    pub fn fail_next(self, calls: usize) -> Self {
        self.failures_left.store(calls, Ordering::SeqCst);
        self
    }

    /// Delay every call by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Add `calls` more failures to the budget.
    pub fn inject_failures(&self, calls: usize) {
        self.failures_left.fetch_add(calls, Ordering::SeqCst);
    }

    async fn gate(&self) -> Result<(), FetchError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let consumed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(FetchError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

impl<S: DataSource> DataSource for FlakySource<S> {
    fn active_proposals(&self) -> BoxFuture<'_, Result<Vec<Proposal>, FetchError>> {
        Box::pin(async move {
            self.gate().await?;
            self.inner.active_proposals().await
        })
    }

    fn past_proposals(&self) -> BoxFuture<'_, Result<Vec<PastProposal>, FetchError>> {
        Box::pin(async move {
            self.gate().await?;
            self.inner.past_proposals().await
        })
    }

    fn dashboard_overview(&self) -> BoxFuture<'_, Result<DashboardOverview, FetchError>> {
        Box::pin(async move {
            self.gate().await?;
            self.inner.dashboard_overview().await
        })
    }

    fn dashboard_performance(&self) -> BoxFuture<'_, Result<DashboardPerformance, FetchError>> {
        Box::pin(async move {
            self.gate().await?;
            self.inner.dashboard_performance().await
        })
    }
}
