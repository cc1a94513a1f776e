//! Composition root.
//!
//! [`Hub`] wires one bus, one voting service, one data source, one market
//! mirror and at most one running generator together. It is opened through
//! [`HubBuilder`].

use std::sync::Arc;

use crate::error::HubError;
use crate::events::DashboardBus;
use crate::generator::{GeneratorConfig, GeneratorHandle, StreamingGenerator};
use crate::source::{DataSource, MarketMirror, SeedData, ServiceSource};
use crate::sync::Synchronizer;
use crate::voting::{ProposalBook, VotingConfig, VotingService, spawn_voting_service};

/// A running dashboard backend.
///
/// `Clone` is cheap. All clones share the same bus, voting service, and
/// generator slot.
#[derive(Clone)]
pub struct Hub {
    bus: DashboardBus,
    voting: VotingService,
    source: Arc<dyn DataSource>,
    market: MarketMirror,
    generator_config: GeneratorConfig,
    generator: Arc<tokio::sync::Mutex<Option<GeneratorHandle>>>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("bus", &self.bus)
            .field("voting", &self.voting)
            .finish_non_exhaustive()
    }
}

impl Hub {
    pub fn builder() -> HubBuilder {
        HubBuilder::new()
    }

    pub fn bus(&self) -> &DashboardBus {
        &self.bus
    }

    pub fn voting(&self) -> &VotingService {
        &self.voting
    }

    pub fn source(&self) -> Arc<dyn DataSource> {
        Arc::clone(&self.source)
    }

    /// Market data as last published by the generator.
    pub fn market(&self) -> &MarketMirror {
        &self.market
    }

    /// Mount a new synchronizer on this hub's bus and source.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn mount(&self) -> Synchronizer {
        Synchronizer::mount(&self.bus, self.voting.clone(), self.source())
    }

    /// Start the streaming generator.
    ///
    /// The generator's mirror starts from the market as the previous run
    /// left it, or from the seed on the first run.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::GeneratorRunning`] if a generator started by
    /// this hub is still running.
    pub async fn start_generator(&self) -> Result<(), HubError> {
        let mut guard = self.generator.lock().await;
        if guard.as_ref().is_some_and(GeneratorHandle::is_running) {
            return Err(HubError::GeneratorRunning);
        }
        let generator = StreamingGenerator::new(
            self.bus.clone(),
            self.voting.clone(),
            self.market.clone(),
            self.generator_config.clone(),
        );
        *guard = Some(generator.start());
        Ok(())
    }

    /// Stop the generator and wait for it to exit.
    ///
    /// Returns `false` if no generator was running.
    pub async fn stop_generator(&self) -> bool {
        let handle = self.generator.lock().await.take();
        match handle {
            Some(handle) => {
                let was_running = handle.is_running();
                handle.stop().await;
                was_running
            }
            None => false,
        }
    }

    pub async fn generator_running(&self) -> bool {
        self.generator
            .lock()
            .await
            .as_ref()
            .is_some_and(GeneratorHandle::is_running)
    }

    /// Stop the generator, then the voting service.
    ///
    /// Synchronizers mounted on this hub keep their last state; votes
    /// through them fail with [`VoteError::ServiceGone`](crate::VoteError::ServiceGone).
    pub async fn shutdown(&self) {
        self.stop_generator().await;
        self.voting.shutdown().await;
        tracing::info!("hub shut down");
    }
}

/// Builder for a [`Hub`].
///
/// # Examples
///
/// ```no_run
/// use liquidity_live::{DashboardBus, Hub};
///
/// # async fn example() -> Result<(), liquidity_live::HubError> {
/// let hub = Hub::builder()
///     .bus(DashboardBus::new())
///     .vote_weight(25)
///     .autostart_generator(true)
///     .build()
///     .await?;
/// let dashboard = hub.mount();
/// let state = dashboard.loaded().await;
/// # Ok(())
/// # }
/// ```
pub struct HubBuilder {
    bus: Option<DashboardBus>,
    seed: Option<SeedData>,
    source: Option<Arc<dyn DataSource>>,
    generator_config: GeneratorConfig,
    voting_config: VotingConfig,
    autostart_generator: bool,
}

impl HubBuilder {
    /// Create a builder over the global bus and the demo seed.
    pub fn new() -> Self {
        Self {
            bus: None,
            seed: None,
            source: None,
            generator_config: GeneratorConfig::default(),
            voting_config: VotingConfig::default(),
            autostart_generator: false,
        }
    }

    /// Use `bus` instead of [`DashboardBus::global`].
    pub fn bus(mut self, bus: DashboardBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Seed proposals and dashboard snapshots. Defaults to [`SeedData::demo`].
    pub fn seed(mut self, seed: SeedData) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Serve synchronizer snapshots from `source`.
    ///
    /// Defaults to a [`ServiceSource`] over this hub's voting service and
    /// market mirror.
    pub fn source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn generator_config(mut self, config: GeneratorConfig) -> Self {
        self.generator_config = config;
        self
    }

    /// Weight applied to the caller's votes.
    pub fn vote_weight(mut self, weight: u64) -> Self {
        self.voting_config.vote_weight = weight;
        self
    }

    /// Start the generator as part of [`build`](HubBuilder::build).
    pub fn autostart_generator(mut self, autostart: bool) -> Self {
        self.autostart_generator = autostart;
        self
    }

    /// Spawn the voting service (and optionally the generator).
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Seed`] if the seed proposals are invalid.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub async fn build(self) -> Result<Hub, HubError> {
        let seed = self.seed.unwrap_or_else(SeedData::demo);
        let book = ProposalBook::new(seed.active.clone(), seed.past.clone())?;
        let voting = spawn_voting_service(book, self.voting_config);
        let market = MarketMirror::from(&seed);
        let source = self.source.unwrap_or_else(|| {
            Arc::new(ServiceSource::new(voting.clone(), market.clone()))
        });

        let hub = Hub {
            bus: self
                .bus
                .unwrap_or_else(|| DashboardBus::global().clone()),
            voting,
            source,
            market,
            generator_config: self.generator_config,
            generator: Arc::new(tokio::sync::Mutex::new(None)),
        };
        if self.autostart_generator {
            hub.start_generator().await?;
        }
        Ok(hub)
    }
}

impl Default for HubBuilder {
    fn default() -> Self {
        Self::new()
    }
}
