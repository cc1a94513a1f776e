//! Runs the simulated feed for a few seconds and prints what a mounted
//! dashboard sees.
//!
//! ```text
//! RUST_LOG=liquidity_live=debug cargo run --example dashboard
//! ```

use std::time::Duration;

use liquidity_live::domain::VoteChoice;
use liquidity_live::events::{ProposalClosed, RiskScoreChanged};
use liquidity_live::{DashboardBus, GeneratorConfig, Hub, WireEvent};
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let hub = Hub::builder()
        .bus(DashboardBus::new())
        .vote_weight(25_000)
        .generator_config(GeneratorConfig {
            portfolio_interval: Duration::from_millis(300),
            risk_interval: Duration::from_millis(700),
            asset_interval: Duration::from_millis(500),
            performance_interval: Duration::from_secs(1),
            proposal_interval: Duration::from_millis(400),
            countdown_step_secs: 6 * 3_600,
            ..GeneratorConfig::default()
        })
        .autostart_generator(true)
        .build()
        .await?;

    let _closed = hub.bus().subscribe(|e: &ProposalClosed| {
        if let Ok(json) = WireEvent::from(e.clone()).to_json() {
            println!("wire: {json}");
        }
    });
    let _risk = hub.bus().subscribe(|e: &RiskScoreChanged| {
        println!(
            "risk -> level {} ({:?}): {}",
            e.score.level(),
            e.score.status(),
            e.score.description()
        );
    });

    let dashboard = hub.mount();
    let state = dashboard.loaded().await;
    println!("loaded: {:?}", state.status);

    let updated = dashboard
        .vote("prop-lm-budget", Some(VoteChoice::For))
        .await?;
    for proposal in &updated {
        let tally = proposal.tally();
        println!(
            "{:<40} for {:>5.1}%  against {:>5.1}%  quorum {:>5.1}%  {}",
            proposal.title,
            tally.for_percentage(),
            tally.against_percentage(),
            tally.quorum_progress(),
            proposal.time_remaining_label(),
        );
    }

    let mut updates = dashboard.updates();
    let deadline = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            Some(state) = updates.next() => {
                if let Some(overview) = &state.overview {
                    println!(
                        "portfolio ${:>14.2} ({:+.3}%)  top {}",
                        overview.portfolio.value,
                        overview.portfolio.percentage_change,
                        overview
                            .top_performers
                            .first()
                            .map_or("-", |a| a.symbol.as_str()),
                    );
                }
            }
        }
    }

    let state = dashboard.state();
    println!(
        "active: {}  past: {}",
        state.active_proposals.as_ref().map_or(0, |a| a.len()),
        state.past_proposals.as_ref().map_or(0, |p| p.len()),
    );

    dashboard.unmount();
    hub.shutdown().await;
    Ok(())
}
