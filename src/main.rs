use launchpad_stream::market::types::{Category, InboundMessage, MessageTag};
use launchpad_stream::{AppError, Collaborators, StartStreamArgs, StreamEngine};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SUMMARY_INTERVAL_MS: u64 = 10_000;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("launchpad_stream=info")),
        )
        .init();

    let config = StartStreamArgs::default().normalize()?;
    info!(endpoint = %config.endpoint_url, "starting launchpad stream");

    let engine = StreamEngine::new(config, Collaborators::default());
    for category in [
        Category::Recent,
        Category::AboutToGraduate,
        Category::Graduated,
    ] {
        engine.load_list(category, Vec::new());
    }
    engine.register_listener(&[MessageTag::Actions], |_, message| {
        if let InboundMessage::Actions(trades) = message {
            info!(trades = trades.len(), "received trade batch");
        }
        Ok(())
    });
    engine.subscribe_recent_enabled()?;
    engine.start().await?;

    let mut ticker = tokio::time::interval(Duration::from_millis(SUMMARY_INTERVAL_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("ctrl-c received; shutting down");
                break;
            }
            _ = ticker.tick() => {
                let status = engine.status().await;
                let views = engine.snapshot();
                let list_len = |category: Category| {
                    views.lists.get(category).map_or(0, |list| list.pools.len())
                };
                info!(
                    state = ?status.state,
                    messages = status.messages_received,
                    reconnects = status.reconnects,
                    recent = list_len(Category::Recent),
                    about_to_graduate = list_len(Category::AboutToGraduate),
                    graduated = list_len(Category::Graduated),
                    prices = views.prices.len(),
                    "stream summary"
                );
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
