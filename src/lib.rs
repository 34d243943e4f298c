pub mod engine;
pub mod error;
pub mod market;
pub mod state;

pub use engine::StreamEngine;
pub use error::AppError;
pub use market::collaborators::{
    Collaborators, LaunchpadProvider, QueryCacheInvalidator, WalletProvider,
};
pub use market::types::{StartStreamArgs, StreamConfig};
pub use state::{MarketViews, ViewHandle};
