pub mod candles;
pub mod collaborators;
pub mod connection;
pub mod dispatcher;
pub mod marks;
pub mod reconcile;
pub mod subscriptions;
pub mod types;
