use std::sync::Arc;

pub trait QueryCacheInvalidator: Send + Sync {
    fn invalidate_pool(&self, pool_id: &str);
}

pub trait WalletProvider: Send + Sync {
    fn current_address(&self) -> Option<String>;
}

pub trait LaunchpadProvider: Send + Sync {
    /// `None` means every launchpad is enabled.
    fn enabled_launchpads(&self) -> Option<Vec<String>>;
}

#[derive(Debug, Default)]
pub struct NoopCacheInvalidator;

impl QueryCacheInvalidator for NoopCacheInvalidator {
    fn invalidate_pool(&self, _pool_id: &str) {}
}

#[derive(Debug, Default, Clone)]
pub struct StaticWallet(pub Option<String>);

impl WalletProvider for StaticWallet {
    fn current_address(&self) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Debug, Default, Clone)]
pub struct StaticLaunchpads(pub Option<Vec<String>>);

impl LaunchpadProvider for StaticLaunchpads {
    fn enabled_launchpads(&self) -> Option<Vec<String>> {
        self.0.clone()
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub cache: Arc<dyn QueryCacheInvalidator>,
    pub wallet: Arc<dyn WalletProvider>,
    pub launchpads: Arc<dyn LaunchpadProvider>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            cache: Arc::new(NoopCacheInvalidator),
            wallet: Arc::new(StaticWallet::default()),
            launchpads: Arc::new(StaticLaunchpads::default()),
        }
    }
}
