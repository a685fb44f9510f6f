//! Builds the backend pair the router and session manager share.

use crate::api::ApiBackend;
use crate::browser::BrowserBackend;
use crate::mock::{MockAuthenticator, MockBackend};
use crate::webdriver::WebDriverClient;
use cadence_core::{Authenticator, Backend, BackendIdentity, Config, Result};
use cadence_telemetry::DataSanitizer;
use std::sync::Arc;
use tracing::debug;

/// Both backends plus the one that can log in. In the live set the
/// authenticator and the primary backend are the same object.
pub struct BackendSet {
    pub primary: Arc<dyn Backend>,
    pub secondary: Arc<dyn Backend>,
    pub authenticator: Arc<dyn Authenticator>,
}

impl BackendSet {
    pub fn backends(&self) -> Vec<Arc<dyn Backend>> {
        vec![self.primary.clone(), self.secondary.clone()]
    }
}

pub struct BackendFactory;

impl BackendFactory {
    /// Browser backend over WebDriver plus the direct-API backend.
    pub fn live(config: &Config, sanitizer: DataSanitizer) -> Result<BackendSet> {
        let driver = Arc::new(WebDriverClient::new(config.backends.browser.clone())?);
        let browser = Arc::new(
            BrowserBackend::new(
                config.backends.browser.clone(),
                config.auth.clone(),
                driver,
            )
            .with_sanitizer(sanitizer.clone()),
        );
        let api = Arc::new(ApiBackend::new(config.backends.api.clone()).with_sanitizer(sanitizer));

        debug!(
            webdriver_url = %config.backends.browser.webdriver_url,
            api_base_url = %config.backends.api.base_url,
            "Built live backends"
        );
        Ok(BackendSet {
            primary: browser.clone(),
            secondary: api,
            authenticator: browser,
        })
    }

    /// In-memory backends with sample data.
    pub fn offline() -> BackendSet {
        BackendSet {
            primary: Arc::new(MockBackend::with_sample_data(BackendIdentity::Primary)),
            secondary: Arc::new(MockBackend::with_sample_data(BackendIdentity::Secondary)),
            authenticator: Arc::new(MockAuthenticator::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_set_identities() {
        let set = BackendFactory::live(&Config::default(), DataSanitizer::default()).unwrap();
        assert_eq!(set.primary.identity(), BackendIdentity::Primary);
        assert_eq!(set.secondary.identity(), BackendIdentity::Secondary);
        assert_eq!(set.authenticator.name(), "browser");
        assert!(!set.primary.is_initialized());
    }

    #[test]
    fn test_offline_set() {
        let set = BackendFactory::offline();
        let identities: Vec<_> = set.backends().iter().map(|b| b.identity()).collect();
        assert_eq!(
            identities,
            vec![BackendIdentity::Primary, BackendIdentity::Secondary]
        );
        assert_eq!(set.authenticator.name(), "mock");
    }
}
