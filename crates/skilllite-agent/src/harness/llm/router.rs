//! Profile-based model tier selection: start cheap, escalate to a larger
//! model when the error-recovery middleware gives up on the current one.

use std::sync::Arc;

use super::client::{AsyncLlmClient, ProfileSpec};

/// Tracks the active tier for one [`ProfileSpec`] and hands out the
/// matching model name. Tier 0 is the smallest/cheapest model.
pub struct ModelRouter {
    profile: ProfileSpec,
    client: Arc<AsyncLlmClient>,
    tier: usize,
}

impl ModelRouter {
    pub fn new(profile: ProfileSpec) -> Self {
        let client = Arc::new(AsyncLlmClient::new(profile.clone()));
        Self { profile, client, tier: 0 }
    }

    pub fn with_client(profile: ProfileSpec, client: Arc<AsyncLlmClient>) -> Self {
        Self { profile, client, tier: 0 }
    }

    pub fn get_client(&self) -> Arc<AsyncLlmClient> {
        self.client.clone()
    }

    pub fn profile(&self) -> &ProfileSpec {
        &self.profile
    }

    pub fn model_for_tier(&self, tier: usize) -> String {
        self.profile.model_for_tier(tier)
    }

    pub fn current_tier(&self) -> usize {
        self.tier
    }

    pub fn current_model(&self) -> String {
        self.model_for_tier(self.tier)
    }

    /// Move to the next larger tier. Returns `false` if already at the top.
    pub fn escalate(&mut self) -> bool {
        if self.tier + 1 >= self.profile.tier_count() {
            return false;
        }
        self.tier += 1;
        true
    }

    pub fn reset_tier(&mut self) {
        self.tier = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(models: Vec<&str>) -> ProfileSpec {
        ProfileSpec {
            url: "http://localhost:11434/v1".into(),
            api_key: String::new(),
            api_type: super::super::client::ApiType::Ollama,
            extra_params: serde_json::Map::new(),
            models: models.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn escalate_steps_through_tiers_and_stops_at_top() {
        let mut router = ModelRouter::new(profile(vec!["small", "medium", "large"]));
        assert_eq!(router.current_model(), "small");
        assert!(router.escalate());
        assert_eq!(router.current_model(), "medium");
        assert!(router.escalate());
        assert_eq!(router.current_model(), "large");
        assert!(!router.escalate());
        assert_eq!(router.current_model(), "large");
    }

    #[test]
    fn reset_tier_returns_to_zero() {
        let mut router = ModelRouter::new(profile(vec!["small", "large"]));
        router.escalate();
        router.reset_tier();
        assert_eq!(router.current_tier(), 0);
    }
}
