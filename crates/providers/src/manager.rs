//! Provider selection and usage tracking.
//!
//! The runtime consumes the [`ProviderManager`] contract; failover between
//! real providers is the manager's job, the orchestrator only reads the
//! `failed_over` hint and prepends a one-line notice.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use cg_domain::error::{Error, Result};
use cg_domain::tool::Usage;

use crate::tiering::MessageTier;
use crate::traits::LlmProvider;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Selection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The provider/model pair chosen for one request.
#[derive(Clone)]
pub struct ProviderSelection {
    pub provider: Arc<dyn LlmProvider>,
    pub model: String,
    /// True when the preferred provider was unavailable and a fallback was
    /// substituted.
    pub failed_over: bool,
    /// The provider that was originally preferred, when `failed_over`.
    pub original_provider: Option<String>,
}

impl std::fmt::Debug for ProviderSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSelection")
            .field("model", &self.model)
            .field("failed_over", &self.failed_over)
            .field("original_provider", &self.original_provider)
            .finish()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Consumed by the orchestrator and sub-agent manager.
pub trait ProviderManager: Send + Sync {
    /// Default provider/model for a user.
    fn get_for_user(&self, user_id: &str) -> Result<ProviderSelection>;

    /// Tier-routed provider/model for a user. Falls back to the default
    /// selection when the tier has no mapping.
    fn get_for_user_tiered(&self, user_id: &str, tier: MessageTier) -> Result<ProviderSelection>;

    /// Whether tier routing is configured at all.
    fn is_tier_enabled(&self) -> bool;

    /// Record token usage for accounting. Never fails the request path.
    fn track_usage(&self, provider: &str, model: &str, usage: Usage, tier: Option<MessageTier>);

    /// Resolve a `"provider/model"` spec, e.g. for a sub-agent's preferred
    /// model override. Unknown providers return an error.
    fn resolve_spec(&self, spec: &str) -> Result<ProviderSelection>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct UsageCounters {
    input_tokens: u64,
    output_tokens: u64,
    requests: u64,
}

/// An in-memory [`ProviderManager`].
///
/// Providers register under their id; the default and per-tier mappings are
/// `"provider/model"` specs. When the default provider is missing (e.g.
/// deregistered after a health failure) the first registered provider is
/// substituted and the selection is marked `failed_over`.
pub struct ProviderRegistry {
    providers: RwLock<Vec<(String, Arc<dyn LlmProvider>)>>,
    default_spec: RwLock<Option<String>>,
    tier_specs: RwLock<HashMap<MessageTier, String>>,
    usage: RwLock<HashMap<String, UsageCounters>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            default_spec: RwLock::new(None),
            tier_specs: RwLock::new(HashMap::new()),
            usage: RwLock::new(HashMap::new()),
        }
    }

    /// Register a provider. The first registration becomes the default
    /// unless a default spec is set explicitly.
    pub fn register(&self, provider: Arc<dyn LlmProvider>, default_model: &str) {
        let id = provider.provider_id().to_string();
        let spec = format!("{id}/{default_model}");
        let mut providers = self.providers.write();
        providers.retain(|(pid, _)| pid != &id);
        providers.push((id, provider));
        let mut default = self.default_spec.write();
        if default.is_none() {
            *default = Some(spec);
        }
    }

    pub fn set_default_spec(&self, spec: impl Into<String>) {
        *self.default_spec.write() = Some(spec.into());
    }

    /// Map a tier to a `"provider/model"` spec.
    pub fn set_tier_spec(&self, tier: MessageTier, spec: impl Into<String>) {
        self.tier_specs.write().insert(tier, spec.into());
    }

    /// Remove a provider (e.g. after repeated failures). Selections that
    /// preferred it will fail over.
    pub fn deregister(&self, provider_id: &str) {
        self.providers.write().retain(|(id, _)| id != provider_id);
    }

    /// Accumulated usage per `"provider/model"`, for operator snapshots.
    pub fn usage_snapshot(&self) -> Vec<(String, u64, u64, u64)> {
        let usage = self.usage.read();
        let mut rows: Vec<_> = usage
            .iter()
            .map(|(key, c)| (key.clone(), c.requests, c.input_tokens, c.output_tokens))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    fn get(&self, provider_id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers
            .read()
            .iter()
            .find(|(id, _)| id == provider_id)
            .map(|(_, p)| p.clone())
    }

    fn first(&self) -> Option<(String, Arc<dyn LlmProvider>)> {
        self.providers.read().first().cloned()
    }

    fn select_spec(&self, spec: &str) -> Result<ProviderSelection> {
        let (provider_id, model) = spec
            .split_once('/')
            .ok_or_else(|| Error::Config(format!("invalid provider spec '{spec}'")))?;

        if let Some(provider) = self.get(provider_id) {
            return Ok(ProviderSelection {
                provider,
                model: model.to_string(),
                failed_over: false,
                original_provider: None,
            });
        }

        // Preferred provider gone; substitute the first registered one.
        let (fallback_id, fallback) = self.first().ok_or(Error::ProvidersUnavailable)?;
        tracing::warn!(
            preferred = provider_id,
            fallback = %fallback_id,
            "preferred provider unavailable, failing over"
        );
        Ok(ProviderSelection {
            provider: fallback,
            model: model.to_string(),
            failed_over: true,
            original_provider: Some(provider_id.to_string()),
        })
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderManager for ProviderRegistry {
    fn get_for_user(&self, _user_id: &str) -> Result<ProviderSelection> {
        let spec = self
            .default_spec
            .read()
            .clone()
            .ok_or(Error::ProvidersUnavailable)?;
        self.select_spec(&spec)
    }

    fn get_for_user_tiered(&self, user_id: &str, tier: MessageTier) -> Result<ProviderSelection> {
        let spec = self.tier_specs.read().get(&tier).cloned();
        match spec {
            Some(spec) => self.select_spec(&spec),
            None => self.get_for_user(user_id),
        }
    }

    fn is_tier_enabled(&self) -> bool {
        !self.tier_specs.read().is_empty()
    }

    fn track_usage(&self, provider: &str, model: &str, usage: Usage, _tier: Option<MessageTier>) {
        let key = format!("{provider}/{model}");
        let mut map = self.usage.write();
        let counters = map.entry(key).or_default();
        counters.input_tokens += usage.input_tokens as u64;
        counters.output_tokens += usage.output_tokens as u64;
        counters.requests += 1;
    }

    fn resolve_spec(&self, spec: &str) -> Result<ProviderSelection> {
        self.select_spec(spec)
    }
}
