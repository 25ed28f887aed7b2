//! Model usage aggregated per agent provider.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use tracing::info;

use crate::agent::PhaseOutcome;
use crate::config::PricingConfig;
use crate::events::{EventBus, ModelUsageEvent};

/// Sums requests, tokens and cost reported by phase outcomes.
#[derive(Debug, Default)]
pub struct UsageTracker {
    pricing: PricingConfig,
    providers: Mutex<BTreeMap<String, ModelUsageEvent>>,
}

impl UsageTracker {
    pub fn new(pricing: PricingConfig) -> Self {
        Self {
            pricing,
            providers: Mutex::default(),
        }
    }

    /// Cost of an outcome, priced from tokens when the agent reported none.
    pub fn price(&self, outcome: &PhaseOutcome) -> f64 {
        if outcome.cost_usd > 0.0 {
            return outcome.cost_usd;
        }
        outcome.tokens_in as f64 * self.pricing.input_token_usd
            + outcome.tokens_out as f64 * self.pricing.output_token_usd
    }

    /// Records one phase attempt and returns its cost.
    pub fn record(&self, provider: &str, outcome: &PhaseOutcome) -> f64 {
        let cost = self.price(outcome);
        let mut providers = self.providers.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = providers
            .entry(provider.to_string())
            .or_insert_with(|| ModelUsageEvent {
                provider: provider.to_string(),
                ..ModelUsageEvent::default()
            });
        entry.requests_total += u64::from(outcome.turns.max(1));
        entry.tokens_in_total += outcome.tokens_in;
        entry.tokens_out_total += outcome.tokens_out;
        entry.cost_total_usd += cost;
        cost
    }

    pub fn snapshot(&self) -> Vec<ModelUsageEvent> {
        self.providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Publishes one `model.usage` event per provider.
    pub fn publish(&self, bus: &EventBus) {
        for usage in self.snapshot() {
            info!(
                provider = %usage.provider,
                requests = usage.requests_total,
                tokens_in = usage.tokens_in_total,
                tokens_out = usage.tokens_out_total,
                cost_usd = usage.cost_total_usd,
                "Model usage"
            );
            bus.emit(&usage, None);
        }
    }
}
