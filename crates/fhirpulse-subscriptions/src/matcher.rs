//! Decides which subscriptions a change event concerns.

use std::sync::Arc;

use tracing::warn;

use fhirpulse_core::ChangeEvent;
use fhirpulse_search::{SearchParameterRegistry, matches_criteria, parse_criteria_string};

use crate::types::Subscription;

#[derive(Debug, Clone)]
pub struct SubscriptionMatcher {
    search: Arc<SearchParameterRegistry>,
}

impl SubscriptionMatcher {
    pub fn new(search: Arc<SearchParameterRegistry>) -> Self {
        Self { search }
    }

    /// Whether `event` should be delivered to `subscription`.
    ///
    /// Requires an active subscription in the event's tenant, the same
    /// compartment when the subscription is pinned to one, and criteria that
    /// match the event snapshot. Malformed criteria never match.
    pub fn matches(&self, event: &ChangeEvent, subscription: &Subscription) -> bool {
        if !subscription.is_active() || subscription.tenant_id != event.tenant_id {
            return false;
        }
        if let Some(compartment) = &subscription.compartment
            && event.compartment.as_ref() != Some(compartment)
        {
            return false;
        }

        let criteria = match parse_criteria_string(&subscription.criteria, &self.search) {
            Ok(criteria) => criteria,
            Err(e) => {
                warn!(
                    subscription_id = %subscription.id,
                    criteria = %subscription.criteria,
                    error = %e,
                    "Subscription criteria cannot be parsed"
                );
                return false;
            }
        };

        criteria.resource_type == event.resource_type
            && matches_criteria(&criteria, &event.snapshot, &self.search)
    }

    /// Subscriptions among `candidates` that match `event`.
    pub fn select<'a>(
        &self,
        event: &ChangeEvent,
        candidates: &'a [Subscription],
    ) -> Vec<&'a Subscription> {
        candidates
            .iter()
            .filter(|sub| self.matches(event, sub))
            .collect()
    }
}
