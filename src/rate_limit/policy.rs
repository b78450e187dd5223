use super::types::{RateLimitPolicy, RateLimitSubject};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::info;

/// Source of rate limit policies
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// The one policy that applies to `subject`, if any
    async fn resolve_policy(
        &self,
        subject: &RateLimitSubject<'_>,
    ) -> Result<Option<Arc<RateLimitPolicy>>>;
}

/// Highest priority wins; on equal priority, fewer wildcards, then policy id
fn precedence(a: &RateLimitPolicy, b: &RateLimitPolicy) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| b.wildcards().cmp(&a.wildcards()))
        .then_with(|| b.policy_id.cmp(&a.policy_id))
}

/// Policies held in process memory, managed through the administrative API
#[derive(Default)]
pub struct InMemoryPolicyStore {
    policies: DashMap<String, Arc<RateLimitPolicy>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policies(policies: Vec<RateLimitPolicy>) -> Result<Self> {
        let store = Self::new();
        store.replace_all(policies)?;
        Ok(store)
    }

    pub fn create(&self, policy: RateLimitPolicy) -> Result<Arc<RateLimitPolicy>> {
        policy.validate()?;
        let policy = Arc::new(policy);

        match self.policies.entry(policy.policy_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(GatewayError::Conflict(format!(
                    "Policy {} already exists",
                    policy.policy_id
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(policy.clone());
            }
        }

        info!(policy_id = %policy.policy_id, "Rate limit policy created");
        Ok(policy)
    }

    pub fn update(&self, policy_id: &str, policy: RateLimitPolicy) -> Result<Arc<RateLimitPolicy>> {
        if policy.policy_id != policy_id {
            return Err(GatewayError::Validation(format!(
                "Policy id in body ({}) does not match path ({})",
                policy.policy_id, policy_id
            )));
        }
        policy.validate()?;

        let mut current = self
            .policies
            .get_mut(policy_id)
            .ok_or_else(|| GatewayError::PolicyNotFound(policy_id.to_string()))?;
        let policy = Arc::new(policy);
        *current = policy.clone();
        drop(current);

        info!(policy_id, "Rate limit policy updated");
        Ok(policy)
    }

    pub fn delete(&self, policy_id: &str) -> Result<()> {
        self.policies
            .remove(policy_id)
            .ok_or_else(|| GatewayError::PolicyNotFound(policy_id.to_string()))?;
        info!(policy_id, "Rate limit policy deleted");
        Ok(())
    }

    pub fn get(&self, policy_id: &str) -> Option<Arc<RateLimitPolicy>> {
        self.policies.get(policy_id).map(|p| p.value().clone())
    }

    /// All policies ordered by id
    pub fn list(&self) -> Vec<Arc<RateLimitPolicy>> {
        let mut all: Vec<_> = self.policies.iter().map(|p| p.value().clone()).collect();
        all.sort_by(|a, b| a.policy_id.cmp(&b.policy_id));
        all
    }

    /// Swap the full policy set; nothing changes unless every policy validates
    pub fn replace_all(&self, policies: Vec<RateLimitPolicy>) -> Result<()> {
        let mut validated: Vec<Arc<RateLimitPolicy>> = Vec::with_capacity(policies.len());
        for policy in policies {
            policy.validate()?;
            if validated.iter().any(|p| p.policy_id == policy.policy_id) {
                return Err(GatewayError::Validation(format!(
                    "Duplicate policy id: {}",
                    policy.policy_id
                )));
            }
            validated.push(Arc::new(policy));
        }

        let count = validated.len();
        self.policies
            .retain(|id, _| validated.iter().any(|p| &p.policy_id == id));
        for policy in validated {
            self.policies.insert(policy.policy_id.clone(), policy);
        }
        info!(count, "Rate limit policy set replaced");
        Ok(())
    }
}

#[async_trait]
impl PolicySource for InMemoryPolicyStore {
    async fn resolve_policy(
        &self,
        subject: &RateLimitSubject<'_>,
    ) -> Result<Option<Arc<RateLimitPolicy>>> {
        Ok(self
            .policies
            .iter()
            .filter(|p| p.applies_to(subject))
            .max_by(|a, b| precedence(a.value(), b.value()))
            .map(|p| p.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::types::{RateLimitAlgorithm, ANY};

    fn policy(id: &str, client: &str, endpoint: &str, priority: i32) -> RateLimitPolicy {
        let mut p = RateLimitPolicy::new(id, client, endpoint, RateLimitAlgorithm::FixedWindow, 5, 60);
        p.priority = priority;
        p
    }

    #[tokio::test]
    async fn test_highest_priority_wins() {
        let store = InMemoryPolicyStore::with_policies(vec![
            policy("low", "client-a", "/orders", 1),
            policy("high", "client-a", "/orders", 10),
            policy("other", "client-b", "/orders", 100),
        ])
        .unwrap();

        let subject = RateLimitSubject::new("client-a", "/orders");
        let resolved = store.resolve_policy(&subject).await.unwrap().unwrap();
        assert_eq!(resolved.policy_id, "high");
    }

    #[tokio::test]
    async fn test_no_policy_means_none() {
        let store = InMemoryPolicyStore::new();
        let subject = RateLimitSubject::new("client-a", "/orders");
        assert!(store.resolve_policy(&subject).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wildcards_and_specificity() {
        let store = InMemoryPolicyStore::with_policies(vec![
            policy("everyone", ANY, ANY, 0),
            policy("client-wide", "client-a", ANY, 0),
        ])
        .unwrap();

        let a = store
            .resolve_policy(&RateLimitSubject::new("client-a", "/orders"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.policy_id, "client-wide");

        let b = store
            .resolve_policy(&RateLimitSubject::new("client-b", "/users"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b.policy_id, "everyone");
    }

    #[tokio::test]
    async fn test_inactive_policies_are_skipped() {
        let mut inactive = policy("off", "client-a", "/orders", 50);
        inactive.is_active = false;
        let store =
            InMemoryPolicyStore::with_policies(vec![inactive, policy("on", "client-a", "/orders", 1)])
                .unwrap();

        let resolved = store
            .resolve_policy(&RateLimitSubject::new("client-a", "/orders"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.policy_id, "on");
    }

    #[test]
    fn test_crud() {
        let store = InMemoryPolicyStore::new();
        store.create(policy("p1", "c", "/e", 0)).unwrap();
        assert!(matches!(
            store.create(policy("p1", "c", "/e", 0)),
            Err(GatewayError::Conflict(_))
        ));

        let updated = store.update("p1", policy("p1", "c", "/e", 7)).unwrap();
        assert_eq!(updated.priority, 7);
        assert!(store.update("p1", policy("p2", "c", "/e", 7)).is_err());

        let mut invalid = policy("p1", "c", "/e", 0);
        invalid.max_requests = 0;
        assert!(matches!(
            store.update("p1", invalid),
            Err(GatewayError::Validation(_))
        ));

        store.delete("p1").unwrap();
        assert!(store.get("p1").is_none());
        assert!(store.delete("p1").is_err());
    }
}
