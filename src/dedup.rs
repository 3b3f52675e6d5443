use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    Accept,
    Duplicate,
}

/// Process-local delivery-id cache with TTL eviction. Insert-if-absent
/// under one lock, so two near-simultaneous deliveries of the same id
/// cannot both pass the check. Not durable: a restart forgets
/// everything, and GitHub may redeliver across restarts.
#[derive(Debug, Clone)]
pub struct DeliveryCache {
    ttl_seconds: i64,
    expirations: Arc<Mutex<HashMap<String, i64>>>,
}

impl DeliveryCache {
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            ttl_seconds,
            expirations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn check(&self, delivery_id: &str, now_epoch: i64) -> DedupDecision {
        if delivery_id.is_empty() {
            return DedupDecision::Accept;
        }

        let mut guard = match self.expirations.lock() {
            Ok(guard) => guard,
            // A poisoned lock means another dispatch panicked mid-insert;
            // fail toward "duplicate" so nothing is double-processed.
            Err(_) => return DedupDecision::Duplicate,
        };

        prune_expired(&mut guard, now_epoch);
        if let Some(expires_at) = guard.get(delivery_id)
            && *expires_at > now_epoch
        {
            return DedupDecision::Duplicate;
        }

        guard.insert(delivery_id.to_string(), now_epoch + self.ttl_seconds);
        DedupDecision::Accept
    }

    /// Removes an id recorded by `check`. Used when admission is
    /// rolled back (queue full), so the sender's redelivery of the
    /// same id is not mistaken for a replay.
    pub fn forget(&self, delivery_id: &str) {
        if let Ok(mut guard) = self.expirations.lock() {
            guard.remove(delivery_id);
        }
    }
}

fn prune_expired(cache: &mut HashMap<String, i64>, now_epoch: i64) {
    cache.retain(|_, expires_at| *expires_at > now_epoch);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_delivery_within_ttl_is_duplicate() {
        let cache = DeliveryCache::new(60);
        assert_eq!(cache.check("delivery-1", 1_700_000_000), DedupDecision::Accept);
        assert_eq!(
            cache.check("delivery-1", 1_700_000_010),
            DedupDecision::Duplicate
        );
    }

    #[test]
    fn different_ids_are_independent() {
        let cache = DeliveryCache::new(60);
        assert_eq!(cache.check("delivery-1", 1_700_000_000), DedupDecision::Accept);
        assert_eq!(cache.check("delivery-2", 1_700_000_000), DedupDecision::Accept);
    }

    #[test]
    fn ids_expire_and_accept_again() {
        let cache = DeliveryCache::new(60);
        assert_eq!(cache.check("delivery-1", 1_700_000_000), DedupDecision::Accept);
        assert_eq!(
            cache.check("delivery-1", 1_700_000_061),
            DedupDecision::Accept
        );
    }

    #[test]
    fn forgotten_id_is_accepted_again() {
        let cache = DeliveryCache::new(60);
        assert_eq!(cache.check("delivery-1", 1_700_000_000), DedupDecision::Accept);
        cache.forget("delivery-1");
        assert_eq!(
            cache.check("delivery-1", 1_700_000_010),
            DedupDecision::Accept
        );
    }

    #[test]
    fn empty_delivery_id_always_accepts() {
        let cache = DeliveryCache::new(60);
        assert_eq!(cache.check("", 1_700_000_000), DedupDecision::Accept);
        assert_eq!(cache.check("", 1_700_000_000), DedupDecision::Accept);
    }
}
