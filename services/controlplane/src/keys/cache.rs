use super::{Jwks, KeyResult};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CachedJwks {
    loaded_at: Instant,
    jwks: Arc<Jwks>,
}

/// Per-tenant JWKS documents with a TTL. A zero TTL disables caching.
pub struct JwksCache {
    ttl: Duration,
    entries: DashMap<String, CachedJwks>,
}

impl JwksCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn get_or_load<F>(&self, tenant: &str, load: F) -> KeyResult<Arc<Jwks>>
    where
        F: FnOnce() -> KeyResult<Jwks>,
    {
        if let Some(entry) = self.entries.get(tenant)
            && entry.loaded_at.elapsed() < self.ttl
        {
            return Ok(entry.jwks.clone());
        }
        let jwks = Arc::new(load()?);
        if !self.ttl.is_zero() {
            self.entries.insert(
                tenant.to_string(),
                CachedJwks {
                    loaded_at: Instant::now(),
                    jwks: jwks.clone(),
                },
            );
        }
        Ok(jwks)
    }

    pub fn invalidate(&self, tenant: &str) {
        self.entries.remove(tenant);
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for JwksCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Jwk;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn doc(kid: &str) -> Jwks {
        Jwks {
            keys: vec![Jwk {
                kty: "OKP".into(),
                kid: kid.into(),
                alg: "EdDSA".into(),
                use_field: "sig".into(),
                crv: "Ed25519".into(),
                x: "AA".into(),
                y: None,
                exp: None,
            }],
        }
    }

    #[test]
    fn cached_until_invalidated() {
        let cache = JwksCache::new(Duration::from_secs(300));
        let loads = AtomicUsize::new(0);
        let load = |kid: &'static str| {
            let loads = &loads;
            move || {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok::<_, crate::keys::KeyError>(doc(kid))
            }
        };
        assert_eq!(cache.get_or_load("acme", load("k1")).unwrap().kids(), ["k1"]);
        assert_eq!(cache.get_or_load("acme", load("k2")).unwrap().kids(), ["k1"]);
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        cache.invalidate("acme");
        assert_eq!(cache.get_or_load("acme", load("k2")).unwrap().kids(), ["k2"]);
        cache.get_or_load("globex", load("k3")).unwrap();
        assert_eq!(cache.len(), 2);
        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_ttl_always_reloads() {
        let cache = JwksCache::new(Duration::ZERO);
        cache.get_or_load("acme", || Ok(doc("k1"))).unwrap();
        assert!(cache.is_empty());
        let fresh = cache.get_or_load("acme", || Ok(doc("k2"))).unwrap();
        assert_eq!(fresh.kids(), ["k2"]);
    }
}
