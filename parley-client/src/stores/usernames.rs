//! Username cache fronted by the profile coalescer.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};

use parley_core::{Address, CacheLimits, ConfigError, ParleyResult};
use parley_lookup::{LookupBackend, Profile, ProfileLookup, ProfileRequest, RequestCoalescer};
use parley_storage::{BoundedCache, CacheStats};

/// Resolved usernames, bounded by `cache.max_usernames`.
///
/// Only terminal profiles are kept. A pending placeholder (the profile
/// service failed) is returned to the caller but looked up again next time.
/// Once a profile is cached here the coalescer's copy is dropped, so the
/// bounded cache alone decides what stays in memory.
pub struct UsernameStore<B = ProfileLookup>
where
    B: LookupBackend<Request = ProfileRequest, Key = Address, Output = Profile>,
{
    profiles: Mutex<BoundedCache<Address, Profile>>,
    lookups: RequestCoalescer<B>,
}

impl<B> UsernameStore<B>
where
    B: LookupBackend<Request = ProfileRequest, Key = Address, Output = Profile>,
{
    pub fn new(limits: &CacheLimits, lookups: RequestCoalescer<B>) -> ParleyResult<Self> {
        let capacity = NonZeroUsize::new(limits.max_usernames).ok_or_else(|| {
            ConfigError::InvalidValue {
                field: "cache.max_usernames".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            }
        })?;
        Ok(Self {
            profiles: Mutex::new(BoundedCache::new(capacity)),
            lookups,
        })
    }

    /// Cached profile, if resolved earlier. Marks it recently used.
    pub fn cached(&self, address: &Address) -> Option<Profile> {
        self.lock().get(address).cloned()
    }

    /// Profile for `address`, looked up if not cached.
    pub async fn resolve(&self, address: &Address) -> Profile {
        if let Some(profile) = self.cached(address) {
            return profile;
        }

        let profile = self.lookups.fetch(ProfileRequest::new(address.clone())).await;
        if profile.status.is_terminal() {
            self.lock().set(address.clone(), profile.clone());
            self.lookups.invalidate(address);
        } else {
            tracing::debug!(address = %address, "Profile unresolved, not caching");
        }
        profile
    }

    /// Username, or a shortened address when the account has none or the
    /// lookup failed.
    pub async fn display_name(&self, address: &Address) -> String {
        match self.resolve(address).await.username {
            Some(username) => username,
            None => short_address(address),
        }
    }

    /// Forget a cached profile so the next resolve looks it up again.
    pub fn forget(&self, address: &Address) -> bool {
        let cached = self.lock().delete(address).is_some();
        let coalesced = self.lookups.invalidate(address);
        cached || coalesced
    }

    pub fn trim_to(&self, target: usize) -> usize {
        self.lock().evict_to(target)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats()
    }

    pub fn lookups(&self) -> &RequestCoalescer<B> {
        &self.lookups
    }

    fn lock(&self) -> MutexGuard<'_, BoundedCache<Address, Profile>> {
        match self.profiles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// `0x71c7…976f`
pub fn short_address(address: &Address) -> String {
    let s = address.as_str();
    format!("{}…{}", &s[..6], &s[s.len() - 4..])
}
