use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use deskchat_protocol::{Profile, UserId, UserRole};

use crate::backend::ChatBackend;
use crate::error::ChatError;

/// Display name used when a profile cannot be fetched.
pub const UNKNOWN_USER: &str = "Unknown User";

/// Display identity attached to a rendered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub full_name: String,
    pub role: UserRole,
    /// True when the profile lookup failed and this is a stand-in.
    pub placeholder: bool,
}

impl Identity {
    pub fn placeholder(user_id: UserId) -> Self {
        Self {
            user_id,
            full_name: UNKNOWN_USER.to_string(),
            role: UserRole::User,
            placeholder: true,
        }
    }
}

impl From<Profile> for Identity {
    fn from(profile: Profile) -> Self {
        Self {
            user_id: profile.user_id,
            full_name: profile.full_name,
            role: profile.role,
            placeholder: false,
        }
    }
}

/// Caches profile lookups for message annotation.
///
/// Entries expire after `ttl`. Failed lookups are not cached, so a later
/// call retries the backend.
pub struct IdentityResolver {
    backend: Arc<dyn ChatBackend>,
    ttl: Duration,
    cache: Mutex<HashMap<UserId, (Identity, Instant)>>,
}

impl IdentityResolver {
    pub fn new(backend: Arc<dyn ChatBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Fresh cached identity, if any.
    pub fn cached(&self, user_id: &UserId) -> Option<Identity> {
        let cache = self.cache.lock().ok()?;
        cache
            .get(user_id)
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(identity, _)| identity.clone())
    }

    pub async fn lookup(&self, user_id: &UserId) -> Result<Identity, ChatError> {
        if let Some(identity) = self.cached(user_id) {
            return Ok(identity);
        }
        let profile = self.backend.get_profile(user_id).await.map_err(|reason| {
            ChatError::IdentityLookupFailed {
                user_id: user_id.clone(),
                reason,
            }
        })?;
        let identity = Identity::from(profile);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(user_id.clone(), (identity.clone(), Instant::now()));
        }
        Ok(identity)
    }

    /// Like [`lookup`](Self::lookup), but degrades to the placeholder.
    pub async fn identity(&self, user_id: &UserId) -> Identity {
        match self.lookup(user_id).await {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(%user_id, error = %err, "using placeholder identity");
                Identity::placeholder(user_id.clone())
            }
        }
    }

    /// Resolve a batch of users concurrently, one lookup per distinct id.
    pub async fn resolve_all<'a>(
        &self,
        user_ids: impl IntoIterator<Item = &'a UserId>,
    ) -> HashMap<UserId, Identity> {
        let distinct: HashSet<&UserId> = user_ids.into_iter().collect();
        let lookups = distinct.into_iter().map(|id| async move {
            let identity = self.identity(id).await;
            (id.clone(), identity)
        });
        futures::future::join_all(lookups).await.into_iter().collect()
    }

    pub fn invalidate(&self, user_id: &UserId) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(user_id);
        }
    }
}
