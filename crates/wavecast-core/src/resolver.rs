//! Credential scope resolvers.

use std::time::Duration;

use moka::future::Cache;
use uuid::Uuid;

use crate::channel::CredentialScope;
use crate::error::AppError;
use crate::traits::{ChannelStore, CredentialScopeResolver};

/// Reads the scope straight from the channel record.
#[derive(Clone)]
pub struct StaticScopeResolver<C: ChannelStore> {
    channels: C,
}

impl<C: ChannelStore> StaticScopeResolver<C> {
    pub fn new(channels: C) -> Self {
        Self { channels }
    }
}

impl<C: ChannelStore> CredentialScopeResolver for StaticScopeResolver<C> {
    async fn resolve(&self, channel_id: Uuid) -> Result<CredentialScope, AppError> {
        self.channels
            .get_channel(channel_id)
            .await?
            .map(|channel| channel.credential_scope)
            .ok_or_else(|| AppError::not_found("channel", channel_id))
    }
}

/// Caches resolved scopes in-process for a fixed TTL.
#[derive(Clone)]
pub struct CachedScopeResolver<R: CredentialScopeResolver> {
    inner: R,
    cache: Cache<Uuid, CredentialScope>,
}

impl<R: CredentialScopeResolver> CachedScopeResolver<R> {
    pub fn new(inner: R, max_capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self { inner, cache }
    }

    pub async fn invalidate(&self, channel_id: Uuid) {
        self.cache.invalidate(&channel_id).await;
    }
}

impl<R: CredentialScopeResolver> CredentialScopeResolver for CachedScopeResolver<R> {
    async fn resolve(&self, channel_id: Uuid) -> Result<CredentialScope, AppError> {
        if let Some(scope) = self.cache.get(&channel_id).await {
            return Ok(scope);
        }
        let scope = self.inner.resolve(channel_id).await?;
        self.cache.insert(channel_id, scope.clone()).await;
        tracing::debug!(%channel_id, "Credential scope cached");
        Ok(scope)
    }
}
