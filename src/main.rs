//! Livecache demo
//!
//! Builds a cache from the environment, attaches a few hooks and walks
//! through set, get, expiry and key rotation.

use std::time::Duration;

use livecache::{AsyncLiveCache, CacheConfig, EntryHooks, EventKind, Hook, Keyring};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber with env filter
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "livecache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CacheConfig::from_env()?;
    info!(?config, "configuration loaded");
    let cache = AsyncLiveCache::new(config)?;

    cache.register(
        EventKind::Set,
        Hook::blocking(|key, value| {
            info!(key, ?value, "set hook");
            Ok(())
        }),
        None,
        None,
    );
    cache.register(
        EventKind::Get,
        Hook::asynchronous(|key, value| async move {
            info!(key = %key, ?value, "get hook");
            Ok(())
        }),
        None,
        None,
    );

    cache.set("foo", 123, None).await?;
    let foo: Option<i64> = cache.get("foo").await?;
    info!(?foo, "read back");

    let expire_hooks = EntryHooks::new().on_expire(Hook::key_only(|key| {
        info!(key, "entry expired");
        Ok(())
    }));
    cache
        .set_with_hooks("temp", "x", Some(Duration::from_secs(1)), expire_hooks)
        .await?;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let temp: Option<String> = cache.get("temp").await?;
    info!(?temp, "after ttl");

    cache.rotate_key(&Keyring::generate_key()?)?;
    let foo: Option<i64> = cache.get("foo").await?;
    info!(?foo, "read back after key rotation");

    // Let the last hooks finish before reporting
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = cache.stats().await?;
    info!(
        cache = %serde_json::to_string(&stats)?,
        hooks = %serde_json::to_string(&cache.dispatch_stats())?,
        "final statistics"
    );

    cache.stop().await?;
    Ok(())
}
