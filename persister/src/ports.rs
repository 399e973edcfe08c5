#![deny(clippy::all)]

use async_trait::async_trait;
use shared::Result;
use std::sync::Arc;

// Ports are the pluggable extension points the persister is wired against

/// Port for an asynchronous string key-value backend (browser-style storage, sled, ...)
/// Every operation may fail independently.
#[async_trait]
pub trait AsyncStorage: Send + Sync + 'static {
    async fn get_item(&self, key: &str) -> Result<Option<String>>;
    async fn set_item(&self, key: &str, value: String) -> Result<()>;
    async fn remove_item(&self, key: &str) -> Result<()>;
}

#[async_trait]
impl<S: AsyncStorage + ?Sized> AsyncStorage for Arc<S> {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        (**self).get_item(key).await
    }

    async fn set_item(&self, key: &str, value: String) -> Result<()> {
        (**self).set_item(key, value).await
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        (**self).remove_item(key).await
    }
}

/// Save / restore / delete capability for one cache snapshot slot
#[async_trait]
pub trait Persister<C>: Send + Sync {
    /// Queue `client` for saving. Returns immediately; failures never surface here.
    fn persist_client(&self, client: C);

    /// Load the stored snapshot, `None` when nothing has been saved
    async fn restore_client(&self) -> Result<Option<C>>;

    /// Delete the stored snapshot
    async fn remove_client(&self) -> Result<()>;
}
