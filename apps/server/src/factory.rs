//! Concrete adapter factory wiring the store crates into the core.

use std::sync::Arc;

use async_trait::async_trait;

use flowslide_core::errors::Result;
use flowslide_core::settings::R2Settings;
use flowslide_core::store::{ObjectStore, StoreAdapter};
use flowslide_core::transition::AdapterFactory;
use flowslide_external_db::ExternalStore;
use flowslide_object_store::R2Store;

pub struct DefaultAdapterFactory;

#[async_trait]
impl AdapterFactory for DefaultAdapterFactory {
    async fn connect_external(&self, database_url: &str) -> Result<Arc<dyn StoreAdapter>> {
        let store = ExternalStore::connect(database_url).await?;
        Ok(Arc::new(store))
    }

    async fn connect_object(&self, settings: &R2Settings) -> Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(R2Store::connect(settings).await))
    }
}
