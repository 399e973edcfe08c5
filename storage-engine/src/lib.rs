use persister::AsyncStorage;
use shared::Result;
use shared::config::Backend;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub mod memory_storage;
pub mod moka_storage;
pub mod sled_storage;

pub use memory_storage::MemoryStorage;
pub use moka_storage::MokaStorage;
pub use sled_storage::SledStorage;

/// Open the backend selected in configuration.
/// `Backend::None` yields no storage, which builds a disabled persister.
pub fn open_backend(backend: &Backend) -> Result<Option<Arc<dyn AsyncStorage>>> {
    let storage: Arc<dyn AsyncStorage> = match backend {
        Backend::Memory => Arc::new(MemoryStorage::new()),
        Backend::Moka => Arc::new(MokaStorage::unbounded()),
        Backend::Sled(data_dir) => {
            Arc::new(SledStorage::new(Path::new(data_dir).join("snapshots.sled"))?)
        }
        Backend::None => {
            info!("Persistence disabled by configuration");
            return Ok(None);
        }
    };

    info!("Using {:?} storage backend", backend);
    Ok(Some(storage))
}
