// Public API
pub mod codec;
pub mod persister;
pub mod ports;
pub mod retry;
pub mod throttle;

// Re-export commonly used types
pub use codec::{Codec, FnCodec, JsonCodec};
pub use persister::{AsyncStoragePersister, PersistedClient, PersisterBuilder, WriteFailureMode};
pub use ports::{AsyncStorage, Persister};
pub use retry::{Backoff, BoundedRetry, FnRetry, RetryContext, RetryPolicy, retry_fn};
pub use shared::config::{DEFAULT_STORAGE_KEY, DEFAULT_THROTTLE_MS};
pub use shared::{Error, Result};
pub use throttle::AsyncThrottle;
