use crate::codec::{Codec, JsonCodec};
use crate::ports::{AsyncStorage, Persister};
use crate::retry::{BoundedRetry, RetryContext, RetryPolicy};
use crate::throttle::AsyncThrottle;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use shared::config::{DEFAULT_STORAGE_KEY, DEFAULT_THROTTLE_MS, PersistConfig};
use shared::{Error, Result};
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

/// Default snapshot type: any JSON document
pub type PersistedClient = serde_json::Value;

type ErrorHook = Arc<dyn Fn(Error) + Send + Sync>;

/// What happens when a save finally fails (no retry policy, or the policy gave up)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteFailureMode {
    /// Drop the failure. Persistence is best effort and not durable.
    #[default]
    Ignore,
    /// Hand the failure to the error hook
    Report,
}

/// Builder for [`AsyncStoragePersister`]. Without a storage backend the built persister
/// is disabled and every operation is a no-op.
pub struct PersisterBuilder<C>
where
    C: Send + 'static,
{
    storage: Option<Arc<dyn AsyncStorage>>,
    key: String,
    throttle_time: Duration,
    codec: Arc<dyn Codec<C>>,
    retry: Option<Arc<dyn RetryPolicy<C>>>,
    write_failure: WriteFailureMode,
    on_error: Option<ErrorHook>,
}

impl<C> PersisterBuilder<C>
where
    C: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_codec(JsonCodec)
    }
}

impl<C> Default for PersisterBuilder<C>
where
    C: Serialize + DeserializeOwned + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C> PersisterBuilder<C>
where
    C: Send + 'static,
{
    /// Start from a custom codec, for snapshot types without serde support
    pub fn with_codec(codec: impl Codec<C>) -> Self {
        Self {
            storage: None,
            key: DEFAULT_STORAGE_KEY.to_string(),
            throttle_time: Duration::from_millis(DEFAULT_THROTTLE_MS),
            codec: Arc::new(codec),
            retry: None,
            write_failure: WriteFailureMode::default(),
            on_error: None,
        }
    }

    pub fn storage(self, storage: impl AsyncStorage) -> Self {
        self.maybe_storage(Some(Arc::new(storage)))
    }

    /// Set or clear the backend; `None` builds a disabled persister
    pub fn maybe_storage(mut self, storage: Option<Arc<dyn AsyncStorage>>) -> Self {
        self.storage = storage;
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Minimum spacing between storage writes
    pub fn throttle_time(mut self, throttle_time: Duration) -> Self {
        self.throttle_time = throttle_time;
        self
    }

    pub fn codec(mut self, codec: impl Codec<C>) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn retry(mut self, policy: impl RetryPolicy<C>) -> Self {
        self.retry = Some(Arc::new(policy));
        self
    }

    pub fn write_failure(mut self, mode: WriteFailureMode) -> Self {
        self.write_failure = mode;
        self
    }

    /// Receives errors escaping a save: retry policy failures, final write failures
    /// under [`WriteFailureMode::Report`], and persists issued outside a tokio runtime
    pub fn on_error(mut self, hook: impl Fn(Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Apply key, throttle, retry and failure settings from `config`.
    /// The backend itself is chosen by the caller.
    pub fn apply_config(mut self, config: &PersistConfig) -> Self {
        self.key = config.key.clone();
        self.throttle_time = config.throttle_time();
        if let Some(attempts) = config.retry_attempts {
            self.retry = Some(Arc::new(BoundedRetry::new(attempts)));
        }
        if config.report_failures {
            self.write_failure = WriteFailureMode::Report;
        }
        self
    }

    pub fn build(self) -> AsyncStoragePersister<C> {
        let Some(storage) = self.storage else {
            debug!("No storage backend configured, persister disabled");
            return AsyncStoragePersister::disabled();
        };

        let store = Arc::new(Store {
            storage,
            key: self.key,
            codec: self.codec,
            retry: self.retry,
            write_failure: self.write_failure,
        });

        let task_store = Arc::clone(&store);
        let task = move |client: C| {
            let store = Arc::clone(&task_store);
            async move { store.save_with_retry(client).await }
        };

        let on_error: ErrorHook = match self.on_error {
            Some(hook) => hook,
            None => Arc::new(|err: Error| {
                error!("Failed to persist client: {}", err);
            }),
        };
        let throttle_hook = Arc::clone(&on_error);
        let throttle = AsyncThrottle::with_error_hook(self.throttle_time, task, move |err: Error| {
            throttle_hook(err);
        });

        debug!(
            "Persister ready for key '{}' (throttle {:?}, retry policy: {})",
            store.key,
            throttle.interval(),
            store.retry.is_some()
        );

        AsyncStoragePersister {
            mode: Mode::Active {
                store,
                throttle,
                on_error,
            },
        }
    }
}

/// Persister over an [`AsyncStorage`] backend.
///
/// Saves go through an [`AsyncThrottle`] wrapping the whole save-with-retry routine, so at
/// most one `set_item` (retries included) is in flight, and a burst of
/// [`Persister::persist_client`] calls saves only the newest snapshot. Restore and remove
/// hit the backend directly and are not ordered against pending saves.
pub struct AsyncStoragePersister<C = PersistedClient>
where
    C: Send + 'static,
{
    mode: Mode<C>,
}

enum Mode<C>
where
    C: Send + 'static,
{
    Disabled,
    Active {
        store: Arc<Store<C>>,
        throttle: AsyncThrottle<C, Error>,
        on_error: ErrorHook,
    },
}

struct Store<C>
where
    C: Send + 'static,
{
    storage: Arc<dyn AsyncStorage>,
    key: String,
    codec: Arc<dyn Codec<C>>,
    retry: Option<Arc<dyn RetryPolicy<C>>>,
    write_failure: WriteFailureMode,
}

impl<C> AsyncStoragePersister<C>
where
    C: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn builder() -> PersisterBuilder<C> {
        PersisterBuilder::new()
    }
}

impl<C> AsyncStoragePersister<C>
where
    C: Send + 'static,
{
    /// Persister for environments without storage: saves and removes do nothing and
    /// restores find nothing
    pub fn disabled() -> Self {
        Self {
            mode: Mode::Disabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.mode, Mode::Active { .. })
    }

    pub fn key(&self) -> Option<&str> {
        match &self.mode {
            Mode::Active { store, .. } => Some(&store.key),
            Mode::Disabled => None,
        }
    }

    /// Wait until every queued snapshot has been saved, retried out or superseded.
    /// A snapshot queued outside a runtime is started here.
    pub async fn flush(&self) {
        if let Mode::Active { throttle, .. } = &self.mode {
            throttle.until_idle().await;
        }
    }
}

impl<C> Store<C>
where
    C: Send + 'static,
{
    /// Serialize and write one snapshot. Serialization errors count as write failures.
    async fn try_save(&self, serialized: Result<String>) -> Result<()> {
        self.storage.set_item(&self.key, serialized?).await
    }

    /// Save `client`, consulting the retry policy after each failure until a save
    /// succeeds or the policy gives up
    async fn save_with_retry(&self, client: C) -> Result<()> {
        let mut client = client;
        let mut error_count: u32 = 0;

        loop {
            let serialized = self.codec.serialize(&client);
            let error = match self.try_save(serialized).await {
                Ok(()) => {
                    debug!("Persisted client under key '{}'", self.key);
                    return Ok(());
                }
                Err(err) => err,
            };

            let Some(policy) = &self.retry else {
                return self.give_up(error);
            };

            error_count = error_count.saturating_add(1);
            warn!(
                "Save attempt {} for key '{}' failed: {}",
                error_count, self.key, error
            );

            let next = policy
                .retry(RetryContext {
                    persisted_client: client,
                    error,
                    error_count,
                })
                .await
                .map_err(|err| match err {
                    Error::Retry(_) => err,
                    other => Error::Retry(other.to_string()),
                })?;

            match next {
                Some(replacement) => client = replacement,
                None => {
                    return self.give_up(Error::Abandoned {
                        attempts: error_count,
                    });
                }
            }
        }
    }

    fn give_up(&self, error: Error) -> Result<()> {
        match self.write_failure {
            WriteFailureMode::Ignore => {
                debug!("Dropping failed save for key '{}': {}", self.key, error);
                Ok(())
            }
            WriteFailureMode::Report => Err(error),
        }
    }
}

#[async_trait]
impl<C> Persister<C> for AsyncStoragePersister<C>
where
    C: Send + 'static,
{
    fn persist_client(&self, client: C) {
        let Mode::Active { throttle, on_error, .. } = &self.mode else {
            return;
        };

        if let Err(err) = Handle::try_current() {
            // Parked until the next persist or flush made inside a runtime
            on_error(Error::Runtime(err.to_string()));
        }
        throttle.call(client);
    }

    async fn restore_client(&self) -> Result<Option<C>> {
        let Mode::Active { store, .. } = &self.mode else {
            return Ok(None);
        };

        let cached = match store.storage.get_item(&store.key).await? {
            Some(cached) if !cached.is_empty() => cached,
            _ => {
                debug!("Nothing stored under key '{}'", store.key);
                return Ok(None);
            }
        };

        store.codec.deserialize(&cached).map(Some)
    }

    async fn remove_client(&self) -> Result<()> {
        match &self.mode {
            Mode::Active { store, .. } => store.storage.remove_item(&store.key).await,
            Mode::Disabled => Ok(()),
        }
    }
}

impl<C> Debug for AsyncStoragePersister<C>
where
    C: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mode {
            Mode::Disabled => f
                .debug_struct("AsyncStoragePersister")
                .field("enabled", &false)
                .finish(),
            Mode::Active { store, throttle, .. } => f
                .debug_struct("AsyncStoragePersister")
                .field("key", &store.key)
                .field("write_failure", &store.write_failure)
                .field("throttle", throttle)
                .finish(),
        }
    }
}
