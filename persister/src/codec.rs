use serde::Serialize;
use serde::de::DeserializeOwned;
use shared::{Error, Result};

/// Text encoding of snapshots. `deserialize(serialize(c))` must yield `c` again.
pub trait Codec<C>: Send + Sync + 'static {
    fn serialize(&self, client: &C) -> Result<String>;
    fn deserialize(&self, cached: &str) -> Result<C>;
}

/// Default codec: JSON via serde_json
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl<C> Codec<C> for JsonCodec
where
    C: Serialize + DeserializeOwned,
{
    fn serialize(&self, client: &C) -> Result<String> {
        serde_json::to_string(client).map_err(|e| Error::Serialize(e.to_string()))
    }

    fn deserialize(&self, cached: &str) -> Result<C> {
        serde_json::from_str(cached).map_err(|e| Error::Deserialize(e.to_string()))
    }
}

/// Codec assembled from a pair of plain functions
pub struct FnCodec<S, D> {
    serialize: S,
    deserialize: D,
}

impl<S, D> FnCodec<S, D> {
    pub fn new(serialize: S, deserialize: D) -> Self {
        Self {
            serialize,
            deserialize,
        }
    }
}

impl<C, S, D> Codec<C> for FnCodec<S, D>
where
    S: Fn(&C) -> Result<String> + Send + Sync + 'static,
    D: Fn(&str) -> Result<C> + Send + Sync + 'static,
{
    fn serialize(&self, client: &C) -> Result<String> {
        (self.serialize)(client)
    }

    fn deserialize(&self, cached: &str) -> Result<C> {
        (self.deserialize)(cached)
    }
}
