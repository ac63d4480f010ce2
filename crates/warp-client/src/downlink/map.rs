use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use warp_codec::body::MapAction;
use warp_codec::Value;

use super::HandleCore;
use crate::error::ClientError;
use crate::model::{map_key, LaneState};
use crate::observer::{MapAdapter, MapObserver, StateChange};

/// Downlink to a key-ordered map.
///
/// Keys are ordered by their canonical JSON text, so string keys sort
/// lexicographically and numeric keys sort by their printed form.
pub struct MapDownlink<K, V> {
    core: HandleCore,
    _entry: PhantomData<fn() -> (K, V)>,
}

type Entries = BTreeMap<String, (Value, Value)>;

impl<K, V> MapDownlink<K, V>
where
    K: Serialize + DeserializeOwned + 'static,
    V: Serialize + DeserializeOwned + 'static,
{
    pub(crate) fn new(core: HandleCore) -> Self {
        Self {
            core,
            _entry: PhantomData,
        }
    }

    handle_common!();

    pub fn observe<O>(&self, observer: Arc<O>) -> Result<(), ClientError>
    where
        O: MapObserver<K, V> + 'static,
    {
        self.core
            .observe(Arc::new(MapAdapter::<K, V, O>::new(observer)))
    }

    fn read_entries<R>(&self, f: impl FnOnce(&Entries) -> R) -> Result<R, ClientError> {
        self.core.read(|model| match model.state() {
            LaneState::Map(entries) => f(entries),
            _ => f(&Entries::new()),
        })
    }

    fn edit(&self, action: MapAction) -> Result<Option<StateChange>, ClientError> {
        self.core
            .update(|model, config, fx| model.edit_map(action, config, fx))
    }

    pub fn len(&self) -> Result<usize, ClientError> {
        self.read_entries(Entries::len)
    }

    pub fn is_empty(&self) -> Result<bool, ClientError> {
        self.read_entries(Entries::is_empty)
    }

    pub fn get(&self, key: &K) -> Result<Option<V>, ClientError> {
        let key = map_key(&serde_json::to_value(key)?);
        let value = self.read_entries(|entries| entries.get(&key).map(|(_, value)| value.clone()))?;
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool, ClientError> {
        let key = map_key(&serde_json::to_value(key)?);
        self.read_entries(|entries| entries.contains_key(&key))
    }

    /// Keys in map order.
    pub fn keys(&self) -> Result<Vec<K>, ClientError> {
        let keys = self.read_entries(|entries| {
            entries.values().map(|(key, _)| key.clone()).collect::<Vec<_>>()
        })?;
        keys.into_iter()
            .map(|key| serde_json::from_value(key).map_err(ClientError::from))
            .collect()
    }

    /// Snapshot of every entry in map order.
    pub fn entries(&self) -> Result<Vec<(K, V)>, ClientError> {
        let entries = self.read_entries(|entries| entries.values().cloned().collect::<Vec<_>>())?;
        entries
            .into_iter()
            .map(|(key, value)| -> Result<(K, V), ClientError> {
                Ok((serde_json::from_value(key)?, serde_json::from_value(value)?))
            })
            .collect()
    }

    /// Inserts or replaces `key`, returning the previous value.
    pub fn set(&self, key: &K, value: &V) -> Result<Option<V>, ClientError> {
        let key = serde_json::to_value(key)?;
        let value = serde_json::to_value(value)?;
        match self.edit(MapAction::Update { key, value })? {
            Some(StateChange::MapUpdate { old: Some(old), .. }) => {
                Ok(Some(serde_json::from_value(old)?))
            }
            _ => Ok(None),
        }
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&self, key: &K) -> Result<Option<V>, ClientError> {
        let key = serde_json::to_value(key)?;
        match self.edit(MapAction::Remove { key })? {
            Some(StateChange::MapRemove { old, .. }) => Ok(Some(serde_json::from_value(old)?)),
            _ => Ok(None),
        }
    }

    pub fn clear(&self) -> Result<(), ClientError> {
        self.edit(MapAction::Clear).map(|_| ())
    }

    /// Removes the first `count` entries in map order.
    pub fn drop_front(&self, count: usize) -> Result<(), ClientError> {
        self.edit(MapAction::Drop { count }).map(|_| ())
    }

    /// Keeps only the first `count` entries in map order.
    pub fn take_front(&self, count: usize) -> Result<(), ClientError> {
        self.edit(MapAction::Take { count }).map(|_| ())
    }
}
