use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use warp_codec::body::ListAction;
use warp_codec::Value;

use super::HandleCore;
use crate::error::ClientError;
use crate::model::LaneState;
use crate::observer::{ListAdapter, ListObserver, StateChange};

/// Downlink to an ordered list edited by index.
///
/// Edits apply to the local copy at once, notify observers, and are sent to
/// the lane as commands.
pub struct ListDownlink<V> {
    core: HandleCore,
    _value: PhantomData<fn() -> V>,
}

impl<V> ListDownlink<V>
where
    V: Serialize + DeserializeOwned + 'static,
{
    pub(crate) fn new(core: HandleCore) -> Self {
        Self {
            core,
            _value: PhantomData,
        }
    }

    handle_common!();

    pub fn observe<O>(&self, observer: Arc<O>) -> Result<(), ClientError>
    where
        O: ListObserver<V> + 'static,
    {
        self.core
            .observe(Arc::new(ListAdapter::<V, O>::new(observer)))
    }

    fn read_items<R>(&self, f: impl FnOnce(&[Value]) -> R) -> Result<R, ClientError> {
        self.core.read(|model| match model.state() {
            LaneState::List(items) => f(items),
            _ => f(&[]),
        })
    }

    fn edit(&self, action: ListAction) -> Result<StateChange, ClientError> {
        self.core
            .update(|model, config, fx| model.edit_list(action, config, fx))
    }

    pub fn len(&self) -> Result<usize, ClientError> {
        self.read_items(<[Value]>::len)
    }

    pub fn is_empty(&self) -> Result<bool, ClientError> {
        self.read_items(<[Value]>::is_empty)
    }

    pub fn get(&self, index: usize) -> Result<Option<V>, ClientError> {
        let item = self.read_items(|items| items.get(index).cloned())?;
        Ok(item.map(serde_json::from_value).transpose()?)
    }

    /// Snapshot of every item in order.
    pub fn values(&self) -> Result<Vec<V>, ClientError> {
        let items = self.read_items(<[Value]>::to_vec)?;
        items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(ClientError::from))
            .collect()
    }

    /// Replaces the item at `index`. `index == len` appends.
    pub fn set(&self, index: usize, value: &V) -> Result<(), ClientError> {
        let value = serde_json::to_value(value)?;
        self.edit(ListAction::Update { index, value }).map(|_| ())
    }

    pub fn insert(&self, index: usize, value: &V) -> Result<(), ClientError> {
        let value = serde_json::to_value(value)?;
        self.edit(ListAction::Insert { index, value }).map(|_| ())
    }

    pub fn push(&self, value: &V) -> Result<(), ClientError> {
        let value = serde_json::to_value(value)?;
        self.core.update(|model, config, fx| {
            let index = match model.state() {
                LaneState::List(items) => items.len(),
                _ => 0,
            };
            model
                .edit_list(ListAction::Insert { index, value }, config, fx)
                .map(|_| ())
        })
    }

    /// Removes and returns the item at `index`.
    pub fn remove(&self, index: usize) -> Result<V, ClientError> {
        match self.edit(ListAction::Remove { index })? {
            StateChange::ListRemove { old, .. } => Ok(serde_json::from_value(old)?),
            other => Err(ClientError::Coercion(format!(
                "unexpected list change {other:?}"
            ))),
        }
    }

    /// Moves the item at `from` so that it ends up at `to`.
    pub fn move_item(&self, from: usize, to: usize) -> Result<(), ClientError> {
        self.edit(ListAction::Move { from, to }).map(|_| ())
    }

    /// Removes `delete_count` items at `start` and inserts `items` in their
    /// place. Bounds are checked before anything is applied.
    pub fn splice(&self, start: usize, delete_count: usize, items: &[V]) -> Result<(), ClientError> {
        let values = items
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        self.core.update(|model, config, fx| {
            let len = match model.state() {
                LaneState::List(items) => items.len(),
                _ => 0,
            };
            if start > len {
                return Err(ClientError::IndexOutOfBounds { index: start, len });
            }
            if start + delete_count > len {
                return Err(ClientError::IndexOutOfBounds {
                    index: start + delete_count - 1,
                    len,
                });
            }
            for _ in 0..delete_count {
                model.edit_list(ListAction::Remove { index: start }, config, fx)?;
            }
            for (offset, value) in values.into_iter().enumerate() {
                model.edit_list(
                    ListAction::Insert {
                        index: start + offset,
                        value,
                    },
                    config,
                    fx,
                )?;
            }
            Ok(())
        })
    }

    pub fn clear(&self) -> Result<(), ClientError> {
        self.edit(ListAction::Clear).map(|_| ())
    }

    /// Removes the first `count` items.
    pub fn drop_front(&self, count: usize) -> Result<(), ClientError> {
        self.edit(ListAction::Drop { count }).map(|_| ())
    }

    /// Keeps only the first `count` items.
    pub fn take_front(&self, count: usize) -> Result<(), ClientError> {
        self.edit(ListAction::Take { count }).map(|_| ())
    }
}
