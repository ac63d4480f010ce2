use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::HandleCore;
use crate::error::ClientError;
use crate::model::LaneState;
use crate::observer::{ValueAdapter, ValueObserver};

/// Downlink to a single replaceable value.
pub struct ValueDownlink<V> {
    core: HandleCore,
    _value: PhantomData<fn() -> V>,
}

impl<V> ValueDownlink<V>
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
        O: ValueObserver<V> + 'static,
    {
        self.core
            .observe(Arc::new(ValueAdapter::<V, O>::new(observer)))
    }

    /// Current value, or `None` before the lane has reported one. A `null`
    /// sent by the lane is a value and is coerced like any other, so use an
    /// `Option` value type for lanes that may hold `null`.
    pub fn get(&self) -> Result<Option<V>, ClientError> {
        let value = self.core.read(|model| match model.state() {
            LaneState::Value(value) => value.clone(),
            _ => None,
        })?;
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    /// Sets the value locally and commands the lane to do the same.
    pub fn set(&self, value: &V) -> Result<(), ClientError> {
        let body = serde_json::to_value(value)?;
        self.core
            .update(|model, config, fx| model.set_value(body, config, fx))
    }
}
