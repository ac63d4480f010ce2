use std::sync::Arc;

use super::HandleCore;
use crate::error::ClientError;
use crate::observer::{DownlinkObserver, EventAdapter};

/// Stateless downlink that reports every event and keeps nothing.
pub struct EventDownlink {
    core: HandleCore,
}

impl EventDownlink {
    pub(crate) fn new(core: HandleCore) -> Self {
        Self { core }
    }

    handle_common!();

    pub fn observe<O>(&self, observer: Arc<O>) -> Result<(), ClientError>
    where
        O: DownlinkObserver + 'static,
    {
        self.core.observe(Arc::new(EventAdapter::new(observer)))
    }
}
