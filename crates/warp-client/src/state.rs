use warp_codec::Value;

/// Link progress of one shared downlink model.
///
/// A model only moves forward through
/// `Unlinked -> Linking -> Linked -> Syncing -> Synced`, or falls straight
/// back to `Unlinked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LinkState {
    Unlinked,
    Linking,
    Linked,
    Syncing,
    Synced,
}

impl LinkState {
    /// True once the server has acknowledged the link.
    pub fn is_linked(self) -> bool {
        self >= Self::Linked
    }

    pub fn is_synced(self) -> bool {
        self == Self::Synced
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: LinkState) -> bool {
        matches!(
            (self, next),
            (Self::Unlinked, Self::Linking)
                | (Self::Linking, Self::Linked)
                | (Self::Linked, Self::Syncing)
                | (Self::Syncing, Self::Synced)
        ) || (next == Self::Unlinked && self != Self::Unlinked)
    }
}

/// Shape of the state a downlink tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownlinkKind {
    /// Stateless stream of events.
    Event,
    /// Single replaceable value.
    Value,
    /// Ordered list edited by index.
    List,
    /// Key-ordered map edited by key.
    Map,
}

/// Link parameters supplied when opening a downlink.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkOptions {
    /// Relative priority hint sent with `link`/`sync`.
    pub prio: f64,
    /// Maximum event rate hint sent with `link`/`sync`.
    pub rate: f64,
    /// Opaque body sent with `link`/`sync`.
    pub body: Value,
    /// Relink after the server or transport drops the link, and keep the
    /// cached state when the last downlink closes. When false the downlinks
    /// close as soon as the link is lost.
    pub keep_linked: bool,
    /// Request a full state replay (`sync`) instead of a plain `link`.
    pub keep_synced: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            prio: 0.0,
            rate: 0.0,
            body: Value::Null,
            keep_linked: true,
            keep_synced: true,
        }
    }
}

impl LinkOptions {
    /// Defaults for an event downlink: linked but not synced.
    pub fn event() -> Self {
        Self {
            keep_synced: false,
            ..Self::default()
        }
    }

    pub fn with_prio(mut self, prio: f64) -> Self {
        self.prio = prio;
        self
    }

    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_keep_linked(mut self, keep_linked: bool) -> Self {
        self.keep_linked = keep_linked;
        self
    }

    pub fn with_keep_synced(mut self, keep_synced: bool) -> Self {
        self.keep_synced = keep_synced;
        self
    }

    /// Folds a later handle's options into these. Flags only widen; wire
    /// parameters stay with the handle that created the model.
    ///
    /// Returns true if `keep_synced` was newly turned on.
    pub(crate) fn widen(&mut self, other: &LinkOptions) -> bool {
        self.keep_linked |= other.keep_linked;
        let newly_synced = !self.keep_synced && other.keep_synced;
        self.keep_synced |= other.keep_synced;
        newly_synced
    }
}
