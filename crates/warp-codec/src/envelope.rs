use serde::{Deserialize, Serialize};
use warp_core::Uri;

use crate::error::CodecError;
use crate::Value;

/// Frames longer than this are rejected before JSON parsing.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

fn is_zero(value: &f64) -> bool {
    *value == 0.0
}

/// Lane-addressed message that also carries link priority and rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkMessage {
    /// Target node.
    pub node: Uri,
    /// Target lane on `node`.
    pub lane: Uri,
    /// Relative link priority hint.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub prio: f64,
    /// Maximum event rate hint.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub rate: f64,
    /// Opaque body.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

/// Message addressed to one lane of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneMessage {
    pub node: Uri,
    pub lane: Uri,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

/// Message addressed to the host session as a whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMessage {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

/// One WARP protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "lowercase")]
pub enum Envelope {
    /// Client asks to receive events for a lane.
    Link(LinkMessage),
    /// Client asks to link and replay the current lane state.
    Sync(LinkMessage),
    /// Server acknowledges a link or sync.
    Linked(LinkMessage),
    /// Server marks the end of a state replay.
    Synced(LaneMessage),
    /// Server publishes an incremental lane update.
    Event(LaneMessage),
    /// Client asks the lane to apply a mutation.
    Command(LaneMessage),
    /// Client releases its interest in a lane.
    Unlink(LaneMessage),
    /// Server terminated a link.
    Unlinked(LaneMessage),
    /// Client presents credentials.
    Auth(HostMessage),
    /// Server accepted credentials.
    Authed(HostMessage),
    /// Client drops credentials.
    Deauth(HostMessage),
    /// Server acknowledged deauthentication.
    Deauthed(HostMessage),
}

impl Envelope {
    pub fn link(node: Uri, lane: Uri, prio: f64, rate: f64, body: Value) -> Self {
        Self::Link(LinkMessage {
            node,
            lane,
            prio,
            rate,
            body,
        })
    }

    pub fn sync(node: Uri, lane: Uri, prio: f64, rate: f64, body: Value) -> Self {
        Self::Sync(LinkMessage {
            node,
            lane,
            prio,
            rate,
            body,
        })
    }

    pub fn linked(node: Uri, lane: Uri) -> Self {
        Self::Linked(LinkMessage {
            node,
            lane,
            prio: 0.0,
            rate: 0.0,
            body: Value::Null,
        })
    }

    pub fn synced(node: Uri, lane: Uri) -> Self {
        Self::Synced(LaneMessage {
            node,
            lane,
            body: Value::Null,
        })
    }

    pub fn event(node: Uri, lane: Uri, body: Value) -> Self {
        Self::Event(LaneMessage { node, lane, body })
    }

    pub fn command(node: Uri, lane: Uri, body: Value) -> Self {
        Self::Command(LaneMessage { node, lane, body })
    }

    pub fn unlink(node: Uri, lane: Uri) -> Self {
        Self::Unlink(LaneMessage {
            node,
            lane,
            body: Value::Null,
        })
    }

    pub fn unlinked(node: Uri, lane: Uri, body: Value) -> Self {
        Self::Unlinked(LaneMessage { node, lane, body })
    }

    pub fn auth(body: Value) -> Self {
        Self::Auth(HostMessage { body })
    }

    pub fn authed(body: Value) -> Self {
        Self::Authed(HostMessage { body })
    }

    pub fn deauth(body: Value) -> Self {
        Self::Deauth(HostMessage { body })
    }

    pub fn deauthed(body: Value) -> Self {
        Self::Deauthed(HostMessage { body })
    }

    /// Wire tag of this envelope.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Link(_) => "link",
            Self::Sync(_) => "sync",
            Self::Linked(_) => "linked",
            Self::Synced(_) => "synced",
            Self::Event(_) => "event",
            Self::Command(_) => "command",
            Self::Unlink(_) => "unlink",
            Self::Unlinked(_) => "unlinked",
            Self::Auth(_) => "auth",
            Self::Authed(_) => "authed",
            Self::Deauth(_) => "deauth",
            Self::Deauthed(_) => "deauthed",
        }
    }

    /// `(node, lane)` route for lane-addressed envelopes; `None` for host ones.
    pub fn route(&self) -> Option<(&Uri, &Uri)> {
        match self {
            Self::Link(m) | Self::Sync(m) | Self::Linked(m) => Some((&m.node, &m.lane)),
            Self::Synced(m)
            | Self::Event(m)
            | Self::Command(m)
            | Self::Unlink(m)
            | Self::Unlinked(m) => Some((&m.node, &m.lane)),
            Self::Auth(_) | Self::Authed(_) | Self::Deauth(_) | Self::Deauthed(_) => None,
        }
    }

    pub fn body(&self) -> &Value {
        match self {
            Self::Link(m) | Self::Sync(m) | Self::Linked(m) => &m.body,
            Self::Synced(m)
            | Self::Event(m)
            | Self::Command(m)
            | Self::Unlink(m)
            | Self::Unlinked(m) => &m.body,
            Self::Auth(m) | Self::Authed(m) | Self::Deauth(m) | Self::Deauthed(m) => &m.body,
        }
    }

    /// True for the server→client half of the taxonomy.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::Linked(_)
                | Self::Synced(_)
                | Self::Event(_)
                | Self::Unlinked(_)
                | Self::Authed(_)
                | Self::Deauthed(_)
        )
    }
}

/// Encodes an envelope as one JSON text frame.
pub fn encode_envelope(envelope: &Envelope) -> Result<String, CodecError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decodes one JSON text frame into an envelope.
pub fn decode_envelope(frame: &str) -> Result<Envelope, CodecError> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(CodecError::InvalidFrame("frame exceeds MAX_FRAME_LEN"));
    }
    if frame.trim().is_empty() {
        return Err(CodecError::InvalidFrame("empty frame"));
    }
    Ok(serde_json::from_str(frame)?)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use warp_core::Uri;

    use super::{decode_envelope, encode_envelope, Envelope};
    use crate::error::CodecError;
    use crate::Value;

    fn uri(text: &str) -> Uri {
        Uri::parse(text).expect("test uri")
    }

    #[test]
    fn link_omits_zero_prio_rate_and_null_body() {
        let frame = encode_envelope(&Envelope::link(
            uri("house/kitchen"),
            uri("light"),
            0.0,
            0.0,
            Value::Null,
        ))
        .expect("encode");
        assert_eq!(
            frame,
            r#"{"tag":"link","node":"house/kitchen","lane":"light"}"#
        );
    }

    #[test]
    fn decode_fills_defaults_for_missing_fields() {
        let env = decode_envelope(r#"{"tag":"sync","node":"n","lane":"l"}"#).expect("decode");
        assert_eq!(env, Envelope::sync(uri("n"), uri("l"), 0.0, 0.0, Value::Null));
    }

    #[test]
    fn route_and_body_accessors_cover_both_families() {
        let event = Envelope::event(uri("n"), uri("l"), json!("on"));
        assert_eq!(event.route(), Some((&uri("n"), &uri("l"))));
        assert_eq!(event.body(), &json!("on"));
        assert_eq!(event.tag(), "event");
        assert!(event.is_response());

        let auth = Envelope::auth(json!({"token": "t"}));
        assert_eq!(auth.route(), None);
        assert_eq!(auth.tag(), "auth");
        assert!(!auth.is_response());
    }

    #[test]
    fn decode_rejects_unknown_tag_and_empty_frames() {
        assert!(matches!(
            decode_envelope(r#"{"tag":"bogus","node":"n","lane":"l"}"#),
            Err(CodecError::Json(_))
        ));
        assert!(matches!(
            decode_envelope("  "),
            Err(CodecError::InvalidFrame("empty frame"))
        ));
    }

    #[test]
    fn decode_rejects_lane_message_with_invalid_uri() {
        assert!(decode_envelope(r#"{"tag":"event","node":"","lane":"l"}"#).is_err());
    }
}
