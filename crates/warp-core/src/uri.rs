use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WarpError;

/// Opaque URI text with a total order, used for hosts, nodes, and lanes.
///
/// Only the pieces the runtime needs are interpreted: an optional
/// `scheme://authority` endpoint prefix and the remaining path. Everything
/// else is compared as plain text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Uri(String);

fn is_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

impl Uri {
    /// Parses URI text, trimming surrounding whitespace.
    pub fn parse(input: &str) -> Result<Self, WarpError> {
        let text = input.trim();
        if text.is_empty() {
            return Err(WarpError::InvalidUri("empty"));
        }
        if text.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(WarpError::InvalidUri("contains whitespace"));
        }
        if let Some((scheme, rest)) = text.split_once("://") {
            if !is_scheme(scheme) {
                return Err(WarpError::InvalidUri("malformed scheme"));
            }
            if rest.is_empty() || rest.starts_with(['/', '?', '#']) {
                return Err(WarpError::InvalidUri("missing authority"));
            }
        }
        Ok(Self(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Scheme of an absolute URI (`ws`, `wss`, `warp`, ...).
    pub fn scheme(&self) -> Option<&str> {
        let (scheme, _) = self.0.split_once("://")?;
        is_scheme(scheme).then_some(scheme)
    }

    /// True when the URI carries its own `scheme://authority` endpoint.
    pub fn is_absolute(&self) -> bool {
        self.scheme().is_some()
    }

    fn split_endpoint(&self) -> Option<(&str, &str)> {
        let scheme = self.scheme()?;
        let authority_start = scheme.len() + 3;
        let rest = &self.0[authority_start..];
        let authority_len = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        Some(self.0.split_at(authority_start + authority_len))
    }

    /// Returns the `scheme://authority` prefix of an absolute URI.
    pub fn endpoint(&self) -> Option<Uri> {
        self.split_endpoint()
            .map(|(endpoint, _)| Uri(endpoint.to_string()))
    }

    /// Returns everything after the endpoint, or the whole text when relative.
    pub fn path(&self) -> &str {
        match self.split_endpoint() {
            Some((_, path)) => path,
            None => &self.0,
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Uri {
    type Err = WarpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Uri {
    type Error = WarpError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for Uri {
    type Error = WarpError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Uri> for String {
    fn from(uri: Uri) -> Self {
        uri.0
    }
}

impl AsRef<str> for Uri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
