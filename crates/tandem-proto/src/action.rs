//! Logical channel names multiplexed over one physical link.

use crate::error::ProtoError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum action name length in bytes.
///
/// Bounded by the weakest transport backend; mesh data channels only carry
/// 12 bytes of channel label.
pub const MAX_ACTION_LEN: usize = 12;

/// The name of one logical channel ("action") on a connection.
///
/// Actions are independent of each other: each gets its own subscriber
/// list and, when opted into reliability, its own sequence space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Action(String);

impl Action {
    /// Validate and wrap an action name.
    ///
    /// Names must be non-empty and at most [`MAX_ACTION_LEN`] bytes.
    pub fn new(name: impl Into<String>) -> Result<Self, ProtoError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ProtoError::InvalidAction("empty action name".into()));
        }
        if name.len() > MAX_ACTION_LEN {
            return Err(ProtoError::InvalidAction(format!(
                "{name:?} exceeds {MAX_ACTION_LEN} bytes"
            )));
        }
        Ok(Self(name))
    }

    /// Get the action name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
