//! Radio relay handles.

use crate::RelayId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-relay radio link state.
///
/// Owned by the transport. The engine keeps a cached copy that is refreshed
/// after every session on that relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkState {
    /// When the relay last completed a successful frequency tuning.
    pub last_tuned: Option<Duration>,
    /// Last frequency known to reach the pump, in MHz.
    pub frequency_mhz: Option<f64>,
}

/// One physical radio relay as reported by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayHandle {
    pub id: RelayId,
    pub name: String,
    pub connected: bool,
    pub link: LinkState,
}

impl RelayHandle {
    /// A connected relay with no tuning history.
    pub fn connected(id: RelayId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            connected: true,
            link: LinkState::default(),
        }
    }
}
