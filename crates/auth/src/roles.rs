//! Role-based access control primitives.

use serde::{Deserialize, Serialize};

/// Roles a bearer token may carry.
///
/// The set is closed: tokens naming anything else fail to decode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Public,
    Admin,
    Registrar,
    Client,
    Reader,
    Appender,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Public => "public",
            Role::Admin => "admin",
            Role::Registrar => "registrar",
            Role::Client => "client",
            Role::Reader => "reader",
            Role::Appender => "appender",
        }
    }

    /// Whether this role alone grants the action.
    ///
    /// `client` inherits reader and appender and owns notifications.
    pub fn allows(&self, action: Action) -> bool {
        match (self, action) {
            (Role::Admin, Action::ManageLedgers) => true,
            (Role::Registrar, Action::ManageRegistry) => true,
            (Role::Reader, Action::ReplayEvents) => true,
            (Role::Appender, Action::AppendEvents) => true,
            (
                Role::Client,
                Action::ReplayEvents | Action::AppendEvents | Action::Notifications,
            ) => true,
            _ => false,
        }
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guarded operations, grouped the way the HTTP surface groups them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Action {
    /// Create, read, reset, remove and download ledgers.
    ManageLedgers,
    /// Register and unregister event types.
    ManageRegistry,
    /// Replay events through selectors.
    ReplayEvents,
    /// Append events.
    AppendEvents,
    /// Open channels, subscribe, receive notifications.
    Notifications,
}

/// Whether any of the granted roles allows the action.
pub fn allows(roles: &[Role], action: Action) -> bool {
    roles.iter().any(|role| role.allows(action))
}
