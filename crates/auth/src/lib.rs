//! Auth: bearer claims and role-based access control.

pub mod claims;
pub mod roles;

pub use claims::{Claims, ClaimsError};
pub use roles::{allows, Action, Role};
