//! The one place that reads the per-group `contribute`/`use` flags. Every
//! scope decision flows through here, so the privacy policy of the global
//! pool cannot drift between call sites.

use crate::{
    database::GroupConfig,
    types::Scope,
};

/// Scopes consulted when matching a group's incoming messages: always the
/// group's own, plus the global pool when the group opted into using it.
/// Ordered so a local match wins over a global one.
#[must_use]
pub fn query_scopes(config: &GroupConfig) -> Vec<Scope> {
    let mut scopes = vec![Scope::Group(config.chat_id)];
    if config.use_global {
        scopes.push(Scope::Global);
    }
    scopes
}

/// Scopes a group's new blacklist entries are written into: always the
/// group's own, plus the global pool when the group opted into contributing.
#[must_use]
pub fn contribution_scopes(config: &GroupConfig) -> Vec<Scope> {
    let mut scopes = vec![Scope::Group(config.chat_id)];
    if config.contribute_global {
        scopes.push(Scope::Global);
    }
    scopes
}
