//! Session key construction and fork name resolution.
//!
//! A base session is keyed `channel:user`; its forks are keyed
//! `channel:user:name`.

use crate::error::SessionError;

/// Label under which the base session of a user is listed.
pub const MAIN_SESSION: &str = "main";

/// Key of the base session for a `(channel, user)` pair.
pub fn session_key(channel: &str, user: &str) -> String {
    format!("{channel}:{user}")
}

/// Key of the fork `name` of the base session `base`.
pub fn fork_key(base: &str, name: &str) -> String {
    format!("{base}:{name}")
}

/// Resolve a session name (as used by switching) to a full key.
///
/// Empty and `"main"` refer to the base session.
pub fn resolve_key(base: &str, name: &str) -> String {
    let name = name.trim();
    if name.is_empty() || name == MAIN_SESSION {
        base.to_string()
    } else {
        fork_key(base, name)
    }
}

/// Label of `key` among the sessions of `base`, or `None` if `key` belongs
/// to someone else.
pub fn session_label<'a>(base: &str, key: &'a str) -> Option<&'a str> {
    if key == base {
        return Some(MAIN_SESSION);
    }
    key.strip_prefix(base)?.strip_prefix(':')
}

/// Reject fork names that could not be addressed by [`resolve_key`].
pub fn validate_fork_name(name: &str) -> Result<(), SessionError> {
    let reason = if name.trim().is_empty() {
        "name must not be empty"
    } else if name == MAIN_SESSION {
        "\"main\" is reserved for the base session"
    } else if name.contains(':') {
        "name must not contain ':'"
    } else if name.trim() != name {
        "name must not have surrounding whitespace"
    } else {
        return Ok(());
    };
    Err(SessionError::InvalidName {
        name: name.to_string(),
        reason,
    })
}
