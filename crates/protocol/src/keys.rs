//! Pub/sub and presence key grammar.
//!
//! Three key families fan frames out across instances:
//! `chat:channel:{id}`, `channel:{id}:events`, `user:{id}:notifications`.
//! The same module owns the presence and rate-limit key builders so every
//! key the system writes is spelled in one place.

/// Subscription patterns the bridge listens on.
pub const SUBSCRIBE_PATTERNS: &[&str] = &[
    "chat:channel:*",
    "channel:*:events",
    "user:*:notifications",
];

/// Set of currently-online user ids.
pub const ONLINE_USERS: &str = "online_users";

#[must_use]
pub fn chat_channel(channel_id: &str) -> String {
    format!("chat:channel:{channel_id}")
}

#[must_use]
pub fn channel_events(channel_id: &str) -> String {
    format!("channel:{channel_id}:events")
}

#[must_use]
pub fn user_notifications(user_id: &str) -> String {
    format!("user:{user_id}:notifications")
}

#[must_use]
pub fn user_status(user_id: &str) -> String {
    format!("user:{user_id}:status")
}

#[must_use]
pub fn channel_members(channel_id: &str) -> String {
    format!("channel:{channel_id}:members")
}

#[must_use]
pub fn user_channels(user_id: &str) -> String {
    format!("user:{user_id}:channels")
}

#[must_use]
pub fn rate_limit_message(user_id: &str, channel_id: &str) -> String {
    format!("rate_limit:message:{user_id}:{channel_id}")
}

#[must_use]
pub fn rate_limit_websocket(user_id: &str) -> String {
    format!("rate_limit:websocket:{user_id}")
}

// ── Routing ──────────────────────────────────────────────────────────────────

/// A parsed delivery key, telling the bridge which local broadcast to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKey {
    /// `chat:channel:{id}`: a chat message for a channel.
    ChatChannel(String),
    /// `channel:{id}:events`: member and typing events for a channel.
    ChannelEvents(String),
    /// `user:{id}:notifications`: direct server-to-user frames.
    UserNotifications(String),
}

impl RouteKey {
    /// Parse a delivery key. Returns `None` for keys outside the grammar;
    /// callers log and ignore those.
    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split(':').collect();
        match parts.as_slice() {
            ["chat", "channel", id] if !id.is_empty() => {
                Some(Self::ChatChannel((*id).to_string()))
            },
            ["channel", id, "events"] if !id.is_empty() => {
                Some(Self::ChannelEvents((*id).to_string()))
            },
            ["user", id, "notifications"] if !id.is_empty() => {
                Some(Self::UserNotifications((*id).to_string()))
            },
            _ => None,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_and_parser_agree() {
        assert_eq!(
            RouteKey::parse(&chat_channel("7")),
            Some(RouteKey::ChatChannel("7".into()))
        );
        assert_eq!(
            RouteKey::parse(&channel_events("7")),
            Some(RouteKey::ChannelEvents("7".into()))
        );
        assert_eq!(
            RouteKey::parse(&user_notifications("42")),
            Some(RouteKey::UserNotifications("42".into()))
        );
    }

    #[test]
    fn parse_rejects_foreign_keys() {
        assert_eq!(RouteKey::parse("chat:channel:"), None);
        assert_eq!(RouteKey::parse("channel:7:members"), None);
        assert_eq!(RouteKey::parse("user:42:status"), None);
        assert_eq!(RouteKey::parse("db:migration:status"), None);
        assert_eq!(RouteKey::parse("garbage"), None);
    }

    #[test]
    fn rate_limit_keys() {
        assert_eq!(rate_limit_message("42", "7"), "rate_limit:message:42:7");
        assert_eq!(rate_limit_websocket("42"), "rate_limit:websocket:42");
    }
}
