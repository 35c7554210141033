use serde::{Deserialize, Serialize};

/// Header carrying a bot token.
pub const BOT_TOKEN_HEADER: &str = "X-Bot-Token";

/// Header carrying a user session token.
pub const SESSION_TOKEN_HEADER: &str = "X-Session-Token";

/// Credentials the client authenticates with.
///
/// A bare string is a bot token; an object is a user session as returned by
/// the login endpoint. The same value drives the websocket handshake and every
/// REST call, so both always pick the same header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Session {
    Bot(String),
    User {
        #[serde(rename = "_id")]
        id: String,
        token: String,
        user_id: String,
    },
}

impl Session {
    /// Raw token, as embedded in the handshake query string.
    pub fn token(&self) -> &str {
        match self {
            Self::Bot(token) => token,
            Self::User { token, .. } => token,
        }
    }

    /// Header name and value for REST requests.
    pub fn auth_header(&self) -> (&'static str, &str) {
        match self {
            Self::Bot(token) => (BOT_TOKEN_HEADER, token),
            Self::User { token, .. } => (SESSION_TOKEN_HEADER, token),
        }
    }

    /// Session id, if this is a user session.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Bot(_) => None,
            Self::User { id, .. } => Some(id),
        }
    }

    pub fn is_bot(&self) -> bool {
        matches!(self, Self::Bot(_))
    }
}
