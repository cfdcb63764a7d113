//! Chat addresses (`user[:device]@server`).
//!
//! Individual accounts live on `s.whatsapp.net`, groups on `g.us`, and
//! status/broadcast traffic on `broadcast`.

use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Server for individual user accounts.
pub const USER_SERVER: &str = "s.whatsapp.net";
/// Server for group chats.
pub const GROUP_SERVER: &str = "g.us";
/// Server for status updates and broadcast lists.
pub const BROADCAST_SERVER: &str = "broadcast";

/// A parsed chat address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    /// Account part (phone number for users, group id for groups).
    pub user: String,
    /// Device index for multi-device addresses; 0 for the primary device.
    pub device: u16,
    pub server: String,
}

impl Jid {
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            device: 0,
            server: server.into(),
        }
    }

    /// Parse `user@server`, `user:device@server` or a bare `server`.
    pub fn parse(s: &str) -> GatewayResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(GatewayError::Validation("empty address".into()));
        }

        let Some((user_part, server)) = s.split_once('@') else {
            return Ok(Self::new("", s));
        };

        if server.is_empty() || server.contains('@') {
            return Err(GatewayError::Validation(format!("invalid address: {s}")));
        }

        let (user, device) = match user_part.split_once(':') {
            Some((user, device)) => {
                let device = device.parse::<u16>().map_err(|_| {
                    GatewayError::Validation(format!("invalid device in address: {s}"))
                })?;
                (user, device)
            }
            None => (user_part, 0),
        };

        Ok(Self {
            user: user.to_string(),
            device,
            server: server.to_string(),
        })
    }

    /// Build an individual-user address from a phone number.
    ///
    /// A leading `+` is tolerated; everything else must be ASCII digits.
    pub fn for_phone(phone: &str) -> GatewayResult<Self> {
        let digits = phone.trim().trim_start_matches('+');
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(GatewayError::Validation(format!(
                "invalid phone number: {phone:?}"
            )));
        }
        Ok(Self::new(digits, USER_SERVER))
    }

    pub fn is_broadcast(&self) -> bool {
        self.server == BROADCAST_SERVER
    }

    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    /// The address without its device suffix.
    pub fn to_non_device(&self) -> Self {
        Self::new(self.user.clone(), self.server.clone())
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.user.is_empty(), self.device) {
            (true, _) => write!(f, "{}", self.server),
            (false, 0) => write!(f, "{}@{}", self.user, self.server),
            (false, device) => write!(f, "{}:{}@{}", self.user, device, self.server),
        }
    }
}

impl FromStr for Jid {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Jid {
    type Error = GatewayError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.to_string()
    }
}
