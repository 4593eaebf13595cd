//! Chat roles used to format prefilled text

use std::fmt;
use std::str::FromStr;

use crate::error::SessionError;

/// The speaker of a prefilled text turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Instructions that frame the conversation
    System,
    /// A turn written by the user; generation continues as the assistant
    User,
    /// A turn previously produced by the model
    Assistant,
}

impl Role {
    /// The role name as chat templates expect it
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Whether a turn with this role is followed by the assistant prompt
    pub fn opens_generation(self) -> bool {
        self == Role::User
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(SessionError::UnknownRole(s.to_string())),
        }
    }
}
