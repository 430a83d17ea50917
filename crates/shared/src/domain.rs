use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(UserId);

/// Role tag carried by the realtime handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Customer,
    Guide,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Guide => "guide",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "customer" => Ok(Role::Customer),
            "guide" => Ok(Role::Guide),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role tag: {other}")),
        }
    }
}

/// Identity-scoped room every realtime connection joins.
pub fn room_for_user(user_id: &UserId) -> String {
    format!("room:{}", user_id.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_is_keyed_by_user_id() {
        assert_eq!(room_for_user(&UserId::new("u1")), "room:u1");
    }

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("Guide".parse::<Role>(), Ok(Role::Guide));
        assert!("pilot".parse::<Role>().is_err());
    }
}
