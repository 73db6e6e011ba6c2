use std::{fmt, str::FromStr};

use anyhow::anyhow;
use uuid::Uuid;

use crate::{validate_string, Error, STUB_UUID};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn stub() -> UserId {
        UserId(STUB_UUID)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Standard,
    Moderator,
    Admin,
}

impl Role {
    /// Moderators see unapproved comments and may delete or approve any comment
    pub fn is_moderator(&self) -> bool {
        matches!(self, Role::Moderator | Role::Admin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Standard => "standard",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Role> {
        match s {
            "standard" => Ok(Role::Standard),
            "moderator" => Ok(Role::Moderator),
            "admin" => Ok(Role::Admin),
            _ => Err(anyhow!("unknown role {s:?}")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub role: Role,
}

/// The verified identity behind a request
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Requester {
    pub user: UserId,
    pub role: Role,
}

impl Requester {
    pub fn can_moderate(&self) -> bool {
        self.role.is_moderator()
    }
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct NewUser {
    pub id: UserId,
    pub name: String,
    pub role: Role,
    pub initial_password_hash: String,
}

impl NewUser {
    pub fn new(id: UserId, name: String, role: Role, initial_password: &str) -> NewUser {
        NewUser {
            id,
            name,
            role,
            initial_password_hash: bcrypt::hash(initial_password, bcrypt::DEFAULT_COST)
                .expect("failed hashing password"),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        validate_string(&self.name)?;
        validate_string(&self.initial_password_hash)?;
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(Error::InvalidName(self.name.clone()));
        }
        Ok(())
    }
}
