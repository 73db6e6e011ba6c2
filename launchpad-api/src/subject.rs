use std::{fmt, str::FromStr};

use anyhow::anyhow;
use uuid::Uuid;

use crate::{validate_string, Error, STUB_UUID};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct SubjectId(pub Uuid);

impl SubjectId {
    pub fn stub() -> SubjectId {
        SubjectId(STUB_UUID)
    }
}

/// What a comment thread is attached to
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SubjectType {
    Article,
    Launch,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::Article => "article",
            SubjectType::Launch => "launch",
        }
    }
}

impl FromStr for SubjectType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<SubjectType> {
        match s {
            "article" => Ok(SubjectType::Article),
            "launch" => Ok(SubjectType::Launch),
            _ => Err(anyhow!("unknown subject type {s:?}")),
        }
    }
}

impl fmt::Display for SubjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct SubjectRef {
    #[serde(rename = "type")]
    pub kind: SubjectType,
    pub id: SubjectId,
}

impl SubjectRef {
    pub fn article(id: Uuid) -> SubjectRef {
        SubjectRef {
            kind: SubjectType::Article,
            id: SubjectId(id),
        }
    }

    pub fn launch(id: Uuid) -> SubjectRef {
        SubjectRef {
            kind: SubjectType::Launch,
            id: SubjectId(id),
        }
    }
}

/// Registration of an article or launch, so that it can receive comments
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NewSubject {
    pub subject: SubjectRef,
    pub title: String,
}

impl NewSubject {
    pub fn validate(&self) -> Result<(), Error> {
        validate_string(&self.title)
    }
}
