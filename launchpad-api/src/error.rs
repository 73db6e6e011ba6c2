use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde_json::json;
use uuid::Uuid;

use crate::{CommentId, SubjectId, SubjectRef, SubjectType};

/// Coarse classification of an [`Error`], as seen by the caller
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Authorization,
    Authentication,
    Conflict,
    Internal,
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Comment not found {0:?}")]
    CommentNotFound(CommentId),

    #[error("Subject not found {0:?}")]
    SubjectNotFound(SubjectRef),

    #[error("Comment content is empty")]
    EmptyContent,

    #[error("Comment content is {len} characters long, the maximum is {max}")]
    ContentTooLong { len: usize, max: usize },

    #[error("Replies cannot be nested deeper than {max_depth}")]
    ReplyTooDeep { max_depth: i32 },

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Uuid already used {0}")]
    UuidAlreadyUsed(Uuid),

    #[error("Name already used {0}")]
    NameAlreadyUsed(String),

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),

    #[error("Invalid character in name {0:?}")]
    InvalidName(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Unknown(_) => ErrorKind::Internal,
            Error::Unauthenticated => ErrorKind::Authentication,
            Error::PermissionDenied => ErrorKind::Authorization,
            Error::CommentNotFound(_) | Error::SubjectNotFound(_) => ErrorKind::NotFound,
            Error::EmptyContent
            | Error::ContentTooLong { .. }
            | Error::ReplyTooDeep { .. }
            | Error::MalformedRequest(_)
            | Error::NullByteInString(_)
            | Error::InvalidName(_) => ErrorKind::Validation,
            Error::UuidAlreadyUsed(_) | Error::NameAlreadyUsed(_) => ErrorKind::Conflict,
        }
    }

    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Authorization => StatusCode::FORBIDDEN,
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        serde_json::to_vec(&match self {
            Error::Unknown(msg) => json!({
                "message": msg,
                "type": "unknown",
            }),
            Error::Unauthenticated => json!({
                "message": "authentication required",
                "type": "unauthenticated",
            }),
            Error::PermissionDenied => json!({
                "message": "permission denied",
                "type": "permission-denied",
            }),
            Error::CommentNotFound(id) => json!({
                "message": "comment not found",
                "type": "comment-not-found",
                "comment_id": id.0,
            }),
            Error::SubjectNotFound(s) => json!({
                "message": "subject not found",
                "type": "subject-not-found",
                "subject_type": s.kind.as_str(),
                "subject_id": s.id.0,
            }),
            Error::EmptyContent => json!({
                "message": "comment content is empty",
                "type": "empty-content",
            }),
            Error::ContentTooLong { len, max } => json!({
                "message": "comment content is too long",
                "type": "content-too-long",
                "len": len,
                "max": max,
            }),
            Error::ReplyTooDeep { max_depth } => json!({
                "message": "reply nested too deep",
                "type": "reply-too-deep",
                "max_depth": max_depth,
            }),
            Error::MalformedRequest(msg) => json!({
                "message": msg,
                "type": "malformed-request",
            }),
            Error::UuidAlreadyUsed(u) => json!({
                "message": "uuid conflict",
                "type": "conflict-uuid",
                "uuid": u,
            }),
            Error::NameAlreadyUsed(n) => json!({
                "message": "name already used",
                "type": "conflict-name",
                "name": n,
            }),
            Error::NullByteInString(s) => json!({
                "message": "there was a null byte in argument string",
                "type": "null-byte",
                "string": s,
            }),
            Error::InvalidName(n) => json!({
                "message": "there was an invalid character in a user name",
                "type": "invalid-name",
                "name": n,
            }),
        })
        .expect("serializing error contents")
    }

    pub fn parse(body: &[u8]) -> anyhow::Result<Error> {
        let data: serde_json::Value =
            serde_json::from_slice(body).context("parsing error contents")?;
        let str_field = |field: &str| -> anyhow::Result<String> {
            data.get(field)
                .and_then(|s| s.as_str())
                .map(String::from)
                .ok_or_else(|| anyhow!("error is missing string field {field:?}"))
        };
        let uuid_field = |field: &str| -> anyhow::Result<Uuid> {
            Uuid::from_str(&str_field(field)?)
                .with_context(|| format!("parsing field {field:?} as an uuid"))
        };
        let int_field = |field: &str| -> anyhow::Result<i64> {
            data.get(field)
                .and_then(|i| i.as_i64())
                .ok_or_else(|| anyhow!("error is missing integer field {field:?}"))
        };
        Ok(
            match data
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| anyhow!("error type is not a string"))?
            {
                "unknown" => Error::Unknown(String::from(
                    data.get("message")
                        .and_then(|msg| msg.as_str())
                        .unwrap_or(""),
                )),
                "unauthenticated" => Error::Unauthenticated,
                "permission-denied" => Error::PermissionDenied,
                "comment-not-found" => Error::CommentNotFound(CommentId(uuid_field("comment_id")?)),
                "subject-not-found" => Error::SubjectNotFound(SubjectRef {
                    kind: SubjectType::from_str(&str_field("subject_type")?)?,
                    id: SubjectId(uuid_field("subject_id")?),
                }),
                "empty-content" => Error::EmptyContent,
                "content-too-long" => Error::ContentTooLong {
                    len: usize::try_from(int_field("len")?).context("parsing len")?,
                    max: usize::try_from(int_field("max")?).context("parsing max")?,
                },
                "reply-too-deep" => Error::ReplyTooDeep {
                    max_depth: i32::try_from(int_field("max_depth")?)
                        .context("parsing max_depth")?,
                },
                "malformed-request" => Error::MalformedRequest(str_field("message")?),
                "conflict-uuid" => Error::UuidAlreadyUsed(uuid_field("uuid")?),
                "conflict-name" => Error::NameAlreadyUsed(str_field("name")?),
                "null-byte" => Error::NullByteInString(str_field("string")?),
                "invalid-name" => Error::InvalidName(str_field("name")?),
                _ => return Err(anyhow!("error contents has unknown type")),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn through_json(e: Error) -> Error {
        Error::parse(&e.contents()).expect("parsing serialized error")
    }

    #[test]
    fn structured_errors_survive_json() {
        let comment = CommentId(Uuid::new_v4());
        assert_eq!(
            through_json(Error::CommentNotFound(comment)),
            Error::CommentNotFound(comment)
        );

        let subject = SubjectRef {
            kind: SubjectType::Launch,
            id: SubjectId(Uuid::new_v4()),
        };
        assert_eq!(
            through_json(Error::SubjectNotFound(subject)),
            Error::SubjectNotFound(subject)
        );

        assert_eq!(
            through_json(Error::ContentTooLong { len: 12, max: 10 }),
            Error::ContentTooLong { len: 12, max: 10 }
        );
        assert_eq!(
            through_json(Error::ReplyTooDeep { max_depth: 3 }),
            Error::ReplyTooDeep { max_depth: 3 }
        );
    }

    #[test]
    fn taxonomy_is_distinguishable() {
        assert_eq!(Error::EmptyContent.kind(), ErrorKind::Validation);
        assert_eq!(
            Error::CommentNotFound(CommentId::stub()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(Error::PermissionDenied.kind(), ErrorKind::Authorization);
        assert_eq!(Error::Unauthenticated.kind(), ErrorKind::Authentication);

        assert_eq!(Error::EmptyContent.status_code(), http::StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::Unauthenticated.status_code(),
            http::StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::PermissionDenied.status_code(),
            http::StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(Error::parse(br#"{"type": "no-such-error"}"#).is_err());
        assert!(Error::parse(b"not json").is_err());
    }
}
