use chrono::Utc;

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<Utc>;

pub const STUB_UUID: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");

mod auth;
pub use auth::{AuthToken, NewSession};

mod comment;
pub use comment::{
    Comment, CommentId, CommentPolicy, CommentUpdate, LikeStatus, NewComment, SetApproval,
    TOMBSTONE,
};

mod error;
pub use error::{Error, ErrorKind};

pub mod moderation;

mod subject;
pub use subject::{NewSubject, SubjectId, SubjectRef, SubjectType};

pub mod thread;
pub use thread::{CommentNode, CommentPage, Sort, ThreadQuery};

mod user;
pub use user::{NewUser, Requester, Role, User, UserId};

pub fn validate_string(s: &str) -> Result<(), Error> {
    if s.contains('\0') {
        return Err(Error::NullByteInString(String::from(s)));
    }
    Ok(())
}
