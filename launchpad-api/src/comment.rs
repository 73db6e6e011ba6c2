use uuid::Uuid;

use crate::{validate_string, Error, Requester, SubjectRef, Time, UserId, STUB_UUID};

/// Replaces the content of soft-deleted comments
pub const TOMBSTONE: &str = "[deleted]";

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct CommentId(pub Uuid);

impl CommentId {
    pub fn stub() -> CommentId {
        CommentId(STUB_UUID)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Comment {
    pub id: CommentId,
    pub parent_id: Option<CommentId>,
    pub subject: SubjectRef,
    pub author_id: UserId,
    pub content: String,

    /// Number of users currently liking this comment
    pub like_count: i64,

    pub is_approved: bool,
    pub is_deleted: bool,

    /// 0 for top-level comments, parent's depth + 1 for replies
    pub depth: i32,

    pub created_at: Time,
    pub updated_at: Option<Time>,
}

impl Comment {
    /// Unapproved comments are only visible to their author and to moderators
    pub fn is_visible_to(&self, requester: Option<&Requester>) -> bool {
        self.is_approved
            || requester.map_or(false, |r| r.can_moderate() || r.user == self.author_id)
    }

    pub fn check_read(&self, requester: Option<&Requester>) -> Result<(), Error> {
        if !self.is_visible_to(requester) {
            return Err(Error::CommentNotFound(self.id));
        }
        Ok(())
    }

    /// Only the author may edit a comment, and tombstones are never edited
    pub fn check_edit(&self, requester: &Requester) -> Result<(), Error> {
        self.check_read(Some(requester))?;
        if self.is_deleted {
            return Err(Error::CommentNotFound(self.id));
        }
        if self.author_id != requester.user {
            return Err(Error::PermissionDenied);
        }
        Ok(())
    }

    pub fn check_delete(&self, requester: &Requester) -> Result<(), Error> {
        self.check_read(Some(requester))?;
        if self.author_id != requester.user && !requester.can_moderate() {
            return Err(Error::PermissionDenied);
        }
        Ok(())
    }

    pub fn check_like(&self, requester: &Requester) -> Result<(), Error> {
        self.check_read(Some(requester))?;
        if self.is_deleted {
            return Err(Error::CommentNotFound(self.id));
        }
        Ok(())
    }

    /// Turns this comment into a tombstone, keeping its place in the thread
    pub fn tombstone(&mut self, now: Time) {
        self.content = String::from(TOMBSTONE);
        self.is_deleted = true;
        self.updated_at = Some(now);
    }
}

/// Limits applied to comment writes
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommentPolicy {
    /// If set, new comments wait for a moderator's approval
    pub pre_moderation: bool,

    /// Depth of the deepest comment that can still be replied to (0-indexed)
    pub max_reply_depth: i32,

    /// Reject replies past `max_reply_depth`, instead of only hiding the reply affordance
    pub enforce_reply_depth: bool,

    /// In characters, after trimming
    pub max_content_len: usize,
}

impl Default for CommentPolicy {
    fn default() -> CommentPolicy {
        CommentPolicy {
            pre_moderation: false,
            max_reply_depth: 3,
            enforce_reply_depth: false,
            max_content_len: 10_000,
        }
    }
}

impl CommentPolicy {
    /// Returns the content that should actually be stored
    pub fn validate_content(&self, content: &str) -> Result<String, Error> {
        validate_string(content)?;
        let content = content.trim();
        if content.is_empty() {
            return Err(Error::EmptyContent);
        }
        let len = content.chars().count();
        if len > self.max_content_len {
            return Err(Error::ContentTooLong {
                len,
                max: self.max_content_len,
            });
        }
        Ok(String::from(content))
    }

    pub fn can_reply_at(&self, depth: i32) -> bool {
        depth < self.max_reply_depth
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NewComment {
    pub id: CommentId,
    pub subject: SubjectRef,
    pub parent_id: Option<CommentId>,
    pub content: String,
}

impl NewComment {
    /// Checks the would-be parent of this comment, and returns the depth of the new comment
    ///
    /// `parent` must be the stored comment with id `self.parent_id`, if any was found.
    pub fn reply_depth(
        &self,
        parent: Option<&Comment>,
        author: &Requester,
        policy: &CommentPolicy,
    ) -> Result<i32, Error> {
        let parent_id = match self.parent_id {
            None => return Ok(0),
            Some(p) => p,
        };
        let parent = match parent {
            Some(p)
                if p.id == parent_id
                    && p.subject == self.subject
                    && !p.is_deleted
                    && p.is_visible_to(Some(author)) =>
            {
                p
            }
            _ => return Err(Error::CommentNotFound(parent_id)),
        };
        if policy.enforce_reply_depth && !policy.can_reply_at(parent.depth) {
            return Err(Error::ReplyTooDeep {
                max_depth: policy.max_reply_depth,
            });
        }
        Ok(parent.depth + 1)
    }

    pub fn into_comment(
        self,
        author: &Requester,
        content: String,
        depth: i32,
        policy: &CommentPolicy,
        now: Time,
    ) -> Comment {
        Comment {
            id: self.id,
            parent_id: self.parent_id,
            subject: self.subject,
            author_id: author.user,
            content,
            like_count: 0,
            is_approved: !policy.pre_moderation,
            is_deleted: false,
            depth,
            created_at: now,
            updated_at: None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommentUpdate {
    pub content: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SetApproval {
    pub approved: bool,
}

/// Result of toggling a like
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LikeStatus {
    pub liked: bool,
    pub new_count: i64,
}
