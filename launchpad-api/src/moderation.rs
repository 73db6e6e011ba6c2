//! Decides which comments a requester gets to see.
//!
//! Everyone sees approved comments. Authors also see their own pending comments, and
//! moderators see everything.

use crate::{Comment, Error, Requester};

pub fn filter_visible(comments: Vec<Comment>, requester: Option<&Requester>) -> Vec<Comment> {
    if requester.map_or(false, |r| r.can_moderate()) {
        return comments;
    }
    comments
        .into_iter()
        .filter(|c| c.is_visible_to(requester))
        .collect()
}

pub fn check_moderator(requester: &Requester) -> Result<(), Error> {
    if !requester.can_moderate() {
        return Err(Error::PermissionDenied);
    }
    Ok(())
}

/// The moderation queue: comments still waiting for approval, oldest first
pub fn pending(mut comments: Vec<Comment>) -> Vec<Comment> {
    comments.retain(|c| !c.is_approved && !c.is_deleted);
    comments.sort_unstable_by_key(|c| (c.created_at, c.id));
    comments
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::{CommentId, Role, SubjectRef, UserId, Uuid};

    fn comment(author: UserId, approved: bool) -> Comment {
        Comment {
            id: CommentId(Uuid::new_v4()),
            parent_id: None,
            subject: SubjectRef::launch(Uuid::nil()),
            author_id: author,
            content: String::from("T-minus 10"),
            like_count: 0,
            is_approved: approved,
            is_deleted: false,
            depth: 0,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn visibility_by_role() {
        let author = UserId(Uuid::new_v4());
        let other = UserId(Uuid::new_v4());
        let comments = vec![
            comment(author, true),
            comment(author, false),
            comment(other, false),
        ];

        assert_eq!(filter_visible(comments.clone(), None), comments[..1].to_vec());

        let as_author = Requester {
            user: author,
            role: Role::Standard,
        };
        assert_eq!(
            filter_visible(comments.clone(), Some(&as_author)),
            comments[..2].to_vec()
        );

        let as_moderator = Requester {
            user: UserId(Uuid::new_v4()),
            role: Role::Moderator,
        };
        assert_eq!(
            filter_visible(comments.clone(), Some(&as_moderator)),
            comments
        );
    }

    #[test]
    fn moderator_check() {
        let user = UserId::stub();
        assert_eq!(
            check_moderator(&Requester {
                user,
                role: Role::Standard
            }),
            Err(Error::PermissionDenied)
        );
        assert_eq!(
            check_moderator(&Requester {
                user,
                role: Role::Admin
            }),
            Ok(())
        );
    }

    #[test]
    fn pending_queue() {
        let user = UserId::stub();
        let mut late = comment(user, false);
        late.created_at = late.created_at + Duration::seconds(10);
        let early = comment(user, false);
        let approved = comment(user, true);
        let mut deleted = comment(user, false);
        deleted.tombstone(Utc::now());

        assert_eq!(
            pending(vec![late.clone(), approved, deleted, early.clone()]),
            vec![early, late]
        );
    }
}
