use std::collections::HashSet;

use anyhow::Context;
use chrono::Utc;
use futures::TryStreamExt;
use launchpad_api::{
    moderation, thread, AuthToken, Comment, CommentId, CommentPage, CommentPolicy, CommentUpdate,
    LikeStatus, NewComment, NewSession, NewSubject, NewUser, Requester, Role, SubjectId,
    SubjectRef, ThreadQuery, Time, UserId, Uuid, TOMBSTONE,
};
use sqlx::Connection;

use crate::Error;

const COMMENT_FIELDS: &str = "
    id, parent_id, subject_kind, subject_id, author_id, content,
    like_count, is_approved, is_deleted, depth, created_at, updated_at
";

#[derive(sqlx::FromRow)]
struct CommentRow {
    id: Uuid,
    parent_id: Option<Uuid>,
    subject_kind: String,
    subject_id: Uuid,
    author_id: Uuid,
    content: String,
    like_count: i64,
    is_approved: bool,
    is_deleted: bool,
    depth: i32,
    created_at: Time,
    updated_at: Option<Time>,
}

impl TryFrom<CommentRow> for Comment {
    type Error = anyhow::Error;

    fn try_from(r: CommentRow) -> anyhow::Result<Comment> {
        Ok(Comment {
            id: CommentId(r.id),
            parent_id: r.parent_id.map(CommentId),
            subject: SubjectRef {
                kind: r
                    .subject_kind
                    .parse()
                    .with_context(|| format!("parsing subject kind of comment {}", r.id))?,
                id: SubjectId(r.subject_id),
            },
            author_id: UserId(r.author_id),
            content: r.content,
            like_count: r.like_count,
            is_approved: r.is_approved,
            is_deleted: r.is_deleted,
            depth: r.depth,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

pub async fn create_user(conn: &mut sqlx::PgConnection, user: NewUser) -> Result<(), Error> {
    let mut t = conn.begin().await.context("starting transaction")?;

    let name_taken = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM users WHERE name = $1)",
    )
    .bind(&user.name)
    .fetch_one(&mut *t)
    .await
    .with_context(|| format!("checking whether user name {:?} is taken", user.name))?;
    if name_taken {
        return Err(Error::name_already_used(user.name));
    }

    let res = sqlx::query(
        "INSERT INTO users (id, name, password_hash, role) VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING",
    )
    .bind(user.id.0)
    .bind(&user.name)
    .bind(&user.initial_password_hash)
    .bind(user.role.as_str())
    .execute(&mut *t)
    .await
    .with_context(|| format!("inserting user {:?}", user.id))?;
    if res.rows_affected() != 1 {
        // a concurrent insert may have won the race on either unique column
        let name_taken = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM users WHERE name = $1)",
        )
        .bind(&user.name)
        .fetch_one(&mut *t)
        .await
        .with_context(|| format!("checking which of {:?} conflicted", user.id))?;
        if name_taken {
            return Err(Error::name_already_used(user.name));
        }
        return Err(Error::uuid_already_used(user.id.0));
    }

    t.commit().await.context("committing transaction")?;
    tracing::debug!(user = ?user.id, name = %user.name, role = %user.role, "created user");
    Ok(())
}

pub async fn create_subject(
    conn: &mut sqlx::PgConnection,
    subject: NewSubject,
) -> Result<(), Error> {
    sqlx::query(
        "INSERT INTO subjects (kind, id, title) VALUES ($1, $2, $3)
            ON CONFLICT (kind, id) DO UPDATE SET title = EXCLUDED.title",
    )
    .bind(subject.subject.kind.as_str())
    .bind(subject.subject.id.0)
    .bind(&subject.title)
    .execute(conn)
    .await
    .with_context(|| format!("registering subject {:?}", subject.subject))?;
    Ok(())
}

pub async fn login_user(
    conn: &mut sqlx::PgConnection,
    session: &NewSession,
) -> anyhow::Result<Option<AuthToken>> {
    let user = sqlx::query_as::<_, (Uuid, String)>(
        "SELECT id, password_hash FROM users WHERE name = $1",
    )
    .bind(&session.user)
    .fetch_optional(&mut *conn)
    .await
    .with_context(|| format!("fetching password hash for {:?}", session.user))?;
    let (user, hash) = match user {
        Some(u) => u,
        None => return Ok(None),
    };

    // tests store plain passwords, to avoid paying for bcrypt
    #[cfg(test)]
    let password_ok = session.password == hash;
    #[cfg(not(test))]
    let password_ok = bcrypt::verify(&session.password, &hash).unwrap_or(false);
    if !password_ok {
        return Ok(None);
    }

    let token = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query("INSERT INTO sessions VALUES ($1, $2, $3, $4, $4)")
        .bind(token)
        .bind(user)
        .bind(&session.device)
        .bind(now)
        .execute(conn)
        .await
        .with_context(|| format!("inserting session for {:?}", user))?;
    Ok(Some(AuthToken(token)))
}

pub async fn logout_user(conn: &mut sqlx::PgConnection, token: &AuthToken) -> anyhow::Result<bool> {
    let res = sqlx::query("DELETE FROM sessions WHERE id = $1")
        .bind(token.0)
        .execute(conn)
        .await
        .with_context(|| format!("logging out {:?}", token))?;
    Ok(res.rows_affected() == 1)
}

pub async fn recover_session(
    conn: &mut sqlx::PgConnection,
    token: AuthToken,
) -> Result<Requester, Error> {
    let row = sqlx::query_as::<_, (Uuid, String)>(
        "
            UPDATE sessions
                SET last_active = $2
                FROM users
                WHERE sessions.id = $1
                AND users.id = sessions.user_id
            RETURNING users.id, users.role
        ",
    )
    .bind(token.0)
    .bind(Utc::now())
    .fetch_optional(conn)
    .await
    .context("recovering session")?;
    match row {
        None => Err(Error::unauthenticated()),
        Some((user, role)) => Ok(Requester {
            user: UserId(user),
            role: role
                .parse::<Role>()
                .with_context(|| format!("parsing role of user {:?}", user))?,
        }),
    }
}

async fn subject_exists(
    conn: &mut sqlx::PgConnection,
    subject: &SubjectRef,
) -> anyhow::Result<bool> {
    sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM subjects WHERE kind = $1 AND id = $2)")
        .bind(subject.kind.as_str())
        .bind(subject.id.0)
        .fetch_one(conn)
        .await
        .with_context(|| format!("checking existence of subject {:?}", subject))
}

/// `lock` takes a row lock on the comment until the end of the current transaction
async fn fetch_comment(
    conn: &mut sqlx::PgConnection,
    id: CommentId,
    lock: bool,
) -> anyhow::Result<Option<Comment>> {
    let query = format!(
        "SELECT {COMMENT_FIELDS} FROM comments WHERE id = $1{}",
        if lock { " FOR UPDATE" } else { "" }
    );
    sqlx::query_as::<_, CommentRow>(&query)
        .bind(id.0)
        .fetch_optional(conn)
        .await
        .with_context(|| format!("fetching comment {:?}", id))?
        .map(Comment::try_from)
        .transpose()
}

pub async fn get_comment(
    conn: &mut sqlx::PgConnection,
    requester: Option<&Requester>,
    id: CommentId,
) -> Result<Comment, Error> {
    let comment = fetch_comment(conn, id, false)
        .await?
        .ok_or(Error::comment_not_found(id))?;
    comment.check_read(requester)?;
    Ok(comment)
}

pub async fn create_comment(
    conn: &mut sqlx::PgConnection,
    policy: &CommentPolicy,
    author: &Requester,
    new: NewComment,
) -> Result<Comment, Error> {
    let content = policy.validate_content(&new.content)?;

    let mut t = conn.begin().await.context("starting transaction")?;
    if !subject_exists(&mut *t, &new.subject).await? {
        return Err(Error::subject_not_found(new.subject));
    }
    let id_taken = sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM comments WHERE id = $1)")
        .bind(new.id.0)
        .fetch_one(&mut *t)
        .await
        .with_context(|| format!("checking whether comment id {:?} is taken", new.id))?;
    if id_taken {
        return Err(Error::uuid_already_used(new.id.0));
    }
    let parent = match new.parent_id {
        // locked so that the parent cannot be tombstoned concurrently
        Some(p) => fetch_comment(&mut *t, p, true).await?,
        None => None,
    };
    let depth = new.reply_depth(parent.as_ref(), author, policy)?;

    let comment = new.into_comment(author, content, depth, policy, Utc::now());
    let res = sqlx::query(
        "INSERT INTO comments (
            id, parent_id, subject_kind, subject_id, author_id, content,
            like_count, is_approved, is_deleted, depth, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT DO NOTHING",
    )
    .bind(comment.id.0)
    .bind(comment.parent_id.map(|p| p.0))
    .bind(comment.subject.kind.as_str())
    .bind(comment.subject.id.0)
    .bind(comment.author_id.0)
    .bind(&comment.content)
    .bind(comment.like_count)
    .bind(comment.is_approved)
    .bind(comment.is_deleted)
    .bind(comment.depth)
    .bind(comment.created_at)
    .bind(comment.updated_at)
    .execute(&mut *t)
    .await
    .with_context(|| format!("inserting comment {:?}", comment.id))?;
    if res.rows_affected() != 1 {
        // lost a race against a concurrent creation with the same id
        return Err(Error::uuid_already_used(comment.id.0));
    }
    t.commit().await.context("committing transaction")?;

    tracing::debug!(
        comment = ?comment.id,
        parent = ?comment.parent_id,
        subject = ?comment.subject,
        author = ?comment.author_id,
        approved = comment.is_approved,
        "created comment"
    );
    // Reload, so that the returned timestamps have the stored precision
    fetch_comment(conn, comment.id, false)
        .await?
        .ok_or_else(|| anyhow::anyhow!("comment {:?} disappeared after insertion", comment.id))
        .map_err(Error::from)
}

pub async fn update_comment(
    conn: &mut sqlx::PgConnection,
    policy: &CommentPolicy,
    requester: &Requester,
    id: CommentId,
    update: CommentUpdate,
) -> Result<Comment, Error> {
    let mut t = conn.begin().await.context("starting transaction")?;
    let comment = fetch_comment(&mut *t, id, true)
        .await?
        .ok_or(Error::comment_not_found(id))?;
    comment.check_edit(requester)?;
    let content = policy.validate_content(&update.content)?;

    let updated = sqlx::query_as::<_, CommentRow>(&format!(
        "UPDATE comments SET content = $2, updated_at = $3 WHERE id = $1 RETURNING {COMMENT_FIELDS}"
    ))
    .bind(id.0)
    .bind(&content)
    .bind(Utc::now())
    .fetch_one(&mut *t)
    .await
    .with_context(|| format!("updating comment {:?}", id))?;
    t.commit().await.context("committing transaction")?;

    tracing::debug!(comment = ?id, editor = ?requester.user, "updated comment");
    Ok(Comment::try_from(updated)?)
}

pub async fn delete_comment(
    conn: &mut sqlx::PgConnection,
    requester: &Requester,
    id: CommentId,
) -> Result<(), Error> {
    let mut t = conn.begin().await.context("starting transaction")?;
    let comment = fetch_comment(&mut *t, id, true)
        .await?
        .ok_or(Error::comment_not_found(id))?;
    comment.check_delete(requester)?;
    if comment.is_deleted {
        return Ok(());
    }

    sqlx::query(
        "UPDATE comments SET content = $2, is_deleted = true, updated_at = $3 WHERE id = $1",
    )
    .bind(id.0)
    .bind(TOMBSTONE)
    .bind(Utc::now())
    .execute(&mut *t)
    .await
    .with_context(|| format!("tombstoning comment {:?}", id))?;
    t.commit().await.context("committing transaction")?;

    tracing::debug!(comment = ?id, by = ?requester.user, "deleted comment");
    Ok(())
}

/// Likes or unlikes the comment for the requester
///
/// The comment row lock serializes concurrent toggles, and the new count is recomputed
/// from the likes table within the same transaction.
pub async fn toggle_like(
    conn: &mut sqlx::PgConnection,
    requester: &Requester,
    id: CommentId,
) -> Result<LikeStatus, Error> {
    let mut t = conn.begin().await.context("starting transaction")?;
    let comment = fetch_comment(&mut *t, id, true)
        .await?
        .ok_or(Error::comment_not_found(id))?;
    comment.check_like(requester)?;

    let unliked = sqlx::query("DELETE FROM comment_likes WHERE comment_id = $1 AND user_id = $2")
        .bind(id.0)
        .bind(requester.user.0)
        .execute(&mut *t)
        .await
        .with_context(|| format!("removing like of {:?} on {:?}", requester.user, id))?
        .rows_affected();
    let liked = unliked == 0;
    if liked {
        sqlx::query("INSERT INTO comment_likes VALUES ($1, $2, $3)")
            .bind(id.0)
            .bind(requester.user.0)
            .bind(Utc::now())
            .execute(&mut *t)
            .await
            .with_context(|| format!("adding like of {:?} on {:?}", requester.user, id))?;
    }

    let new_count = sqlx::query_scalar::<_, i64>(
        "
            UPDATE comments
                SET like_count = (SELECT COUNT(*) FROM comment_likes WHERE comment_id = $1)
                WHERE id = $1
            RETURNING like_count
        ",
    )
    .bind(id.0)
    .fetch_one(&mut *t)
    .await
    .with_context(|| format!("refreshing like count of {:?}", id))?;
    t.commit().await.context("committing transaction")?;

    tracing::debug!(comment = ?id, user = ?requester.user, liked, new_count, "toggled like");
    Ok(LikeStatus { liked, new_count })
}

pub async fn set_approval(
    conn: &mut sqlx::PgConnection,
    requester: &Requester,
    id: CommentId,
    approved: bool,
) -> Result<Comment, Error> {
    moderation::check_moderator(requester)?;
    let updated = sqlx::query_as::<_, CommentRow>(&format!(
        "UPDATE comments SET is_approved = $2 WHERE id = $1 RETURNING {COMMENT_FIELDS}"
    ))
    .bind(id.0)
    .bind(approved)
    .fetch_optional(conn)
    .await
    .with_context(|| format!("setting approval of comment {:?}", id))?
    .ok_or(Error::comment_not_found(id))?;

    tracing::debug!(comment = ?id, moderator = ?requester.user, approved, "set approval");
    Ok(Comment::try_from(updated)?)
}

async fn fetch_subject_comments(
    conn: &mut sqlx::PgConnection,
    subject: &SubjectRef,
) -> anyhow::Result<Vec<Comment>> {
    sqlx::query_as::<_, CommentRow>(&format!(
        "SELECT {COMMENT_FIELDS} FROM comments WHERE subject_kind = $1 AND subject_id = $2"
    ))
    .bind(subject.kind.as_str())
    .bind(subject.id.0)
    .fetch(conn)
    .map_err(anyhow::Error::from)
    .and_then(|r| async move { Comment::try_from(r) })
    .try_collect::<Vec<Comment>>()
    .await
    .with_context(|| format!("fetching comments of {:?}", subject))
}

async fn fetch_liked_on_subject(
    conn: &mut sqlx::PgConnection,
    user: UserId,
    subject: &SubjectRef,
) -> anyhow::Result<HashSet<CommentId>> {
    sqlx::query_scalar::<_, Uuid>(
        "
            SELECT l.comment_id
                FROM comment_likes l
            INNER JOIN comments c
                ON c.id = l.comment_id
            WHERE l.user_id = $1
            AND c.subject_kind = $2
            AND c.subject_id = $3
        ",
    )
    .bind(user.0)
    .bind(subject.kind.as_str())
    .bind(subject.id.0)
    .fetch(conn)
    .map_ok(CommentId)
    .try_collect::<HashSet<CommentId>>()
    .await
    .with_context(|| format!("fetching likes of {:?} on {:?}", user, subject))
}

pub async fn list_thread(
    conn: &mut sqlx::PgConnection,
    policy: &CommentPolicy,
    requester: Option<&Requester>,
    subject: SubjectRef,
    query: &ThreadQuery,
) -> Result<CommentPage, Error> {
    if !subject_exists(&mut *conn, &subject).await? {
        return Err(Error::subject_not_found(subject));
    }
    let comments = fetch_subject_comments(&mut *conn, &subject).await?;
    let liked = match requester {
        Some(r) => fetch_liked_on_subject(&mut *conn, r.user, &subject).await?,
        None => HashSet::new(),
    };
    let visible = moderation::filter_visible(comments, requester);
    Ok(thread::build(visible, &liked, query, policy))
}

pub async fn list_pending(
    conn: &mut sqlx::PgConnection,
    requester: &Requester,
) -> Result<Vec<Comment>, Error> {
    moderation::check_moderator(requester)?;
    let comments = sqlx::query_as::<_, CommentRow>(&format!(
        "SELECT {COMMENT_FIELDS} FROM comments WHERE NOT is_approved AND NOT is_deleted"
    ))
    .fetch(conn)
    .map_err(anyhow::Error::from)
    .and_then(|r| async move { Comment::try_from(r) })
    .try_collect::<Vec<Comment>>()
    .await
    .context("fetching pending comments")?;
    Ok(moderation::pending(comments))
}

/// Comments whose materialized like count disagrees with the likes table
#[cfg(test)]
pub async fn like_count_drift(conn: &mut sqlx::PgConnection) -> anyhow::Result<Vec<CommentId>> {
    sqlx::query_scalar::<_, Uuid>(
        "
            SELECT c.id
                FROM comments c
            WHERE c.like_count != (SELECT COUNT(*) FROM comment_likes l WHERE l.comment_id = c.id)
        ",
    )
    .fetch(conn)
    .map_ok(CommentId)
    .try_collect()
    .await
    .context("checking like counts")
}
