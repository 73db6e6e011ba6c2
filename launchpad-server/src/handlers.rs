use anyhow::Context;
use axum::{extract::State, Json};
use launchpad_api::{
    AuthToken, Comment, CommentId, CommentPage, CommentPolicy, CommentUpdate, LikeStatus,
    NewComment, NewSession, NewSubject, NewUser, Requester, SetApproval, SubjectId, SubjectRef,
    SubjectType, ThreadQuery, Uuid,
};

use crate::{db, extractors::*, Error};

pub async fn admin_create_user(
    AdminAuth: AdminAuth,
    mut conn: PgConn,
    JsonBody(data): JsonBody<NewUser>,
) -> Result<(), Error> {
    data.validate()?;
    db::create_user(&mut *conn, data).await
}

pub async fn admin_create_subject(
    AdminAuth: AdminAuth,
    mut conn: PgConn,
    JsonBody(data): JsonBody<NewSubject>,
) -> Result<(), Error> {
    data.validate()?;
    db::create_subject(&mut *conn, data).await
}

pub async fn auth(
    mut conn: PgConn,
    JsonBody(data): JsonBody<NewSession>,
) -> Result<Json<AuthToken>, Error> {
    data.validate()?;
    Ok(Json(
        db::login_user(&mut *conn, &data)
            .await
            .context("logging user in")?
            .ok_or(Error::unauthenticated())?,
    ))
}

pub async fn unauth(user: PreAuth, mut conn: PgConn) -> Result<(), Error> {
    match db::logout_user(&mut *conn, &user.0).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::unauthenticated()),
        Err(e) => Err(Error::Anyhow(e)),
    }
}

pub async fn whoami(Auth(requester): Auth) -> Json<Requester> {
    Json(requester)
}

fn parse_subject(kind: &str, id: Uuid) -> Result<SubjectRef, Error> {
    Ok(SubjectRef {
        kind: kind.parse::<SubjectType>().map_err(Error::malformed)?,
        id: SubjectId(id),
    })
}

pub async fn list_comments(
    MaybeAuth(requester): MaybeAuth,
    State(policy): State<CommentPolicy>,
    mut conn: PgConn,
    PathParams((kind, id)): PathParams<(String, Uuid)>,
    QueryParams(query): QueryParams<ThreadQuery>,
) -> Result<Json<CommentPage>, Error> {
    let subject = parse_subject(&kind, id)?;
    Ok(Json(
        db::list_thread(&mut *conn, &policy, requester.as_ref(), subject, &query).await?,
    ))
}

pub async fn create_comment(
    Auth(requester): Auth,
    State(policy): State<CommentPolicy>,
    mut conn: PgConn,
    JsonBody(data): JsonBody<NewComment>,
) -> Result<Json<Comment>, Error> {
    Ok(Json(
        db::create_comment(&mut *conn, &policy, &requester, data).await?,
    ))
}

pub async fn get_comment(
    MaybeAuth(requester): MaybeAuth,
    mut conn: PgConn,
    PathParams(id): PathParams<Uuid>,
) -> Result<Json<Comment>, Error> {
    Ok(Json(
        db::get_comment(&mut *conn, requester.as_ref(), CommentId(id)).await?,
    ))
}

pub async fn update_comment(
    Auth(requester): Auth,
    State(policy): State<CommentPolicy>,
    mut conn: PgConn,
    PathParams(id): PathParams<Uuid>,
    JsonBody(data): JsonBody<CommentUpdate>,
) -> Result<Json<Comment>, Error> {
    Ok(Json(
        db::update_comment(&mut *conn, &policy, &requester, CommentId(id), data).await?,
    ))
}

pub async fn delete_comment(
    Auth(requester): Auth,
    mut conn: PgConn,
    PathParams(id): PathParams<Uuid>,
) -> Result<(), Error> {
    db::delete_comment(&mut *conn, &requester, CommentId(id)).await
}

pub async fn toggle_like(
    Auth(requester): Auth,
    mut conn: PgConn,
    PathParams(id): PathParams<Uuid>,
) -> Result<Json<LikeStatus>, Error> {
    Ok(Json(
        db::toggle_like(&mut *conn, &requester, CommentId(id)).await?,
    ))
}

pub async fn set_approval(
    Auth(requester): Auth,
    mut conn: PgConn,
    PathParams(id): PathParams<Uuid>,
    JsonBody(data): JsonBody<SetApproval>,
) -> Result<Json<Comment>, Error> {
    Ok(Json(
        db::set_approval(&mut *conn, &requester, CommentId(id), data.approved).await?,
    ))
}

pub async fn list_pending(
    Auth(requester): Auth,
    mut conn: PgConn,
) -> Result<Json<Vec<Comment>>, Error> {
    Ok(Json(db::list_pending(&mut *conn, &requester).await?))
}
