use std::ops::{Deref, DerefMut};

use anyhow::Context;
use axum::{
    async_trait,
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        FromRequest, FromRequestParts,
    },
    http::{self, request, Request},
};
use launchpad_api::{AuthToken, CommentPolicy, Requester, Uuid};

use crate::{db, Error};

#[derive(Clone, axum::extract::FromRef)]
pub struct AppState {
    pub db: PgPool,
    pub admin_token: Option<AuthToken>,
    pub policy: CommentPolicy,
}

#[derive(Clone)]
pub struct PgPool(sqlx::PgPool);

impl PgPool {
    pub fn new(pool: sqlx::PgPool) -> PgPool {
        PgPool(pool)
    }

    pub async fn acquire(&self) -> Result<PgConn, Error> {
        Ok(PgConn(
            self.0.acquire().await.context("acquiring db connection")?,
        ))
    }

    pub fn num_idle(&self) -> usize {
        self.0.num_idle()
    }
}

pub struct PgConn(sqlx::pool::PoolConnection<sqlx::Postgres>);

#[async_trait]
impl FromRequestParts<AppState> for PgConn {
    type Rejection = Error;

    async fn from_request_parts(
        _req: &mut request::Parts,
        state: &AppState,
    ) -> Result<PgConn, Error> {
        state.db.acquire().await
    }
}

impl Deref for PgConn {
    type Target = sqlx::PgConnection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PgConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// The bearer token of the request, not yet checked against the sessions
pub struct PreAuth(pub AuthToken);

impl PreAuth {
    fn parse(auth: &http::HeaderValue) -> Result<PreAuth, Error> {
        let auth = auth.to_str().map_err(|_| Error::unauthenticated())?;
        let mut auth = auth.split(' ');
        if !auth
            .next()
            .ok_or(Error::unauthenticated())?
            .eq_ignore_ascii_case("bearer")
        {
            return Err(Error::unauthenticated());
        }
        let token = auth.next().ok_or(Error::unauthenticated())?;
        if !auth.next().is_none() {
            return Err(Error::unauthenticated());
        }
        let token = Uuid::try_from(token).map_err(|_| Error::unauthenticated())?;
        Ok(PreAuth(AuthToken(token)))
    }
}

#[async_trait]
impl<S: Sync> FromRequestParts<S> for PreAuth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, _state: &S) -> Result<PreAuth, Error> {
        match req.headers.get(http::header::AUTHORIZATION) {
            None => Err(Error::unauthenticated()),
            Some(auth) => PreAuth::parse(auth),
        }
    }
}

pub struct Auth(pub Requester);

#[async_trait]
impl FromRequestParts<AppState> for Auth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, state: &AppState) -> Result<Auth, Error> {
        let token = PreAuth::from_request_parts(req, state).await?.0;
        let mut conn = PgConn::from_request_parts(req, state).await?;
        Ok(Auth(db::recover_session(&mut *conn, token).await?))
    }
}

/// Anonymous requests are allowed, but a provided token must be valid
pub struct MaybeAuth(pub Option<Requester>);

#[async_trait]
impl FromRequestParts<AppState> for MaybeAuth {
    type Rejection = Error;

    async fn from_request_parts(
        req: &mut request::Parts,
        state: &AppState,
    ) -> Result<MaybeAuth, Error> {
        if !req.headers.contains_key(http::header::AUTHORIZATION) {
            return Ok(MaybeAuth(None));
        }
        let Auth(requester) = Auth::from_request_parts(req, state).await?;
        Ok(MaybeAuth(Some(requester)))
    }
}

pub struct AdminAuth;

#[async_trait]
impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = Error;

    async fn from_request_parts(
        req: &mut request::Parts,
        state: &AppState,
    ) -> Result<AdminAuth, Error> {
        let token = PreAuth::from_request_parts(req, state).await?.0;
        if Some(token) == state.admin_token {
            Ok(AdminAuth)
        } else {
            Err(Error::permission_denied())
        }
    }
}

/// Like `axum::Json`, but rejections are reported as API errors
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, B, T> FromRequest<S, B> for JsonBody<T>
where
    axum::Json<T>: FromRequest<S, B, Rejection = JsonRejection>,
    S: Send + Sync,
    B: Send + 'static,
{
    type Rejection = Error;

    async fn from_request(req: Request<B>, state: &S) -> Result<JsonBody<T>, Error> {
        let axum::Json(v) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(Error::malformed)?;
        Ok(JsonBody(v))
    }
}

pub struct QueryParams<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for QueryParams<T>
where
    axum::extract::Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(
        req: &mut request::Parts,
        state: &S,
    ) -> Result<QueryParams<T>, Error> {
        let axum::extract::Query(v) = axum::extract::Query::<T>::from_request_parts(req, state)
            .await
            .map_err(Error::malformed)?;
        Ok(QueryParams(v))
    }
}

pub struct PathParams<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for PathParams<T>
where
    axum::extract::Path<T>: FromRequestParts<S, Rejection = PathRejection>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(
        req: &mut request::Parts,
        state: &S,
    ) -> Result<PathParams<T>, Error> {
        let axum::extract::Path(v) = axum::extract::Path::<T>::from_request_parts(req, state)
            .await
            .map_err(Error::malformed)?;
        Ok(PathParams(v))
    }
}
