use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use launchpad_api::{AuthToken, CommentPolicy, Uuid};
use std::net::SocketAddr;

mod db;
mod error;
mod extractors;
mod fuzz;
mod handlers;

use error::Error;
use extractors::{AppState, PgPool};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[derive(structopt::StructOpt)]
struct Opt {
    /// Postgres connection string
    #[structopt(long, env = "DATABASE_URL")]
    database_url: String,

    #[structopt(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Bearer token allowing access to the admin routes, which are disabled if unset
    #[structopt(long, env = "ADMIN_TOKEN")]
    admin_token: Option<Uuid>,

    /// Hold new comments until a moderator approves them
    #[structopt(
        long,
        env = "PRE_MODERATION",
        default_value = "false",
        parse(try_from_str)
    )]
    pre_moderation: bool,

    /// Deepest comment level that still offers a reply
    #[structopt(long, env = "MAX_REPLY_DEPTH", default_value = "3")]
    max_reply_depth: i32,

    /// Reject replies deeper than --max-reply-depth
    #[structopt(
        long,
        env = "ENFORCE_REPLY_DEPTH",
        default_value = "false",
        parse(try_from_str)
    )]
    enforce_reply_depth: bool,

    #[structopt(long, env = "MAX_CONTENT_LEN", default_value = "10000")]
    max_content_len: usize,
}

impl Opt {
    fn policy(&self) -> CommentPolicy {
        CommentPolicy {
            pre_moderation: self.pre_moderation,
            max_reply_depth: self.max_reply_depth,
            enforce_reply_depth: self.enforce_reply_depth,
            max_content_len: self.max_content_len,
        }
    }
}

pub async fn create_sqlx_pool(db_url: &str) -> anyhow::Result<sqlx::PgPool> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(db_url)
        .await
        .with_context(|| format!("Error opening database {:?}", db_url))
}

pub async fn app(db: PgPool, admin_token: Option<AuthToken>, policy: CommentPolicy) -> Router {
    use handlers::*;
    Router::new()
        .route("/api/admin/create-user", post(admin_create_user))
        .route("/api/admin/create-subject", post(admin_create_subject))
        .route("/api/auth", post(auth))
        .route("/api/unauth", post(unauth))
        .route("/api/whoami", get(whoami))
        .route("/api/subjects/:kind/:id/comments", get(list_comments))
        .route("/api/comments", post(create_comment))
        .route(
            "/api/comments/:id",
            get(get_comment)
                .patch(update_comment)
                .delete(delete_comment),
        )
        .route("/api/comments/:id/like", post(toggle_like))
        .route("/api/comments/:id/approval", post(set_approval))
        .route("/api/moderation/pending", get(list_pending))
        .with_state(AppState {
            db,
            admin_token,
            policy,
        })
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let opt = <Opt as structopt::StructOpt>::from_args();
    let policy = opt.policy();

    let db = create_sqlx_pool(&opt.database_url).await?;
    MIGRATOR
        .run(&db)
        .await
        .context("running pending migrations")?;

    if opt.admin_token.is_none() {
        tracing::warn!("no admin token configured, admin routes will reject every request");
    }
    tracing::info!(?policy, "comment policy");

    let app = app(PgPool::new(db), opt.admin_token.map(AuthToken), policy).await;

    tracing::info!("listening on {}", opt.listen);
    axum::Server::bind(&opt.listen)
        .serve(app.into_make_service())
        .await
        .context("serving axum webserver")
}
