#![cfg(test)]

use async_recursion::async_recursion;
use bolero::generator::TypeGenerator;
use axum::{
    extract::FromRequestParts,
    http::{self, request},
};
use chrono::TimeZone;
use launchpad_api::{
    Comment, CommentId, CommentNode, CommentPage, CommentUpdate, Error as ApiError, LikeStatus,
    NewComment, NewSession, NewSubject, NewUser, Requester, Role, SetApproval, Sort, SubjectRef,
    ThreadQuery, Time, UserId,
};
use launchpad_mock_server::MockServer;
use std::{cmp, fmt::Debug, ops::RangeTo, panic::AssertUnwindSafe, path::Path};
use tower::{Service, ServiceExt};

use crate::{extractors::*, *};

macro_rules! do_tokio_test {
    ( $name:ident, $typ:ty, $fn:expr ) => {
        #[test]
        fn $name() {
            let runtime = AssertUnwindSafe(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed initializing tokio runtime"),
            );
            bolero::check!()
                .with_type::<$typ>()
                .cloned()
                .for_each(move |v| {
                    let () = runtime.block_on($fn(v));
                })
        }
    };
}

/// Picks the most recent postgres found in path, if any
fn build_pg_cluster(data: &Path) -> Option<postgresfixture::cluster::Cluster> {
    let runtime = postgresfixture::runtime::Runtime::find_on_path()
        .into_iter()
        .filter_map(|r| r.version().ok().map(|v| (v, r)))
        .max_by(|(v1, _), (v2, _)| v1.cmp(v2))
        .map(|(_, r)| r)?;
    Some(postgresfixture::cluster::Cluster::new(data, runtime))
}

macro_rules! do_sqlx_test {
    ( $name:ident, $gen:expr, $fn:expr ) => {
        #[test]
        fn $name() {
            if std::env::var("RUST_LOG").is_ok() {
                tracing_subscriber::fmt::init();
            }
            let lockfile = tempfile::tempfile().expect("creating tempfile");
            let datadir = tempfile::tempdir().expect("creating tempdir");
            let datadir_path: &Path = datadir.as_ref();
            let cluster = match build_pg_cluster(datadir_path) {
                Some(cluster) => cluster,
                None => {
                    eprintln!("postgresql is not installed in path, skipping {}", stringify!($name));
                    return;
                }
            };
            let datadir_path: &str = datadir_path.to_str().expect("tempdir is not valid utf8");
            postgresfixture::coordinate::run_and_destroy(&cluster, lockfile.into(), || {
                cluster.createdb("test_db").expect("creating test_db database");
                let runtime = AssertUnwindSafe(
                    tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed initializing tokio runtime"),
                );
                // create test db
                let pool = AssertUnwindSafe(runtime.block_on(async move {
                    let pool = create_sqlx_pool(&format!("postgresql://?host={}&dbname=test_db", datadir_path)).await.expect("creating sqlx pool");
                    MIGRATOR
                        .run(&mut *pool.acquire().await.expect("getting migrator connection"))
                        .await
                        .expect("failed applying migrations");
                    PgPool::new(pool)
                }));
                bolero::check!()
                    .with_generator($gen)
                    .cloned()
                    .for_each(move |v| {
                        let pool = pool.clone();
                        // run the test
                        let idle_before = pool.num_idle();
                        let v_str = format!("{v:?}");
                        let idle_after_res: Result<usize, _> = {
                            let pool = pool.clone();
                            std::panic::catch_unwind(AssertUnwindSafe(|| {
                                runtime.block_on(async move {
                                    let () = $fn(pool.clone(), v).await;
                                    let mut idle_after = pool.num_idle();
                                    let wait_release_since = std::time::Instant::now();
                                    while idle_after < idle_before
                                        && wait_release_since.elapsed()
                                            <= std::time::Duration::from_secs(1)
                                    {
                                        tokio::task::yield_now().await;
                                        idle_after = pool.num_idle();
                                    }
                                    idle_after
                                })
                            }))
                        };
                        runtime.block_on(async move {
                            // cleanup
                            let mut conn =
                                pool.acquire().await.expect("getting db cleanup connection");
                            sqlx::query(include_str!("../reset-test-db.sql"))
                                .execute(&mut *conn)
                                .await
                                .expect("failed cleaning up database");
                        });
                        // resume the panics
                        match idle_after_res {
                            Err(e) => std::panic::resume_unwind(e),
                            Ok(idle_after) => assert!(
                                idle_after >= idle_before,
                                "test {} held onto pool after exiting test: before there were {idle_before} connections, and after there were {idle_after} with value {v_str}",
                                stringify!($name)
                            ),
                        }
                    });
            })
            .expect("coordinating spinup and shutdown of the pg cluster");
        }
    };
}

do_tokio_test!(fuzz_preauth_extractor, String, |token| async move {
    if let Ok(req) = http::Request::builder()
        .method(http::Method::GET)
        .uri("/")
        .header(http::header::AUTHORIZATION, token)
        .body(())
    {
        let mut req = req.into_parts().0;
        let res = PreAuth::from_request_parts(&mut req, &()).await;
        match res {
            Ok(_) => (),
            Err(Error::Api(ApiError::Unauthenticated)) => (),
            Err(e) => panic!("got unexpected error: {e}"),
        }
    }
});

const CONTENTS: &[&str] = &[
    "T-minus 10 and counting",
    "  Booster caught by the tower!  ",
    "Scrubbed again",
    "",
    "   ",
    "nul \0 byte",
    "Max-Q in 3... 2... 1...",
    "This is far longer than what the fuzzing policy lets through",
];

fn fuzz_policy(pre_moderation: bool, enforce_reply_depth: bool) -> CommentPolicy {
    CommentPolicy {
        pre_moderation,
        max_reply_depth: 2,
        enforce_reply_depth,
        max_content_len: 32,
    }
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
struct FuzzTest {
    pre_moderation: bool,
    enforce_reply_depth: bool,
    #[generator(bolero::generator::gen_with::<Vec<FuzzOp>>().len(1..100usize))]
    ops: Vec<FuzzOp>,
}

// ids are resized into the currently existing objects, see `resize_int`
#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum FuzzOp {
    CreateUser {
        moderator: bool,
    },
    CreateSubject {
        launch: bool,
    },
    Auth {
        uid: usize,
        wrong_password: bool,
    },
    Unauth {
        sid: usize,
    },
    Whoami {
        sid: usize,
    },
    CreateComment {
        sid: usize,
        subject: usize,
        parent: Option<usize>,
        content: usize,
        reuse_id: Option<usize>,
    },
    UpdateComment {
        sid: usize,
        comment: usize,
        content: usize,
    },
    DeleteComment {
        sid: usize,
        comment: usize,
    },
    ToggleLike {
        sid: usize,
        comment: usize,
    },
    SetApproval {
        sid: usize,
        comment: usize,
        approved: bool,
    },
    GetComment {
        sid: Option<usize>,
        comment: usize,
    },
    ListComments {
        sid: Option<usize>,
        subject: usize,
        sort: u8,
        page: u8,
        per_page: u8,
    },
    ListPending {
        sid: usize,
    },
}

async fn call<Req, Resp>(
    app: &mut Router,
    req: request::Request<axum::body::Body>,
    req_body: &Req,
) -> Result<Resp, ApiError>
where
    Req: Debug,
    Resp: 'static + for<'de> serde::Deserialize<'de>,
{
    app.ready().await.expect("waiting for app to be ready");
    let resp = app.call(req).await.expect("running request");
    let status = resp.status();
    let body = hyper::body::to_bytes(resp.into_body())
        .await
        .expect("recovering resp bytes");
    if status == http::StatusCode::OK {
        if std::any::TypeId::of::<Resp>() == std::any::TypeId::of::<()>() {
            // the server returns an empty body in this situation, which serde_json does not parse
            return Ok(serde_json::from_slice(b"null").unwrap());
        } else {
            return Ok(serde_json::from_slice(&body).unwrap_or_else(|err| {
                panic!(
                    r#"
                        Failed parsing resp body!

                        The error is the following:
                        ---
                        {err}
                        ---

                        Response body is:
                        ---
                        {body:?}
                        ---

                        Request was:
                        ---
                        {req_body:?}
                        ---
                    "#
                )
            }));
        }
    }
    Err(ApiError::parse(&body)
        .unwrap_or_else(|err| panic!("parsing error response body {err}, body is {body:?}")))
}

async fn run_on_app<Req, Resp>(
    app: &mut Router,
    method: &str,
    uri: &str,
    token: Option<AuthToken>,
    body: &Req,
) -> Result<Resp, ApiError>
where
    Req: Debug + serde::Serialize,
    Resp: 'static + for<'de> serde::Deserialize<'de>,
{
    let req = request::Builder::new()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json");
    let req = match token {
        Some(token) => req.header(http::header::AUTHORIZATION, format!("bearer {}", token.0)),
        None => req,
    };
    let req = req
        .body(axum::body::Body::from(
            serde_json::to_vec(body).expect("serializing request body to json"),
        ))
        .expect("building request");
    call(app, req, body).await
}

fn compare<T>(name: &str, app_res: Result<T, ApiError>, mock_res: Result<T, ApiError>)
where
    T: Debug + PartialEq,
{
    assert_eq!(
        app_res, mock_res,
        "app and mock did not return the same result for {name}"
    );
}

/// Timestamps come from two different clocks, so only their presence is compared
fn erase_times(mut c: Comment) -> Comment {
    let epoch: Time = chrono::Utc.timestamp_opt(0, 0).unwrap();
    c.created_at = epoch;
    c.updated_at = c.updated_at.map(|_| epoch);
    c
}

fn erase_node_times(n: CommentNode) -> CommentNode {
    CommentNode {
        comment: erase_times(n.comment),
        replies: n.replies.into_iter().map(erase_node_times).collect(),
        ..n
    }
}

fn erase_page_times(p: CommentPage) -> CommentPage {
    CommentPage {
        comments: p.comments.into_iter().map(erase_node_times).collect(),
        ..p
    }
}

fn resize_int(fuzz_id: usize, RangeTo { end }: RangeTo<usize>) -> Option<usize> {
    if end == 0 {
        return None;
    }
    let bucket_size = cmp::max(1, usize::MAX / end); // in case we rounded to 0
    let id = fuzz_id / bucket_size;
    Some(cmp::min(id, end - 1)) // in case id was actually over end - 1 due to rounding
}

struct Session {
    app: AuthToken,
    mock: AuthToken,
}

struct ComparativeFuzzer {
    admin_token: AuthToken,
    pool: PgPool,
    app: Router,
    mock: MockServer,
    sessions: Vec<Session>,
    subjects: Vec<SubjectRef>,
    comments: Vec<CommentId>,
}

impl ComparativeFuzzer {
    async fn new(pool: PgPool, policy: CommentPolicy) -> ComparativeFuzzer {
        let admin_token = AuthToken(Uuid::new_v4());
        let app = app(pool.clone(), Some(admin_token), policy).await;
        let mock = MockServer::new(policy);
        ComparativeFuzzer {
            admin_token,
            pool,
            app,
            mock,
            sessions: Vec::new(),
            subjects: Vec::new(),
            comments: Vec::new(),
        }
    }

    /// No session at all means the request is sent anonymously
    fn tokens(&self, sid: usize) -> (Option<AuthToken>, Option<AuthToken>) {
        match resize_int(sid, ..self.sessions.len()) {
            None => (None, None),
            Some(sid) => (Some(self.sessions[sid].app), Some(self.sessions[sid].mock)),
        }
    }

    fn maybe_tokens(&self, sid: Option<usize>) -> (Option<AuthToken>, Option<AuthToken>) {
        sid.map(|sid| self.tokens(sid)).unwrap_or((None, None))
    }

    /// Unregistered subjects are exercised when none was created yet
    fn subject(&self, subject: usize) -> SubjectRef {
        match resize_int(subject, ..self.subjects.len()) {
            None => SubjectRef::article(Uuid::new_v4()),
            Some(s) => self.subjects[s],
        }
    }

    fn comment(&self, comment: usize) -> CommentId {
        match resize_int(comment, ..self.comments.len()) {
            None => CommentId(Uuid::new_v4()),
            Some(c) => self.comments[c],
        }
    }

    fn content(content: usize) -> String {
        String::from(CONTENTS[content % CONTENTS.len()])
    }

    #[async_recursion]
    async fn execute_fuzz_op(&mut self, op: FuzzOp) {
        match op {
            FuzzOp::CreateUser { moderator } => {
                let n = self.mock.test_num_users();
                // no hashing for tests
                let new_user = NewUser {
                    id: UserId(Uuid::new_v4()),
                    name: format!("user{n}"),
                    role: if moderator {
                        Role::Moderator
                    } else {
                        Role::Standard
                    },
                    initial_password_hash: format!("password{n}"),
                };
                let pass = new_user.initial_password_hash.clone();
                compare(
                    "CreateUser",
                    run_on_app(
                        &mut self.app,
                        "POST",
                        "/api/admin/create-user",
                        Some(self.admin_token),
                        &new_user,
                    )
                    .await,
                    self.mock.admin_create_user(new_user, pass),
                )
            }
            FuzzOp::CreateSubject { launch } => {
                let id = Uuid::new_v4();
                let subject = NewSubject {
                    subject: if launch {
                        SubjectRef::launch(id)
                    } else {
                        SubjectRef::article(id)
                    },
                    title: String::from("Orbital test flight"),
                };
                let app_res = run_on_app(
                    &mut self.app,
                    "POST",
                    "/api/admin/create-subject",
                    Some(self.admin_token),
                    &subject,
                )
                .await;
                let mock_res = self.mock.admin_create_subject(subject.clone());
                if app_res.is_ok() && mock_res.is_ok() {
                    self.subjects.push(subject.subject);
                }
                compare("CreateSubject", app_res, mock_res);
            }
            FuzzOp::Auth {
                uid,
                wrong_password,
            } => {
                if let Some(uid) = resize_int(uid, ..self.mock.test_num_users()) {
                    let (user, password) = self.mock.test_get_user_info(uid);
                    let session = NewSession {
                        user: String::from(user),
                        password: if wrong_password {
                            format!("not {password}")
                        } else {
                            String::from(password)
                        },
                        device: String::from("fuzzer"),
                    };
                    let app_tok =
                        run_on_app(&mut self.app, "POST", "/api/auth", None, &session).await;
                    let mock_tok = self.mock.auth(session);
                    if let (&Ok(app), &Ok(mock)) = (&app_tok, &mock_tok) {
                        self.sessions.push(Session { app, mock });
                    }
                    compare("Auth", app_tok.map(|_| ()), mock_tok.map(|_| ()));
                } else {
                    self.execute_fuzz_op(FuzzOp::CreateUser { moderator: false })
                        .await;
                    self.execute_fuzz_op(FuzzOp::Auth {
                        uid,
                        wrong_password,
                    })
                    .await;
                }
            }
            FuzzOp::Unauth { sid } => {
                if let Some(sid) = resize_int(sid, ..self.sessions.len()) {
                    let session = self.sessions.remove(sid);
                    compare(
                        "Unauth",
                        run_on_app(&mut self.app, "POST", "/api/unauth", Some(session.app), &())
                            .await,
                        self.mock.unauth(session.mock),
                    );
                    // the session must not be usable anymore
                    compare(
                        "Whoami after Unauth",
                        run_on_app::<_, Requester>(
                            &mut self.app,
                            "GET",
                            "/api/whoami",
                            Some(session.app),
                            &(),
                        )
                        .await,
                        self.mock.whoami(session.mock),
                    );
                }
            }
            FuzzOp::Whoami { sid } => {
                if let (Some(app_tok), Some(mock_tok)) = self.tokens(sid) {
                    compare(
                        "Whoami",
                        run_on_app(&mut self.app, "GET", "/api/whoami", Some(app_tok), &()).await,
                        self.mock.whoami(mock_tok),
                    );
                }
            }
            FuzzOp::CreateComment {
                sid,
                subject,
                parent,
                content,
                reuse_id,
            } => {
                let (app_tok, mock_tok) = self.tokens(sid);
                let id = match reuse_id {
                    Some(c) if !self.comments.is_empty() => self.comment(c),
                    _ => CommentId(Uuid::new_v4()),
                };
                let new = NewComment {
                    id,
                    subject: self.subject(subject),
                    parent_id: parent.map(|p| self.comment(p)),
                    content: Self::content(content),
                };
                let app_res: Result<Comment, _> =
                    run_on_app(&mut self.app, "POST", "/api/comments", app_tok, &new).await;
                let mock_res = self.mock.create_comment(mock_tok, new);
                if let (Ok(_), Ok(_)) = (&app_res, &mock_res) {
                    self.comments.push(id);
                }
                compare(
                    "CreateComment",
                    app_res.map(erase_times),
                    mock_res.map(erase_times),
                );
            }
            FuzzOp::UpdateComment {
                sid,
                comment,
                content,
            } => {
                let (app_tok, mock_tok) = self.tokens(sid);
                let id = self.comment(comment);
                let update = CommentUpdate {
                    content: Self::content(content),
                };
                compare(
                    "UpdateComment",
                    run_on_app(
                        &mut self.app,
                        "PATCH",
                        &format!("/api/comments/{}", id.0),
                        app_tok,
                        &update,
                    )
                    .await
                    .map(erase_times),
                    self.mock
                        .update_comment(mock_tok, id, update)
                        .map(erase_times),
                );
            }
            FuzzOp::DeleteComment { sid, comment } => {
                let (app_tok, mock_tok) = self.tokens(sid);
                let id = self.comment(comment);
                compare(
                    "DeleteComment",
                    run_on_app(
                        &mut self.app,
                        "DELETE",
                        &format!("/api/comments/{}", id.0),
                        app_tok,
                        &(),
                    )
                    .await,
                    self.mock.delete_comment(mock_tok, id),
                );
            }
            FuzzOp::ToggleLike { sid, comment } => {
                let (app_tok, mock_tok) = self.tokens(sid);
                let id = self.comment(comment);
                compare::<LikeStatus>(
                    "ToggleLike",
                    run_on_app(
                        &mut self.app,
                        "POST",
                        &format!("/api/comments/{}/like", id.0),
                        app_tok,
                        &(),
                    )
                    .await,
                    self.mock.toggle_like(mock_tok, id),
                );
            }
            FuzzOp::SetApproval {
                sid,
                comment,
                approved,
            } => {
                let (app_tok, mock_tok) = self.tokens(sid);
                let id = self.comment(comment);
                compare(
                    "SetApproval",
                    run_on_app(
                        &mut self.app,
                        "POST",
                        &format!("/api/comments/{}/approval", id.0),
                        app_tok,
                        &SetApproval { approved },
                    )
                    .await
                    .map(erase_times),
                    self.mock
                        .set_approval(mock_tok, id, approved)
                        .map(erase_times),
                );
            }
            FuzzOp::GetComment { sid, comment } => {
                let (app_tok, mock_tok) = self.maybe_tokens(sid);
                let id = self.comment(comment);
                compare(
                    "GetComment",
                    run_on_app(
                        &mut self.app,
                        "GET",
                        &format!("/api/comments/{}", id.0),
                        app_tok,
                        &(),
                    )
                    .await
                    .map(erase_times),
                    self.mock.get_comment(mock_tok, id).map(erase_times),
                );
            }
            FuzzOp::ListComments {
                sid,
                subject,
                sort,
                page,
                per_page,
            } => {
                let (app_tok, mock_tok) = self.maybe_tokens(sid);
                let subject = self.subject(subject);
                let query = ThreadQuery {
                    sort: match sort % 3 {
                        0 => Sort::Best,
                        1 => Sort::Newest,
                        _ => Sort::Oldest,
                    },
                    page: u32::from(page % 4),
                    per_page: u32::from(per_page % 4),
                };
                let sort = match query.sort {
                    Sort::Best => "best",
                    Sort::Newest => "newest",
                    Sort::Oldest => "oldest",
                };
                let uri = format!(
                    "/api/subjects/{}/{}/comments?sort={sort}&page={}&per_page={}",
                    subject.kind, subject.id.0, query.page, query.per_page,
                );
                let app_res: Result<CommentPage, _> =
                    run_on_app(&mut self.app, "GET", &uri, app_tok, &()).await;
                let mock_res = self.mock.list_comments(mock_tok, subject, &query);
                if let Ok(page) = &app_res {
                    for node in page.walk() {
                        assert_eq!(
                            node.comment.subject, subject,
                            "listing returned a comment of another subject"
                        );
                    }
                }
                compare(
                    "ListComments",
                    app_res.map(erase_page_times),
                    mock_res.map(erase_page_times),
                );
            }
            FuzzOp::ListPending { sid } => {
                let (app_tok, mock_tok) = self.tokens(sid);
                compare(
                    "ListPending",
                    run_on_app::<_, Vec<Comment>>(
                        &mut self.app,
                        "GET",
                        "/api/moderation/pending",
                        app_tok,
                        &(),
                    )
                    .await
                    .map(|v| v.into_iter().map(erase_times).collect::<Vec<_>>()),
                    self.mock
                        .list_pending(mock_tok)
                        .map(|v| v.into_iter().map(erase_times).collect()),
                );
            }
        }
    }

    async fn check_invariants(&self) {
        self.mock.test_check_invariants();
        let mut conn = self
            .pool
            .acquire()
            .await
            .expect("getting invariant check connection");
        let drifted = db::like_count_drift(&mut *conn)
            .await
            .expect("checking like counts");
        assert!(drifted.is_empty(), "like counts drifted for {drifted:?}");
    }
}

do_sqlx_test!(
    compare_with_mock,
    bolero::generator::gen::<FuzzTest>(),
    |pool, test: FuzzTest| async move {
        let policy = fuzz_policy(test.pre_moderation, test.enforce_reply_depth);
        let mut fuzzer = ComparativeFuzzer::new(pool, policy).await;
        for op in test.ops {
            fuzzer.execute_fuzz_op(op).await;
        }
        fuzzer.check_invariants().await;
    }
);

struct Seed {
    author: Requester,
    subject: SubjectRef,
}

async fn seed(pool: &PgPool) -> Seed {
    let mut conn = pool.acquire().await.expect("getting seeding connection");
    let author = Requester {
        user: UserId(Uuid::new_v4()),
        role: Role::Standard,
    };
    db::create_user(
        &mut *conn,
        NewUser {
            id: author.user,
            name: String::from("racer"),
            role: author.role,
            initial_password_hash: String::from("password"),
        },
    )
    .await
    .expect("creating seed user");
    let subject = SubjectRef::launch(Uuid::new_v4());
    db::create_subject(
        &mut *conn,
        NewSubject {
            subject,
            title: String::from("Race to orbit"),
        },
    )
    .await
    .expect("creating seed subject");
    Seed { author, subject }
}

do_sqlx_test!(
    concurrent_duplicates_conflict,
    bolero::generator::gen::<u8>(),
    |pool: PgPool, racers: u8| async move {
        let racers = usize::from(racers % 8) + 2;
        let seed = seed(&pool).await;

        let id = CommentId(Uuid::new_v4());
        let creations = (0..racers)
            .map(|i| {
                let pool = pool.clone();
                let author = seed.author;
                let new = NewComment {
                    id,
                    subject: seed.subject,
                    parent_id: None,
                    content: format!("Attempt {i}"),
                };
                tokio::spawn(async move {
                    let mut conn = pool.acquire().await.expect("getting creation connection");
                    db::create_comment(&mut *conn, &CommentPolicy::default(), &author, new).await
                })
            })
            .collect::<Vec<_>>();
        let mut created = 0;
        for res in futures::future::join_all(creations).await {
            match res.expect("joining creation task") {
                Ok(c) => {
                    assert_eq!(c.id, id);
                    created += 1;
                }
                Err(Error::Api(ApiError::UuidAlreadyUsed(u))) => assert_eq!(u, id.0),
                Err(e) => panic!("duplicate comment id yielded {e:?}"),
            }
        }
        assert_eq!(created, 1, "exactly one concurrent creation must win");

        let signups = (0..racers)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    let mut conn = pool.acquire().await.expect("getting signup connection");
                    db::create_user(
                        &mut *conn,
                        NewUser {
                            id: UserId(Uuid::new_v4()),
                            name: String::from("flight-director"),
                            role: Role::Standard,
                            initial_password_hash: String::from("password"),
                        },
                    )
                    .await
                })
            })
            .collect::<Vec<_>>();
        let mut signed_up = 0;
        for res in futures::future::join_all(signups).await {
            match res.expect("joining signup task") {
                Ok(()) => signed_up += 1,
                Err(Error::Api(ApiError::NameAlreadyUsed(n))) => assert_eq!(n, "flight-director"),
                Err(e) => panic!("duplicate user name yielded {e:?}"),
            }
        }
        assert_eq!(signed_up, 1, "exactly one concurrent signup must win");
    }
);

do_sqlx_test!(
    concurrent_toggles_never_double_count,
    bolero::generator::gen::<u8>(),
    |pool: PgPool, racers: u8| async move {
        let racers = usize::from(racers % 24) + 1;
        let seed = seed(&pool).await;
        let id = {
            let mut conn = pool.acquire().await.expect("getting creation connection");
            db::create_comment(
                &mut *conn,
                &CommentPolicy::default(),
                &seed.author,
                NewComment {
                    id: CommentId(Uuid::new_v4()),
                    subject: seed.subject,
                    parent_id: None,
                    content: String::from("Liftoff!"),
                },
            )
            .await
            .expect("creating comment")
            .id
        };

        let toggles = (0..racers)
            .map(|_| {
                let pool = pool.clone();
                let author = seed.author;
                tokio::spawn(async move {
                    let mut conn = pool.acquire().await.expect("getting toggle connection");
                    db::toggle_like(&mut *conn, &author, id).await
                })
            })
            .collect::<Vec<_>>();
        let mut net_likes = 0;
        for res in futures::future::join_all(toggles).await {
            let status = res
                .expect("joining toggle task")
                .expect("toggling like");
            assert!((0..=1).contains(&status.new_count), "got {status:?}");
            net_likes += if status.liked { 1 } else { -1 };
        }

        let mut conn = pool.acquire().await.expect("getting check connection");
        let stored = db::get_comment(&mut *conn, None, id)
            .await
            .expect("fetching comment");
        assert_eq!(stored.like_count, (racers % 2) as i64);
        assert_eq!(stored.like_count, net_likes);
        let drifted = db::like_count_drift(&mut *conn)
            .await
            .expect("checking like counts");
        assert!(drifted.is_empty(), "like counts drifted for {drifted:?}");
    }
);
