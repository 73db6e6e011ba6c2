use anyhow::{anyhow, Context};
use launchpad_api::{
    AuthToken, CommentNode, CommentPage, NewSession, NewSubject, NewUser, Role, Sort, SubjectId,
    SubjectRef, SubjectType, ThreadQuery, UserId, Uuid,
};

#[derive(structopt::StructOpt)]
struct Opt {
    #[structopt(short, long, env = "LAUNCHPAD_HOST")]
    host: String,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(structopt::StructOpt)]
enum Command {
    /// Create a user
    CreateUser {
        /// Username
        name: String,

        /// Initial password
        initial_password: String,

        /// One of standard, moderator or admin
        #[structopt(long, default_value = "standard")]
        role: Role,
    },

    /// Register an article or a launch, so that it can be commented upon
    CreateSubject {
        /// article or launch
        kind: SubjectType,

        id: Uuid,

        title: String,
    },

    /// Open a session and print its token
    Login {
        name: String,

        password: String,

        #[structopt(long, default_value = "launchpad-ctl")]
        device: String,
    },

    /// Print the comment thread of a subject
    List {
        kind: SubjectType,

        id: Uuid,

        /// One of best, newest or oldest
        #[structopt(long, default_value = "best", parse(try_from_str = parse_sort))]
        sort: Sort,

        #[structopt(long, default_value = "0")]
        page: u32,

        #[structopt(long, env = "LAUNCHPAD_TOKEN")]
        token: Option<Uuid>,
    },

    /// Print the comments awaiting moderation
    Pending {
        #[structopt(long, env = "LAUNCHPAD_TOKEN")]
        token: Uuid,
    },
}

fn parse_sort(s: &str) -> anyhow::Result<Sort> {
    serde_json::from_value(serde_json::Value::String(String::from(s)))
        .with_context(|| format!("parsing {s:?} as a sort order"))
}

fn admin_token() -> anyhow::Result<AuthToken> {
    let tok =
        std::env::var("ADMIN_TOKEN").context("retrieving ADMIN_TOKEN environment variable")?;
    let tok = Uuid::try_parse(&tok).context("parsing ADMIN_TOKEN as an auth token")?;
    Ok(AuthToken(tok))
}

/// Sends the request, turning error responses into the server-provided error
async fn send(req: reqwest::RequestBuilder) -> anyhow::Result<reqwest::Response> {
    let resp = req.send().await.context("sending request")?;
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.bytes().await.context("reading error response")?;
    match launchpad_api::Error::parse(&body) {
        Ok(err) => Err(anyhow!(err)).with_context(|| format!("server answered {status}")),
        Err(_) => Err(anyhow!("server answered {status}: {body:?}")),
    }
}

fn print_node(node: &CommentNode, indent: usize) {
    let c = &node.comment;
    println!(
        "{:indent$}[{}] {} ({} likes{}{})",
        "",
        c.id.0,
        c.content,
        c.like_count,
        if c.is_approved { "" } else { ", pending" },
        if node.liked_by_me { ", liked" } else { "" },
        indent = indent * 2,
    );
    for r in &node.replies {
        print_node(r, indent + 1);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = <Opt as structopt::StructOpt>::from_args();

    let client = reqwest::Client::new();

    match opt.cmd {
        Command::CreateUser {
            name,
            initial_password,
            role,
        } => {
            let id = UserId(Uuid::new_v4());
            send(
                client
                    .post(format!("{}/api/admin/create-user", opt.host))
                    .json(&NewUser::new(id, name, role, &initial_password))
                    .bearer_auth(admin_token()?.0),
            )
            .await?;
            println!("{}", id.0);
        }
        Command::CreateSubject { kind, id, title } => {
            send(
                client
                    .post(format!("{}/api/admin/create-subject", opt.host))
                    .json(&NewSubject {
                        subject: SubjectRef {
                            kind,
                            id: SubjectId(id),
                        },
                        title,
                    })
                    .bearer_auth(admin_token()?.0),
            )
            .await?;
        }
        Command::Login {
            name,
            password,
            device,
        } => {
            let tok: AuthToken = send(client.post(format!("{}/api/auth", opt.host)).json(
                &NewSession {
                    user: name,
                    password,
                    device,
                },
            ))
            .await?
            .json()
            .await
            .context("parsing auth token")?;
            println!("{}", tok.0);
        }
        Command::List {
            kind,
            id,
            sort,
            page,
            token,
        } => {
            let req = client
                .get(format!("{}/api/subjects/{kind}/{id}/comments", opt.host))
                .query(&ThreadQuery {
                    sort,
                    page,
                    ..ThreadQuery::default()
                });
            let req = match token {
                Some(tok) => req.bearer_auth(tok),
                None => req,
            };
            let page: CommentPage = send(req)
                .await?
                .json()
                .await
                .context("parsing comment page")?;
            println!(
                "{} comments, page {} ({} per page)",
                page.total, page.page, page.per_page
            );
            for node in &page.comments {
                print_node(node, 0);
            }
        }
        Command::Pending { token } => {
            let comments: Vec<launchpad_api::Comment> = send(
                client
                    .get(format!("{}/api/moderation/pending", opt.host))
                    .bearer_auth(token),
            )
            .await?
            .json()
            .await
            .context("parsing pending comments")?;
            for c in comments {
                println!(
                    "[{}] on {} {}: {}",
                    c.id.0, c.subject.kind, c.subject.id.0, c.content
                );
            }
        }
    }

    Ok(())
}
