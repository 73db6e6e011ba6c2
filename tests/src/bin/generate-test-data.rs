use std::collections::BTreeSet;

use chrono::{Duration, Utc};
use launchpad_api::{
    CommentPolicy, NewUser, Role, SubjectId, SubjectRef, SubjectType, Time, UserId, Uuid,
    TOMBSTONE,
};
use rand::{seq::SliceRandom, Rng};

const NUM_USERS: usize = 5;
const NUM_SUBJECTS: usize = 6;
const NUM_COMMENTS: usize = 300;
const SUBJECT_TITLE_LEN: usize = 6;
const COMMENT_WORD_COUNT: usize = 30;

const REPLY_PROBABILITY: f64 = 0.6;
const LIKE_PROBABILITY: f64 = 0.3;
const DELETED_PROBABILITY: f64 = 0.05;
const PENDING_PROBABILITY: f64 = 0.05;

/// All users share this password
const PASSWORD: &str = "password";

struct GenComment {
    id: Uuid,
    parent: Option<usize>,
    subject: SubjectRef,
    author: UserId,
    content: String,
    is_approved: bool,
    is_deleted: bool,
    depth: i32,
    created_at: Time,
}

fn gen_n_items(table: &str, n: usize, mut f: impl FnMut(usize) -> String) {
    if n == 0 {
        return;
    }
    println!("INSERT INTO {} VALUES", table);
    for i in 0..n {
        if i != 0 {
            println!(",");
        }
        print!("    {}", f(i));
    }
    println!();
    println!("ON CONFLICT DO NOTHING;");
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn main() {
    let mut rng = rand::thread_rng();
    let policy = CommentPolicy::default();

    // Generate users, the first one being a moderator
    let users = (0..NUM_USERS)
        .map(|i| {
            NewUser::new(
                UserId(Uuid::new_v4()),
                format!("user{i}"),
                if i == 0 { Role::Moderator } else { Role::Standard },
                PASSWORD,
            )
        })
        .collect::<Vec<_>>();
    gen_n_items("users", users.len(), |i| {
        let u = &users[i];
        format!(
            "('{}', {}, {}, '{}')",
            u.id.0,
            quote(&u.name),
            quote(&u.initial_password_hash),
            u.role,
        )
    });

    // Generate subjects
    let subjects = (0..NUM_SUBJECTS)
        .map(|i| SubjectRef {
            kind: if i % 2 == 0 {
                SubjectType::Launch
            } else {
                SubjectType::Article
            },
            id: SubjectId(Uuid::new_v4()),
        })
        .collect::<Vec<_>>();
    gen_n_items("subjects", subjects.len(), |i| {
        format!(
            "('{}', '{}', {})",
            subjects[i].kind,
            subjects[i].id.0,
            quote(&lipsum::lipsum_title_with_rng(&mut rand::thread_rng())
                .split(' ')
                .take(SUBJECT_TITLE_LEN)
                .collect::<Vec<_>>()
                .join(" ")),
        )
    });

    // Generate comments, replies always coming after their parent
    let mut now = Utc::now() - Duration::days(30);
    let mut comments: Vec<GenComment> = Vec::with_capacity(NUM_COMMENTS);
    for _ in 0..NUM_COMMENTS {
        now = now + Duration::minutes(rng.gen_range(1..120));
        let parent = if rng.gen_bool(REPLY_PROBABILITY) {
            let candidates = comments
                .iter()
                .enumerate()
                .filter(|(_, c)| !c.is_deleted && policy.can_reply_at(c.depth))
                .map(|(i, _)| i)
                .collect::<Vec<_>>();
            candidates.choose(&mut rng).copied()
        } else {
            None
        };
        let (subject, depth) = match parent {
            Some(p) => (comments[p].subject, comments[p].depth + 1),
            None => (*subjects.choose(&mut rng).expect("no subjects"), 0),
        };
        let is_deleted = rng.gen_bool(DELETED_PROBABILITY);
        comments.push(GenComment {
            id: Uuid::new_v4(),
            parent,
            subject,
            author: users.choose(&mut rng).expect("no users").id,
            content: if is_deleted {
                String::from(TOMBSTONE)
            } else {
                lipsum::lipsum_words_with_rng(rand::thread_rng(), COMMENT_WORD_COUNT)
            },
            is_approved: !rng.gen_bool(PENDING_PROBABILITY),
            is_deleted,
            depth,
            created_at: now,
        });
    }

    // Generate likes first, so that comments get a consistent like count
    let mut likes = BTreeSet::new();
    for (c, comment) in comments.iter().enumerate() {
        if comment.is_deleted {
            continue;
        }
        for u in &users {
            if rng.gen_bool(LIKE_PROBABILITY) {
                likes.insert((c, u.id));
            }
        }
    }

    gen_n_items("comments", comments.len(), |i| {
        let c = &comments[i];
        let like_count = likes.iter().filter(|(l, _)| *l == i).count();
        format!(
            "('{}', {}, '{}', '{}', '{}', {}, {}, {}, {}, {}, '{}', NULL)",
            c.id,
            c.parent
                .map(|p| format!("'{}'", comments[p].id))
                .unwrap_or_else(|| String::from("NULL")),
            c.subject.kind,
            c.subject.id.0,
            c.author.0,
            quote(&c.content),
            like_count,
            c.is_approved,
            c.is_deleted,
            c.depth,
            c.created_at.to_rfc3339(),
        )
    });

    let likes = likes.into_iter().collect::<Vec<_>>();
    gen_n_items("comment_likes", likes.len(), |i| {
        let (c, user) = likes[i];
        format!(
            "('{}', '{}', '{}')",
            comments[c].id,
            user.0,
            (comments[c].created_at + Duration::minutes(5)).to_rfc3339(),
        )
    });
}
