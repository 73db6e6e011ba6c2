use std::collections::{btree_map, BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{Duration, DurationRound, Utc};
use launchpad_api::{
    moderation, thread, AuthToken, Comment, CommentId, CommentPage, CommentPolicy, CommentUpdate,
    Error, LikeStatus, NewComment, NewSession, NewSubject, NewUser, Requester, SubjectRef,
    ThreadQuery, Time, UserId, Uuid,
};

/// In-memory model of the comment server, used as a reference in tests
pub struct MockServer {
    policy: CommentPolicy,
    users: BTreeMap<UserId, MockUser>,
    subjects: HashMap<SubjectRef, String>,
    comments: BTreeMap<CommentId, Comment>,
    likes: BTreeSet<(CommentId, UserId)>,
    last_time: Option<Time>,
}

#[derive(Debug)]
struct MockUser {
    name: String,
    pass: String,
    requester: Requester,
    sessions: HashMap<AuthToken, Device>,
}

#[derive(Debug)]
struct Device(String);

impl MockServer {
    pub fn new(policy: CommentPolicy) -> MockServer {
        MockServer {
            policy,
            users: BTreeMap::new(),
            subjects: HashMap::new(),
            comments: BTreeMap::new(),
            likes: BTreeSet::new(),
            last_time: None,
        }
    }

    /// Strictly increasing, and with the microsecond precision of the real database
    fn now(&mut self) -> Time {
        let mut now = Utc::now()
            .duration_trunc(Duration::microseconds(1))
            .unwrap_or_else(|_| Utc::now());
        if let Some(last) = self.last_time {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        self.last_time = Some(now);
        now
    }

    /// Return name & pass for user number `id`
    pub fn test_get_user_info(&self, id: usize) -> (&str, &str) {
        let u = self
            .users
            .values()
            .nth(id)
            .unwrap_or_else(|| panic!("getting user {id} among {}", self.users.len()));
        (&u.name, &u.pass)
    }

    /// Return the current number of users
    pub fn test_num_users(&self) -> usize {
        self.users.len()
    }

    /// Panics if the stored comments or likes are inconsistent
    pub fn test_check_invariants(&self) {
        for c in self.comments.values() {
            let likes = self.likes.iter().filter(|(l, _)| *l == c.id).count() as i64;
            assert_eq!(
                c.like_count, likes,
                "like count of {:?} drifted from its likes",
                c.id
            );
            match c.parent_id {
                None => assert_eq!(c.depth, 0, "root comment {:?} has a depth", c.id),
                Some(p) => {
                    let parent = self
                        .comments
                        .get(&p)
                        .unwrap_or_else(|| panic!("parent of {:?} is missing", c.id));
                    assert_eq!(
                        parent.subject, c.subject,
                        "{:?} is not on the same subject as its parent",
                        c.id
                    );
                    assert_eq!(parent.depth + 1, c.depth, "depth of {:?} is wrong", c.id);
                }
            }
        }
    }

    pub fn admin_create_user(&mut self, u: NewUser, password: String) -> Result<(), Error> {
        u.validate()?;

        if self.users.values().any(|db| db.name == u.name) {
            return Err(Error::NameAlreadyUsed(u.name));
        }

        match self.users.entry(u.id) {
            btree_map::Entry::Occupied(_) => Err(Error::UuidAlreadyUsed(u.id.0)),
            btree_map::Entry::Vacant(entry) => {
                entry.insert(MockUser {
                    name: u.name,
                    pass: password,
                    requester: Requester {
                        user: u.id,
                        role: u.role,
                    },
                    sessions: HashMap::new(),
                });
                Ok(())
            }
        }
    }

    pub fn admin_create_subject(&mut self, s: NewSubject) -> Result<(), Error> {
        s.validate()?;
        self.subjects.insert(s.subject, s.title);
        Ok(())
    }

    pub fn auth(&mut self, s: NewSession) -> Result<AuthToken, Error> {
        s.validate()?;
        for u in self.users.values_mut() {
            if u.name == s.user {
                // tests (of which mock-server is a part of) don't actually use bcrypt
                if s.password != u.pass {
                    return Err(Error::Unauthenticated);
                } else {
                    let tok = AuthToken(Uuid::new_v4());
                    u.sessions.insert(tok, Device(s.device));
                    return Ok(tok);
                }
            }
        }
        Err(Error::Unauthenticated)
    }

    fn resolve(&self, tok: Option<AuthToken>) -> Result<Requester, Error> {
        let tok = tok.ok_or(Error::Unauthenticated)?;
        for u in self.users.values() {
            if u.sessions.contains_key(&tok) {
                return Ok(u.requester);
            }
        }
        Err(Error::Unauthenticated)
    }

    fn resolve_optional(&self, tok: Option<AuthToken>) -> Result<Option<Requester>, Error> {
        match tok {
            None => Ok(None),
            Some(_) => self.resolve(tok).map(Some),
        }
    }

    pub fn unauth(&mut self, tok: AuthToken) -> Result<(), Error> {
        for u in self.users.values_mut() {
            if u.sessions.remove(&tok).is_some() {
                return Ok(());
            }
        }
        Err(Error::Unauthenticated)
    }

    pub fn whoami(&self, tok: AuthToken) -> Result<Requester, Error> {
        self.resolve(Some(tok))
    }

    fn comment(&self, id: CommentId) -> Result<&Comment, Error> {
        self.comments.get(&id).ok_or(Error::CommentNotFound(id))
    }

    fn comment_mut(&mut self, id: CommentId) -> Result<&mut Comment, Error> {
        self.comments.get_mut(&id).ok_or(Error::CommentNotFound(id))
    }

    pub fn list_comments(
        &self,
        tok: Option<AuthToken>,
        subject: SubjectRef,
        query: &ThreadQuery,
    ) -> Result<CommentPage, Error> {
        let requester = self.resolve_optional(tok)?;
        if !self.subjects.contains_key(&subject) {
            return Err(Error::SubjectNotFound(subject));
        }
        let comments = self
            .comments
            .values()
            .filter(|c| c.subject == subject)
            .cloned()
            .collect();
        let liked = match requester {
            None => HashSet::new(),
            Some(r) => self
                .likes
                .iter()
                .filter(|(_, u)| *u == r.user)
                .map(|(c, _)| *c)
                .collect(),
        };
        let visible = moderation::filter_visible(comments, requester.as_ref());
        Ok(thread::build(visible, &liked, query, &self.policy))
    }

    pub fn create_comment(
        &mut self,
        tok: Option<AuthToken>,
        new: NewComment,
    ) -> Result<Comment, Error> {
        let author = self.resolve(tok)?;
        let content = self.policy.validate_content(&new.content)?;
        if !self.subjects.contains_key(&new.subject) {
            return Err(Error::SubjectNotFound(new.subject));
        }
        if self.comments.contains_key(&new.id) {
            return Err(Error::UuidAlreadyUsed(new.id.0));
        }
        let parent = new.parent_id.and_then(|p| self.comments.get(&p));
        let depth = new.reply_depth(parent, &author, &self.policy)?;

        let now = self.now();
        let comment = new.into_comment(&author, content, depth, &self.policy, now);
        self.comments.insert(comment.id, comment.clone());
        Ok(comment)
    }

    pub fn get_comment(&self, tok: Option<AuthToken>, id: CommentId) -> Result<Comment, Error> {
        let requester = self.resolve_optional(tok)?;
        let comment = self.comment(id)?;
        comment.check_read(requester.as_ref())?;
        Ok(comment.clone())
    }

    pub fn update_comment(
        &mut self,
        tok: Option<AuthToken>,
        id: CommentId,
        update: CommentUpdate,
    ) -> Result<Comment, Error> {
        let requester = self.resolve(tok)?;
        self.comment(id)?.check_edit(&requester)?;
        let content = self.policy.validate_content(&update.content)?;

        let now = self.now();
        let comment = self.comment_mut(id)?;
        comment.content = content;
        comment.updated_at = Some(now);
        Ok(comment.clone())
    }

    pub fn delete_comment(&mut self, tok: Option<AuthToken>, id: CommentId) -> Result<(), Error> {
        let requester = self.resolve(tok)?;
        let comment = self.comment(id)?;
        comment.check_delete(&requester)?;
        if comment.is_deleted {
            return Ok(());
        }

        let now = self.now();
        self.comment_mut(id)?.tombstone(now);
        Ok(())
    }

    pub fn toggle_like(&mut self, tok: Option<AuthToken>, id: CommentId) -> Result<LikeStatus, Error> {
        let requester = self.resolve(tok)?;
        self.comment(id)?.check_like(&requester)?;

        let key = (id, requester.user);
        let liked = !self.likes.remove(&key);
        if liked {
            self.likes.insert(key);
        }
        let new_count = self.likes.iter().filter(|(c, _)| *c == id).count() as i64;
        self.comment_mut(id)?.like_count = new_count;
        Ok(LikeStatus { liked, new_count })
    }

    pub fn set_approval(
        &mut self,
        tok: Option<AuthToken>,
        id: CommentId,
        approved: bool,
    ) -> Result<Comment, Error> {
        let requester = self.resolve(tok)?;
        moderation::check_moderator(&requester)?;
        let comment = self.comment_mut(id)?;
        comment.is_approved = approved;
        Ok(comment.clone())
    }

    pub fn list_pending(&self, tok: Option<AuthToken>) -> Result<Vec<Comment>, Error> {
        let requester = self.resolve(tok)?;
        moderation::check_moderator(&requester)?;
        Ok(moderation::pending(
            self.comments.values().cloned().collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use launchpad_api::{Role, Sort, TOMBSTONE};

    use super::*;

    struct Fixture {
        mock: MockServer,
        subject: SubjectRef,
    }

    impl Fixture {
        fn new(policy: CommentPolicy) -> Fixture {
            let mut mock = MockServer::new(policy);
            let subject = SubjectRef::launch(Uuid::new_v4());
            mock.admin_create_subject(NewSubject {
                subject,
                title: String::from("Artemis II"),
            })
            .unwrap();
            Fixture { mock, subject }
        }

        fn login(&mut self, name: &str, role: Role) -> AuthToken {
            let id = UserId(Uuid::new_v4());
            self.mock
                .admin_create_user(
                    NewUser {
                        id,
                        name: String::from(name),
                        role,
                        initial_password_hash: String::from("pass"),
                    },
                    String::from("pass"),
                )
                .unwrap();
            self.mock
                .auth(NewSession {
                    user: String::from(name),
                    password: String::from("pass"),
                    device: String::from("test"),
                })
                .unwrap()
        }

        fn post(
            &mut self,
            tok: AuthToken,
            parent: Option<CommentId>,
            content: &str,
        ) -> Result<Comment, Error> {
            self.mock.create_comment(
                Some(tok),
                NewComment {
                    id: CommentId(Uuid::new_v4()),
                    subject: self.subject,
                    parent_id: parent,
                    content: String::from(content),
                },
            )
        }

        fn list(&self, tok: Option<AuthToken>, sort: Sort) -> CommentPage {
            self.mock
                .list_comments(tok, self.subject, &ThreadQuery::sorted(sort))
                .unwrap()
        }
    }

    #[test]
    fn reply_scenario() {
        let mut f = Fixture::new(CommentPolicy::default());
        let u = f.login("u", Role::Standard);
        let c1 = f.post(u, None, "Hello").unwrap();
        let c2 = f.post(u, Some(c1.id), "Hi back").unwrap();
        assert_eq!(c2.depth, 1);

        let page = f.list(None, Sort::Best);
        assert_eq!(page.total, 2);
        assert_eq!(page.comments.len(), 1);
        assert_eq!(page.comments[0].comment, c1);
        assert_eq!(page.comments[0].replies.len(), 1);
        assert_eq!(page.comments[0].replies[0].comment, c2);
        f.mock.test_check_invariants();
    }

    #[test]
    fn double_like_scenario() {
        let mut f = Fixture::new(CommentPolicy::default());
        let u = f.login("u", Role::Standard);
        let c1 = f.post(u, None, "Hello").unwrap();

        assert_eq!(
            f.mock.toggle_like(Some(u), c1.id),
            Ok(LikeStatus {
                liked: true,
                new_count: 1
            })
        );
        assert!(f.list(Some(u), Sort::Best).comments[0].liked_by_me);
        assert!(!f.list(None, Sort::Best).comments[0].liked_by_me);
        assert_eq!(
            f.mock.toggle_like(Some(u), c1.id),
            Ok(LikeStatus {
                liked: false,
                new_count: 0
            })
        );
        f.mock.test_check_invariants();
    }

    #[test]
    fn like_counts_follow_the_ledger() {
        let mut f = Fixture::new(CommentPolicy::default());
        let users = (0..4)
            .map(|i| f.login(&format!("user{i}"), Role::Standard))
            .collect::<Vec<_>>();
        let c = f.post(users[0], None, "Nominal trajectory").unwrap();
        for (i, &u) in users.iter().enumerate() {
            for _ in 0..=i {
                f.mock.toggle_like(Some(u), c.id).unwrap();
                f.mock.test_check_invariants();
            }
        }
        // users 0 and 2 toggled an odd number of times
        assert_eq!(f.mock.get_comment(None, c.id).unwrap().like_count, 2);
    }

    #[test]
    fn non_owner_cannot_update() {
        let mut f = Fixture::new(CommentPolicy::default());
        let owner = f.login("owner", Role::Standard);
        let other = f.login("other", Role::Moderator);
        let c = f.post(owner, None, "Hello").unwrap();

        assert_eq!(
            f.mock.update_comment(
                Some(other),
                c.id,
                CommentUpdate {
                    content: String::from("Hijacked")
                }
            ),
            Err(Error::PermissionDenied)
        );
        assert_eq!(f.mock.get_comment(None, c.id), Ok(c.clone()));

        let edited = f
            .mock
            .update_comment(
                Some(owner),
                c.id,
                CommentUpdate {
                    content: String::from("  Hello, world  "),
                },
            )
            .unwrap();
        assert_eq!(edited.content, "Hello, world");
        assert!(edited.updated_at.is_some());
        assert_eq!(
            f.mock.update_comment(
                Some(owner),
                c.id,
                CommentUpdate {
                    content: String::from(" ")
                }
            ),
            Err(Error::EmptyContent)
        );
    }

    #[test]
    fn newest_first() {
        let mut f = Fixture::new(CommentPolicy::default());
        let u = f.login("u", Role::Standard);
        let t1 = f.post(u, None, "first").unwrap();
        let t2 = f.post(u, None, "second").unwrap();
        let t3 = f.post(u, None, "third").unwrap();
        let ids = f
            .list(None, Sort::Newest)
            .comments
            .into_iter()
            .map(|n| n.comment.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![t3.id, t2.id, t1.id]);
    }

    #[test]
    fn delete_keeps_replies() {
        let mut f = Fixture::new(CommentPolicy::default());
        let owner = f.login("owner", Role::Standard);
        let other = f.login("other", Role::Standard);
        let parent = f.post(owner, None, "Scrub!").unwrap();
        let reply = f.post(other, Some(parent.id), "Why?").unwrap();

        assert_eq!(
            f.mock.delete_comment(Some(other), parent.id),
            Err(Error::PermissionDenied)
        );
        f.mock.delete_comment(Some(owner), parent.id).unwrap();
        // deleting a tombstone again is a no-op
        f.mock.delete_comment(Some(owner), parent.id).unwrap();

        let page = f.list(None, Sort::Best);
        assert_eq!(page.total, 1);
        let root = &page.comments[0];
        assert_eq!(root.comment.id, parent.id);
        assert_eq!(root.comment.content, TOMBSTONE);
        assert!(root.comment.is_deleted);
        assert_eq!(root.replies[0].comment, reply);

        assert_eq!(
            f.post(other, Some(parent.id), "Still there?"),
            Err(Error::CommentNotFound(parent.id))
        );
        assert_eq!(
            f.mock.toggle_like(Some(other), parent.id),
            Err(Error::CommentNotFound(parent.id))
        );
        f.mock.test_check_invariants();
    }

    #[test]
    fn moderators_delete_anything() {
        let mut f = Fixture::new(CommentPolicy::default());
        let owner = f.login("owner", Role::Standard);
        let moderator = f.login("moderator", Role::Moderator);
        let c = f.post(owner, None, "Spam").unwrap();
        f.mock.delete_comment(Some(moderator), c.id).unwrap();
        // a lone tombstone is pruned from the thread
        assert!(f.list(None, Sort::Best).comments.is_empty());
    }

    #[test]
    fn pre_moderation() {
        let mut f = Fixture::new(CommentPolicy {
            pre_moderation: true,
            ..CommentPolicy::default()
        });
        let author = f.login("author", Role::Standard);
        let reader = f.login("reader", Role::Standard);
        let moderator = f.login("moderator", Role::Moderator);
        let c = f.post(author, None, "Pending").unwrap();
        assert!(!c.is_approved);

        assert_eq!(f.list(None, Sort::Best).total, 0);
        assert_eq!(f.list(Some(reader), Sort::Best).total, 0);
        assert_eq!(f.list(Some(author), Sort::Best).total, 1);
        assert_eq!(f.list(Some(moderator), Sort::Best).total, 1);
        assert_eq!(
            f.mock.get_comment(Some(reader), c.id),
            Err(Error::CommentNotFound(c.id))
        );

        assert_eq!(f.mock.list_pending(Some(reader)), Err(Error::PermissionDenied));
        assert_eq!(f.mock.list_pending(Some(moderator)), Ok(vec![c.clone()]));
        assert_eq!(
            f.mock.set_approval(Some(author), c.id, true),
            Err(Error::PermissionDenied)
        );
        let approved = f.mock.set_approval(Some(moderator), c.id, true).unwrap();
        assert!(approved.is_approved);

        assert_eq!(f.list(Some(reader), Sort::Best).total, 1);
        assert_eq!(f.mock.list_pending(Some(moderator)), Ok(vec![]));
    }

    #[test]
    fn create_validation() {
        let mut f = Fixture::new(CommentPolicy {
            max_reply_depth: 1,
            enforce_reply_depth: true,
            ..CommentPolicy::default()
        });
        let u = f.login("u", Role::Standard);

        assert_eq!(f.post(u, None, "   "), Err(Error::EmptyContent));
        assert_eq!(
            f.mock.create_comment(
                None,
                NewComment {
                    id: CommentId(Uuid::new_v4()),
                    subject: f.subject,
                    parent_id: None,
                    content: String::from("anonymous"),
                }
            ),
            Err(Error::Unauthenticated)
        );

        let unknown = SubjectRef::article(Uuid::new_v4());
        assert_eq!(
            f.mock.create_comment(
                Some(u),
                NewComment {
                    id: CommentId(Uuid::new_v4()),
                    subject: unknown,
                    parent_id: None,
                    content: String::from("hello?"),
                }
            ),
            Err(Error::SubjectNotFound(unknown))
        );

        let missing = CommentId(Uuid::new_v4());
        assert_eq!(
            f.post(u, Some(missing), "orphan"),
            Err(Error::CommentNotFound(missing))
        );

        let root = f.post(u, None, "root").unwrap();
        let reply = f.post(u, Some(root.id), "reply").unwrap();
        assert_eq!(
            f.post(u, Some(reply.id), "too deep"),
            Err(Error::ReplyTooDeep { max_depth: 1 })
        );

        assert_eq!(
            f.mock.create_comment(
                Some(u),
                NewComment {
                    id: root.id,
                    subject: f.subject,
                    parent_id: None,
                    content: String::from("same id"),
                }
            ),
            Err(Error::UuidAlreadyUsed(root.id.0))
        );
    }

    #[test]
    fn parent_on_other_subject() {
        let mut f = Fixture::new(CommentPolicy::default());
        let u = f.login("u", Role::Standard);
        let other = SubjectRef::article(Uuid::new_v4());
        f.mock
            .admin_create_subject(NewSubject {
                subject: other,
                title: String::from("Starship flight test"),
            })
            .unwrap();
        let parent = f.post(u, None, "on the launch").unwrap();
        assert_eq!(
            f.mock.create_comment(
                Some(u),
                NewComment {
                    id: CommentId(Uuid::new_v4()),
                    subject: other,
                    parent_id: Some(parent.id),
                    content: String::from("on the article"),
                }
            ),
            Err(Error::CommentNotFound(parent.id))
        );
        f.mock.test_check_invariants();
    }

    #[test]
    fn sessions() {
        let mut f = Fixture::new(CommentPolicy::default());
        let u = f.login("u", Role::Moderator);
        assert_eq!(f.mock.whoami(u).map(|r| r.role), Ok(Role::Moderator));
        assert_eq!(
            f.mock.auth(NewSession {
                user: String::from("u"),
                password: String::from("wrong"),
                device: String::from("test"),
            }),
            Err(Error::Unauthenticated)
        );
        f.mock.unauth(u).unwrap();
        assert_eq!(f.mock.whoami(u), Err(Error::Unauthenticated));
        assert_eq!(
            f.mock
                .list_comments(Some(u), f.subject, &ThreadQuery::default()),
            Err(Error::Unauthenticated)
        );
    }
}
