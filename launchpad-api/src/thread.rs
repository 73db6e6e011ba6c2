use std::{
    cmp::Reverse,
    collections::{HashMap, HashSet, VecDeque},
};

use crate::{Comment, CommentId, CommentPolicy};

pub const DEFAULT_PER_PAGE: u32 = 50;
pub const MAX_PER_PAGE: u32 = 200;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sort {
    /// Most liked first, then oldest first
    #[default]
    Best,
    Newest,
    Oldest,
}

impl Sort {
    /// Sorts `idxs`, which index into `comments`
    ///
    /// Ties are always broken by comment id, so that the order is fully determined.
    pub fn sort(&self, comments: &[Comment], idxs: &mut [usize]) {
        match self {
            Sort::Best => idxs.sort_unstable_by_key(|&i| {
                let c = &comments[i];
                (Reverse(c.like_count), c.created_at, c.id)
            }),
            Sort::Newest => idxs.sort_unstable_by_key(|&i| {
                let c = &comments[i];
                (Reverse(c.created_at), c.id)
            }),
            Sort::Oldest => idxs.sort_unstable_by_key(|&i| {
                let c = &comments[i];
                (c.created_at, c.id)
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ThreadQuery {
    #[serde(default)]
    pub sort: Sort,

    /// 0-based, counted in top-level comments
    #[serde(default)]
    pub page: u32,

    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_per_page() -> u32 {
    DEFAULT_PER_PAGE
}

impl Default for ThreadQuery {
    fn default() -> ThreadQuery {
        ThreadQuery {
            sort: Sort::default(),
            page: 0,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

impl ThreadQuery {
    pub fn sorted(sort: Sort) -> ThreadQuery {
        ThreadQuery {
            sort,
            ..ThreadQuery::default()
        }
    }

    fn per_page(&self) -> usize {
        self.per_page.clamp(1, MAX_PER_PAGE) as usize
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommentNode {
    #[serde(flatten)]
    pub comment: Comment,

    /// Whether the presentation layer should offer to reply to this comment
    pub can_reply: bool,

    pub liked_by_me: bool,

    pub replies: Vec<CommentNode>,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommentPage {
    pub comments: Vec<CommentNode>,

    /// Number of visible, non-deleted comments of the subject, regardless of nesting or paging
    pub total: u64,

    pub page: u32,
    pub per_page: u32,
}

impl CommentPage {
    /// Visits all the nodes of this page, parents before their replies
    pub fn walk(&self) -> impl Iterator<Item = &CommentNode> {
        let mut stack = self.comments.iter().rev().collect::<Vec<_>>();
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.replies.iter().rev());
            Some(node)
        })
    }
}

/// Nests already-filtered comments into reply trees
///
/// `liked` holds the comments the requester currently likes. Comments whose parent is
/// not part of `comments` are dropped along with their replies, and tombstones without
/// any remaining reply are pruned. Depth is bounded only through `can_reply`: deeper
/// comments are still attached.
pub fn build(
    comments: Vec<Comment>,
    liked: &HashSet<CommentId>,
    query: &ThreadQuery,
    policy: &CommentPolicy,
) -> CommentPage {
    let index = comments
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id, i))
        .collect::<HashMap<CommentId, usize>>();
    let mut roots = Vec::new();
    let mut children = vec![Vec::new(); comments.len()];
    for (i, c) in comments.iter().enumerate() {
        match c.parent_id {
            None => roots.push(i),
            Some(parent) => {
                if let Some(&p) = index.get(&parent) {
                    children[p].push(i);
                }
            }
        }
    }
    query.sort.sort(&comments, &mut roots);
    for siblings in children.iter_mut() {
        query.sort.sort(&comments, siblings);
    }

    // Breadth-first, so that parents always come before their replies
    let mut depths = vec![0; comments.len()];
    let mut order = Vec::with_capacity(comments.len());
    let mut queue = roots.iter().copied().collect::<VecDeque<usize>>();
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &c in &children[i] {
            depths[c] = depths[i] + 1;
            queue.push_back(c);
        }
    }
    // Only what is reachable from a root can be shown
    let total = order.iter().filter(|&&i| !comments[i].is_deleted).count() as u64;

    let mut comments = comments.into_iter().map(Some).collect::<Vec<_>>();
    let mut built: Vec<Option<CommentNode>> = (0..comments.len()).map(|_| None).collect();
    for &i in order.iter().rev() {
        let replies = children[i]
            .iter()
            .filter_map(|&c| built[c].take())
            .collect::<Vec<_>>();
        let comment = match comments[i].take() {
            Some(c) => c,
            None => continue,
        };
        if comment.is_deleted && replies.is_empty() {
            continue;
        }
        built[i] = Some(CommentNode {
            can_reply: !comment.is_deleted && policy.can_reply_at(depths[i]),
            liked_by_me: liked.contains(&comment.id),
            comment,
            replies,
        });
    }

    let per_page = query.per_page();
    let comments = roots
        .iter()
        .filter_map(|&r| built[r].take())
        .skip((query.page as usize).saturating_mul(per_page))
        .take(per_page)
        .collect();
    CommentPage {
        comments,
        total,
        page: query.page,
        per_page: per_page as u32,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::{SubjectRef, Time, UserId, Uuid};

    fn t(secs: i64) -> Time {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn comment(parent: Option<&Comment>, likes: i64, at: i64) -> Comment {
        Comment {
            id: CommentId(Uuid::new_v4()),
            parent_id: parent.map(|p| p.id),
            subject: SubjectRef::article(Uuid::nil()),
            author_id: UserId::stub(),
            content: format!("comment at {at}"),
            like_count: likes,
            is_approved: true,
            is_deleted: false,
            depth: parent.map_or(0, |p| p.depth + 1),
            created_at: t(at),
            updated_at: None,
        }
    }

    fn ids(nodes: &[CommentNode]) -> Vec<CommentId> {
        nodes.iter().map(|n| n.comment.id).collect()
    }

    fn build_sorted(comments: Vec<Comment>, sort: Sort) -> CommentPage {
        build(
            comments,
            &HashSet::new(),
            &ThreadQuery::sorted(sort),
            &CommentPolicy::default(),
        )
    }

    #[test]
    fn root_with_one_reply() {
        let c1 = comment(None, 0, 0);
        let c2 = comment(Some(&c1), 0, 1);
        let page = build_sorted(vec![c2.clone(), c1.clone()], Sort::Best);
        assert_eq!(page.total, 2);
        assert_eq!(ids(&page.comments), vec![c1.id]);
        assert_eq!(ids(&page.comments[0].replies), vec![c2.id]);
        assert!(page.comments[0].replies[0].replies.is_empty());
    }

    #[test]
    fn sort_orders() {
        let a = comment(None, 1, 1);
        let b = comment(None, 5, 2);
        let c = comment(None, 1, 3);
        let all = vec![a.clone(), b.clone(), c.clone()];

        let newest = build_sorted(all.clone(), Sort::Newest);
        assert_eq!(ids(&newest.comments), vec![c.id, b.id, a.id]);

        let oldest = build_sorted(all.clone(), Sort::Oldest);
        assert_eq!(ids(&oldest.comments), vec![a.id, b.id, c.id]);

        // most liked first, equal likes broken by ascending creation date
        let best = build_sorted(all, Sort::Best);
        assert_eq!(ids(&best.comments), vec![b.id, a.id, c.id]);
    }

    #[test]
    fn siblings_are_sorted_at_every_level() {
        let root = comment(None, 0, 0);
        let r1 = comment(Some(&root), 0, 1);
        let r2 = comment(Some(&root), 3, 2);
        let r1a = comment(Some(&r1), 0, 3);
        let r1b = comment(Some(&r1), 2, 4);
        let page = build_sorted(
            vec![r1a.clone(), root.clone(), r2.clone(), r1b.clone(), r1.clone()],
            Sort::Best,
        );
        assert_eq!(ids(&page.comments[0].replies), vec![r2.id, r1.id]);
        assert_eq!(ids(&page.comments[0].replies[1].replies), vec![r1b.id, r1a.id]);
        assert_eq!(
            page.walk().map(|n| n.comment.id).collect::<Vec<_>>(),
            vec![root.id, r2.id, r1.id, r1b.id, r1a.id]
        );
    }

    #[test]
    fn deep_replies_are_kept_but_not_replyable() {
        let policy = CommentPolicy::default();
        let mut chain = vec![comment(None, 0, 0)];
        for i in 1..=5 {
            let next = comment(chain.last(), 0, i);
            chain.push(next);
        }
        let page = build(
            chain.clone(),
            &HashSet::new(),
            &ThreadQuery::default(),
            &policy,
        );
        let walked = page.walk().collect::<Vec<_>>();
        assert_eq!(walked.len(), chain.len());
        for (depth, node) in walked.iter().enumerate() {
            assert_eq!(node.comment.id, chain[depth].id);
            assert_eq!(node.can_reply, (depth as i32) < policy.max_reply_depth);
        }
    }

    #[test]
    fn tombstones() {
        let root = comment(None, 0, 0);
        let reply = comment(Some(&root), 0, 1);
        let lonely = comment(None, 0, 2);
        let mut dead_root = root.clone();
        dead_root.tombstone(t(5));
        let mut dead_lonely = lonely.clone();
        dead_lonely.tombstone(t(5));

        let page = build_sorted(
            vec![dead_root.clone(), reply.clone(), dead_lonely],
            Sort::Oldest,
        );
        // the tombstone with a reply stays as a placeholder, the lonely one is pruned
        assert_eq!(ids(&page.comments), vec![root.id]);
        assert!(page.comments[0].comment.is_deleted);
        assert!(!page.comments[0].can_reply);
        assert_eq!(ids(&page.comments[0].replies), vec![reply.id]);
        assert_eq!(page.total, 1);
    }

    #[test]
    fn hidden_parents_hide_their_subtree() {
        let root = comment(None, 0, 0);
        let reply = comment(Some(&root), 0, 1);
        let other = comment(None, 0, 2);
        let deeper = comment(Some(&reply), 0, 3);
        let page = build_sorted(vec![reply, deeper, other.clone()], Sort::Oldest);
        assert_eq!(ids(&page.comments), vec![other.id]);
        assert_eq!(page.total, 1);

        let page = build_sorted(vec![comment(Some(&root), 0, 1)], Sort::Best);
        assert!(page.comments.is_empty());
        assert_eq!(page.total, 0);
    }

    #[test]
    fn liked_by_me() {
        let a = comment(None, 1, 0);
        let b = comment(None, 0, 1);
        let liked = [a.id].into_iter().collect::<HashSet<_>>();
        let page = build(
            vec![a.clone(), b],
            &liked,
            &ThreadQuery::default(),
            &CommentPolicy::default(),
        );
        assert!(page.comments[0].liked_by_me);
        assert!(!page.comments[1].liked_by_me);
    }

    #[test]
    fn pagination_counts_roots() {
        let roots = (0..5).map(|i| comment(None, 0, i)).collect::<Vec<_>>();
        let reply = comment(Some(&roots[2]), 0, 10);
        let mut all = roots.clone();
        all.push(reply.clone());

        let query = ThreadQuery {
            sort: Sort::Oldest,
            page: 1,
            per_page: 2,
        };
        let page = build(
            all.clone(),
            &HashSet::new(),
            &query,
            &CommentPolicy::default(),
        );
        assert_eq!(ids(&page.comments), vec![roots[2].id, roots[3].id]);
        assert_eq!(ids(&page.comments[0].replies), vec![reply.id]);
        assert_eq!(page.total, 6);

        let past_end = ThreadQuery { page: 3, ..query };
        let page = build(all, &HashSet::new(), &past_end, &CommentPolicy::default());
        assert!(page.comments.is_empty());
        assert_eq!(page.total, 6);
    }

    #[test]
    fn query_defaults() {
        let q: ThreadQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(q, ThreadQuery::default());
        let q: ThreadQuery = serde_json::from_str(r#"{"sort": "newest", "page": 2}"#).unwrap();
        assert_eq!(q.sort, Sort::Newest);
        assert_eq!(q.page, 2);
        assert_eq!(q.per_page, DEFAULT_PER_PAGE);
    }
}
