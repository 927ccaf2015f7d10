use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub type Id = i64;

const USERNAME_MAX: usize = 50;
const TITLE_MAX: usize = 255;
const CATEGORY_MAX: usize = 50;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

/// Stored user row. Carries the password hash, so it never leaves the crate
/// boundary as an API body; handlers convert it into [`User`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Id,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub role: Role,
}

/// Public view of a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct User {
    pub id: Id,
    pub username: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

impl From<UserRecord> for User {
    fn from(r: UserRecord) -> Self {
        User { id: r.id, username: r.username, role: r.role, created_at: r.created_at }
    }
}

#[derive(Clone, Deserialize, ToSchema)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

// keep the password out of logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("username", &self.username).finish_non_exhaustive()
    }
}

impl Credentials {
    /// Trimmed username plus the password as given.
    pub fn normalized(self) -> Result<Self, &'static str> {
        let username = self.username.trim().to_string();
        if username.is_empty() {
            return Err("username must not be empty");
        }
        if username.chars().count() > USERNAME_MAX {
            return Err("username is too long");
        }
        if self.password.is_empty() {
            return Err("password must not be empty");
        }
        Ok(Credentials { username, password: self.password })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema, sqlx::FromRow)]
pub struct Article {
    pub id: Id,
    pub title: String,
    pub category: String,
    pub body: String,
    pub image: Option<String>, // content hash served from /images/{hash}
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewArticle {
    pub title: String,
    pub category: String,
    pub body: String,
    #[serde(default)]
    pub image: Option<String>,
}

impl NewArticle {
    pub fn normalized(self) -> Result<Self, &'static str> {
        let title = self.title.trim().to_string();
        let category = self.category.trim().to_string();
        if title.is_empty() {
            return Err("title must not be empty");
        }
        if title.chars().count() > TITLE_MAX {
            return Err("title is too long");
        }
        if category.is_empty() {
            return Err("category must not be empty");
        }
        if category.chars().count() > CATEGORY_MAX {
            return Err("category is too long");
        }
        if self.body.trim().is_empty() {
            return Err("body must not be empty");
        }
        let image = self.image.map(|h| h.trim().to_ascii_lowercase()).filter(|h| !h.is_empty());
        Ok(NewArticle { title, category, body: self.body, image })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema, sqlx::FromRow)]
pub struct Comment {
    pub id: Id,
    pub article_id: Id,
    pub author_id: Id,
    pub body: String,
    pub parent_id: Option<Id>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewComment {
    pub article_id: Id,
    pub author_id: Id,
    pub body: String,
    pub parent_id: Option<Id>,
}

/// Request body for posting a comment; article and author come from the path
/// and the session.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CommentRequest {
    pub body: String,
    #[serde(default)]
    pub parent_id: Option<Id>,
}

impl CommentRequest {
    pub fn into_new(self, article_id: Id, author_id: Id) -> Result<NewComment, &'static str> {
        if self.body.trim().is_empty() {
            return Err("comment must not be empty");
        }
        Ok(NewComment { article_id, author_id, body: self.body, parent_id: self.parent_id })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema, sqlx::FromRow)]
pub struct Like {
    pub id: Id,
    pub article_id: Id,
    pub author_id: Id,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct LikeState {
    pub liked: bool,
}

/// Deepest reply level a thread may reach; top-level comments sit at depth 0.
pub const MAX_REPLY_DEPTH: usize = 32;

/// One comment with its direct replies, in insertion order.
#[derive(Debug, Clone, Serialize, PartialEq, ToSchema)]
pub struct CommentNode {
    pub comment: Comment,
    pub replies: Vec<CommentNode>,
}

impl CommentNode {
    /// Rebuild the reply forest from a flat list in insertion order.
    ///
    /// A comment whose parent is not in the list is treated as a root, so a
    /// dangling reference never hides a comment. Nothing ends up deeper than
    /// [`MAX_REPLY_DEPTH`]: replies below that level are listed under their
    /// ancestor at the limit. Neither the build nor serializing the result
    /// recurses deeper than that, whatever the stored chain looks like.
    pub fn forest(comments: Vec<Comment>) -> Vec<CommentNode> {
        let n = comments.len();
        let index: HashMap<Id, usize> = comments.iter().enumerate().map(|(i, c)| (c.id, i)).collect();
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut roots = Vec::new();
        for (i, c) in comments.iter().enumerate() {
            match c.parent_id.and_then(|p| index.get(&p)) {
                Some(&p) if p != i => children[p].push(i),
                _ => roots.push(i),
            }
        }

        // Breadth-first placement: each comment is assigned a holder (the node
        // it is listed under) and a depth before any of its replies are seen.
        let mut depth = vec![usize::MAX; n];
        let mut holder: Vec<Option<usize>> = vec![None; n];
        let mut placed: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut queue: VecDeque<usize> = VecDeque::new();
        let mut next_root = 0;
        loop {
            while let Some(x) = queue.pop_front() {
                let target = if depth[x] < MAX_REPLY_DEPTH { Some(x) } else { holder[x] };
                let Some(target) = target else { continue };
                for &c in &children[x] {
                    if depth[c] == usize::MAX {
                        depth[c] = depth[target] + 1;
                        holder[c] = Some(target);
                        placed[target].push(c);
                        queue.push_back(c);
                    }
                }
            }
            // anything unreached hangs off a parent cycle; surface it as a root
            while next_root < roots.len() && depth[roots[next_root]] != usize::MAX {
                next_root += 1;
            }
            let start = if next_root < roots.len() {
                roots[next_root]
            } else {
                match (0..n).find(|&i| depth[i] == usize::MAX) {
                    Some(i) => {
                        roots.push(i);
                        i
                    }
                    None => break,
                }
            };
            depth[start] = 0;
            queue.push_back(start);
        }
        roots.sort_unstable();

        // Deepest first, so every node's replies are finished before it is.
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(depth[i]));
        let mut pending: Vec<Option<Comment>> = comments.into_iter().map(Some).collect();
        let mut built: Vec<Option<CommentNode>> = vec![None; n];
        for i in order {
            let Some(comment) = pending[i].take() else { continue };
            let mut kids = std::mem::take(&mut placed[i]);
            kids.sort_unstable();
            let replies = kids.into_iter().filter_map(|k| built[k].take()).collect();
            built[i] = Some(CommentNode { comment, replies });
        }
        roots.into_iter().filter_map(|r| built[r].take()).collect()
    }

    /// Levels below this node, counting the node itself as 1.
    pub fn height(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(self, 1)];
        while let Some((node, level)) = stack.pop() {
            deepest = deepest.max(level);
            stack.extend(node.replies.iter().map(|r| (r, level + 1)));
        }
        deepest
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ArticleDetail {
    pub article: Article,
    pub comments: Vec<CommentNode>,
    pub likes: i64,
    /// Whether the caller's session has liked the article; false when anonymous.
    pub liked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(id: Id, parent_id: Option<Id>) -> Comment {
        Comment { id, article_id: 1, author_id: 1, body: format!("c{id}"), parent_id, created_at: Utc::now() }
    }

    #[test]
    fn forest_nests_replies_in_order() {
        let forest = CommentNode::forest(vec![
            comment(1, None),
            comment(2, Some(1)),
            comment(3, None),
            comment(4, Some(2)),
            comment(5, Some(1)),
        ]);
        assert_eq!(forest.len(), 2);
        assert_eq!(forest[0].comment.id, 1);
        let replies: Vec<Id> = forest[0].replies.iter().map(|n| n.comment.id).collect();
        assert_eq!(replies, vec![2, 5]);
        assert_eq!(forest[0].replies[0].replies[0].comment.id, 4);
        assert!(forest[1].replies.is_empty());
    }

    #[test]
    fn dangling_parent_becomes_root() {
        let forest = CommentNode::forest(vec![comment(7, Some(99)), comment(8, Some(7))]);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].comment.id, 7);
        assert_eq!(forest[0].replies[0].comment.id, 8);
    }

    #[test]
    fn replies_past_the_limit_stay_under_their_ancestor() {
        let chain: Vec<Comment> =
            (1..=MAX_REPLY_DEPTH as Id + 5).map(|id| comment(id, if id == 1 { None } else { Some(id - 1) })).collect();
        let forest = CommentNode::forest(chain);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].height(), MAX_REPLY_DEPTH + 1);

        let mut node = &forest[0];
        for _ in 0..MAX_REPLY_DEPTH - 1 {
            node = &node.replies[0];
        }
        let listed: Vec<Id> = node.replies.iter().map(|r| r.comment.id).collect();
        let expected: Vec<Id> = (MAX_REPLY_DEPTH as Id + 1..=MAX_REPLY_DEPTH as Id + 5).collect();
        assert_eq!(listed, expected);
    }

    #[test]
    fn parent_cycle_still_shows_every_comment() {
        let forest = CommentNode::forest(vec![comment(1, Some(2)), comment(2, Some(1)), comment(3, None)]);
        let ids: Vec<Id> = forest.iter().map(|n| n.comment.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(forest[0].replies[0].comment.id, 2);
    }

    #[test]
    fn new_article_is_trimmed_and_checked() {
        let ok = NewArticle { title: "  T ".into(), category: "cat".into(), body: "b".into(), image: Some(" ".into()) }
            .normalized()
            .unwrap();
        assert_eq!(ok.title, "T");
        assert!(ok.image.is_none());

        let err = NewArticle { title: "T".into(), category: " ".into(), body: "b".into(), image: None }.normalized();
        assert!(err.is_err());
    }

    #[test]
    fn credentials_reject_blank_username() {
        let c = Credentials { username: "   ".into(), password: "pw".into() };
        assert!(c.normalized().is_err());
        let c = Credentials { username: " alice ".into(), password: "pw1".into() };
        assert_eq!(c.normalized().unwrap().username, "alice");
    }
}
