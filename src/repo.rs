use async_trait::async_trait;

use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("parent comment belongs to a different article")] InvalidParent,
    #[error("reply thread is too deep")] ThreadTooDeep,
    #[error("storage error: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Credential persistence. Usernames are unique; a second insert with the
/// same username fails with [`RepoError::Conflict`] and leaves the first row
/// untouched.
#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn create_user(&self, new: NewUser) -> RepoResult<UserRecord>;
    async fn find_user_by_username(&self, username: &str) -> RepoResult<Option<UserRecord>>;
    async fn get_user(&self, id: Id) -> RepoResult<UserRecord>;
}

#[async_trait]
pub trait ArticleRepo: Send + Sync {
    /// Newest first.
    async fn list_articles(&self) -> RepoResult<Vec<Article>>;
    async fn get_article(&self, id: Id) -> RepoResult<Article>;
    async fn create_article(&self, new: NewArticle) -> RepoResult<Article>;
    /// Removes the article together with its comments and likes.
    async fn delete_article(&self, id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait CommentRepo: Send + Sync {
    async fn add_comment(&self, new: NewComment) -> RepoResult<Comment>;
    /// Flat list in insertion order; callers rebuild threads from `parent_id`.
    async fn list_comments(&self, article_id: Id) -> RepoResult<Vec<Comment>>;
}

#[async_trait]
pub trait LikeRepo: Send + Sync {
    /// Flip the like for `(article_id, author_id)` and report the new state.
    /// Concurrent calls for the same pair are serialized.
    async fn toggle_like(&self, article_id: Id, author_id: Id) -> RepoResult<LikeState>;
    async fn count_likes(&self, article_id: Id) -> RepoResult<i64>;
    async fn has_liked(&self, article_id: Id, author_id: Id) -> RepoResult<bool>;
}

pub trait Repo: UserRepo + ArticleRepo + CommentRepo + LikeRepo {}

impl<T> Repo for T where T: UserRepo + ArticleRepo + CommentRepo + LikeRepo {}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
    use tracing::{info, warn};

    #[derive(Default, Clone, Serialize, Deserialize)]
    struct State {
        users: HashMap<Id, UserRecord>,
        articles: HashMap<Id, Article>,
        comments: HashMap<Id, Comment>,
        likes: HashMap<Id, Like>,
        next_id: Id,
        last_stamp: Option<DateTime<Utc>>,
    }

    impl State {
        fn next_id(&mut self) -> Id {
            self.next_id += 1;
            self.next_id
        }

        // creation times never go backwards, even if the wall clock does
        fn stamp(&mut self) -> DateTime<Utc> {
            let now = Utc::now();
            let t = match self.last_stamp {
                Some(last) if last > now => last,
                _ => now,
            };
            self.last_stamp = Some(t);
            t
        }

        fn like_of(&self, article_id: Id, author_id: Id) -> Option<Id> {
            self.likes
                .values()
                .find(|l| l.article_id == article_id && l.author_id == author_id)
                .map(|l| l.id)
        }
    }

    /// Whole-state store behind one lock. Every mutation, including the
    /// toggle's check-then-act and the article cascade, runs inside a single
    /// write-lock critical section.
    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Option<Arc<PathBuf>>,
    }

    impl InMemRepo {
        /// Memory only; nothing touches disk.
        pub fn new() -> Self {
            Self { state: Arc::new(RwLock::new(State::default())), snapshot_path: None }
        }

        /// Load `path` if present and rewrite it after every mutation.
        pub fn with_snapshot(path: impl Into<PathBuf>) -> Self {
            let path = path.into();
            let state = Self::load_state_from(&path);
            Self { state: Arc::new(RwLock::new(state)), snapshot_path: Some(Arc::new(path)) }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        info!(path = %path.display(), "loaded snapshot");
                        s
                    }
                    Err(e) => {
                        warn!(path = %path.display(), "failed to parse snapshot: {e}; starting empty");
                        State::default()
                    }
                },
                Err(e) => {
                    info!(path = %path.display(), "no snapshot ({e}); starting empty");
                    State::default()
                }
            }
        }

        /// Run `f` against the state. With a snapshot configured the change is
        /// made on a copy and only kept once the snapshot is on disk, so a
        /// failed write leaves memory exactly as it was.
        fn mutate<T>(&self, f: impl FnOnce(&mut State) -> RepoResult<T>) -> RepoResult<T> {
            let mut guard = self.write()?;
            let Some(path) = self.snapshot_path.as_deref() else { return f(&mut guard) };
            let mut next = guard.clone();
            let out = f(&mut next)?;
            Self::write_snapshot(path, &next)?;
            *guard = next;
            Ok(out)
        }

        // Runs under the write lock so snapshots land in mutation order.
        fn write_snapshot(path: &Path, state: &State) -> RepoResult<()> {
            let fail = |what: &str, e: &dyn std::fmt::Display| {
                metrics::counter!("newsroom_snapshot_failures_total").increment(1);
                warn!(path = %path.display(), "failed to {what} snapshot: {e}");
                RepoError::Internal(format!("snapshot {what} failed: {e}"))
            };
            let bytes = serde_json::to_vec_pretty(state).map_err(|e| fail("serialize", &e))?;
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).map_err(|e| fail("create directory for", &e))?;
            }
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, bytes)
                .and_then(|_| std::fs::rename(&tmp, path))
                .map_err(|e| fail("write", &e))
        }

        fn read(&self) -> RepoResult<RwLockReadGuard<'_, State>> {
            self.state.read().map_err(|_| RepoError::Internal("state lock poisoned".into()))
        }

        fn write(&self) -> RepoResult<RwLockWriteGuard<'_, State>> {
            self.state.write().map_err(|_| RepoError::Internal("state lock poisoned".into()))
        }
    }

    impl Default for InMemRepo {
        fn default() -> Self { Self::new() }
    }

    #[async_trait]
    impl UserRepo for InMemRepo {
        async fn create_user(&self, new: NewUser) -> RepoResult<UserRecord> {
            self.mutate(|s| {
                if s.users.values().any(|u| u.username == new.username) {
                    return Err(RepoError::Conflict);
                }
                let id = s.next_id();
                let created_at = s.stamp();
                let user = UserRecord {
                    id,
                    username: new.username,
                    password_hash: new.password_hash,
                    role: new.role,
                    created_at,
                };
                s.users.insert(id, user.clone());
                Ok(user)
            })
        }

        async fn find_user_by_username(&self, username: &str) -> RepoResult<Option<UserRecord>> {
            let s = self.read()?;
            Ok(s.users.values().find(|u| u.username == username).cloned())
        }

        async fn get_user(&self, id: Id) -> RepoResult<UserRecord> {
            let s = self.read()?;
            s.users.get(&id).cloned().ok_or(RepoError::NotFound)
        }
    }

    #[async_trait]
    impl ArticleRepo for InMemRepo {
        async fn list_articles(&self) -> RepoResult<Vec<Article>> {
            let s = self.read()?;
            let mut v: Vec<_> = s.articles.values().cloned().collect();
            v.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            Ok(v)
        }

        async fn get_article(&self, id: Id) -> RepoResult<Article> {
            let s = self.read()?;
            s.articles.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn create_article(&self, new: NewArticle) -> RepoResult<Article> {
            self.mutate(|s| {
                let id = s.next_id();
                let created_at = s.stamp();
                let article = Article {
                    id,
                    title: new.title,
                    category: new.category,
                    body: new.body,
                    image: new.image,
                    created_at,
                };
                s.articles.insert(id, article.clone());
                Ok(article)
            })
        }

        async fn delete_article(&self, id: Id) -> RepoResult<()> {
            self.mutate(|s| {
                if s.articles.remove(&id).is_none() {
                    return Err(RepoError::NotFound);
                }
                s.comments.retain(|_, c| c.article_id != id);
                s.likes.retain(|_, l| l.article_id != id);
                Ok(())
            })
        }
    }

    #[async_trait]
    impl CommentRepo for InMemRepo {
        async fn add_comment(&self, new: NewComment) -> RepoResult<Comment> {
            self.mutate(|s| {
                if !s.articles.contains_key(&new.article_id) {
                    return Err(RepoError::NotFound);
                }
                if let Some(parent_id) = new.parent_id {
                    let parent = s.comments.get(&parent_id).ok_or(RepoError::NotFound)?;
                    if parent.article_id != new.article_id {
                        return Err(RepoError::InvalidParent);
                    }
                    // the parent's depth is the number of comments above it
                    let mut depth = 0;
                    let mut above = parent.parent_id;
                    while let Some(id) = above {
                        depth += 1;
                        if depth >= MAX_REPLY_DEPTH {
                            return Err(RepoError::ThreadTooDeep);
                        }
                        above = s.comments.get(&id).and_then(|c| c.parent_id);
                    }
                }
                let id = s.next_id();
                let created_at = s.stamp();
                let comment = Comment {
                    id,
                    article_id: new.article_id,
                    author_id: new.author_id,
                    body: new.body,
                    parent_id: new.parent_id,
                    created_at,
                };
                s.comments.insert(id, comment.clone());
                Ok(comment)
            })
        }

        async fn list_comments(&self, article_id: Id) -> RepoResult<Vec<Comment>> {
            let s = self.read()?;
            let mut v: Vec<_> = s.comments.values().filter(|c| c.article_id == article_id).cloned().collect();
            v.sort_by_key(|c| c.id); // ids are handed out in insertion order
            Ok(v)
        }
    }

    #[async_trait]
    impl LikeRepo for InMemRepo {
        async fn toggle_like(&self, article_id: Id, author_id: Id) -> RepoResult<LikeState> {
            self.mutate(|s| {
                if !s.articles.contains_key(&article_id) {
                    return Err(RepoError::NotFound);
                }
                let liked = match s.like_of(article_id, author_id) {
                    Some(existing) => {
                        s.likes.remove(&existing);
                        false
                    }
                    None => {
                        let id = s.next_id();
                        s.likes.insert(id, Like { id, article_id, author_id });
                        true
                    }
                };
                Ok(LikeState { liked })
            })
        }

        async fn count_likes(&self, article_id: Id) -> RepoResult<i64> {
            let s = self.read()?;
            Ok(s.likes.values().filter(|l| l.article_id == article_id).count() as i64)
        }

        async fn has_liked(&self, article_id: Id, author_id: Id) -> RepoResult<bool> {
            let s = self.read()?;
            Ok(s.like_of(article_id, author_id).is_some())
        }
    }
}

#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use sqlx::{Pool, Postgres};

    fn db_err(e: sqlx::Error) -> RepoError {
        match e {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            sqlx::Error::Database(ref d) if d.is_unique_violation() => RepoError::Conflict,
            // an article or parent vanished between the check and the insert
            sqlx::Error::Database(ref d) if d.is_foreign_key_violation() => RepoError::NotFound,
            other => RepoError::Internal(other.to_string()),
        }
    }

    // role is stored as plain text and checked by the table's CHECK constraint
    #[derive(sqlx::FromRow)]
    struct UserRow {
        id: Id,
        username: String,
        password_hash: String,
        role: String,
        created_at: chrono::DateTime<chrono::Utc>,
    }

    impl TryFrom<UserRow> for UserRecord {
        type Error = RepoError;

        fn try_from(r: UserRow) -> Result<Self, Self::Error> {
            Ok(UserRecord {
                id: r.id,
                username: r.username,
                password_hash: r.password_hash,
                role: r.role.parse().map_err(RepoError::Internal)?,
                created_at: r.created_at,
            })
        }
    }

    #[derive(Clone)]
    pub struct PgRepo { pool: Pool<Postgres> }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }

        pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
            sqlx::migrate!("./migrations").run(&self.pool).await
        }
    }

    #[async_trait]
    impl UserRepo for PgRepo {
        async fn create_user(&self, new: NewUser) -> RepoResult<UserRecord> {
            sqlx::query_as::<_, UserRow>(
                "INSERT INTO users (username, password_hash, role) VALUES ($1,$2,$3)
                 RETURNING id, username, password_hash, role, created_at",
            )
            .bind(&new.username)
            .bind(&new.password_hash)
            .bind(new.role.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?
            .try_into()
        }

        async fn find_user_by_username(&self, username: &str) -> RepoResult<Option<UserRecord>> {
            sqlx::query_as::<_, UserRow>(
                "SELECT id, username, password_hash, role, created_at FROM users WHERE username = $1",
            )
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(UserRecord::try_from)
            .transpose()
        }

        async fn get_user(&self, id: Id) -> RepoResult<UserRecord> {
            sqlx::query_as::<_, UserRow>(
                "SELECT id, username, password_hash, role, created_at FROM users WHERE id = $1",
            )
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?
            .try_into()
        }
    }

    #[async_trait]
    impl ArticleRepo for PgRepo {
        async fn list_articles(&self) -> RepoResult<Vec<Article>> {
            sqlx::query_as::<_, Article>(
                "SELECT id, title, category, body, image, created_at FROM articles
                 ORDER BY created_at DESC, id DESC",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
        }

        async fn get_article(&self, id: Id) -> RepoResult<Article> {
            sqlx::query_as::<_, Article>(
                "SELECT id, title, category, body, image, created_at FROM articles WHERE id = $1",
            )
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
        }

        async fn create_article(&self, new: NewArticle) -> RepoResult<Article> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            // inserts queue here, so each one sees the previous row's created_at
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended('articles:created_at', 0))")
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            let article = sqlx::query_as::<_, Article>(
                "INSERT INTO articles (title, category, body, image, created_at)
                 VALUES ($1,$2,$3,$4, GREATEST(clock_timestamp(), COALESCE((SELECT max(created_at) FROM articles), clock_timestamp())))
                 RETURNING id, title, category, body, image, created_at",
            )
            .bind(&new.title)
            .bind(&new.category)
            .bind(&new.body)
            .bind(new.image.as_deref())
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            Ok(article)
        }

        async fn delete_article(&self, id: Id) -> RepoResult<()> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            sqlx::query("DELETE FROM likes WHERE article_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query("DELETE FROM comments WHERE article_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            let res = sqlx::query("DELETE FROM articles WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound); // tx dropped -> rolled back
            }
            tx.commit().await.map_err(db_err)
        }
    }

    #[async_trait]
    impl CommentRepo for PgRepo {
        async fn add_comment(&self, new: NewComment) -> RepoResult<Comment> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            sqlx::query("SELECT 1 FROM articles WHERE id = $1 FOR SHARE")
                .bind(new.article_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
            if let Some(parent_id) = new.parent_id {
                let (parent_article,): (Id,) =
                    sqlx::query_as("SELECT article_id FROM comments WHERE id = $1 FOR SHARE")
                        .bind(parent_id)
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(db_err)?;
                if parent_article != new.article_id {
                    return Err(RepoError::InvalidParent);
                }
                let (depth,): (i64,) = sqlx::query_as(
                    "WITH RECURSIVE chain(parent_id, depth) AS (
                         SELECT parent_id, 0 FROM comments WHERE id = $1
                         UNION ALL
                         SELECT c.parent_id, chain.depth + 1 FROM comments c
                         JOIN chain ON c.id = chain.parent_id
                         WHERE chain.depth < $2
                     )
                     SELECT COALESCE(max(depth), 0)::BIGINT FROM chain",
                )
                .bind(parent_id)
                .bind(MAX_REPLY_DEPTH as i32)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
                if depth >= MAX_REPLY_DEPTH as i64 {
                    return Err(RepoError::ThreadTooDeep);
                }
            }
            let comment = sqlx::query_as::<_, Comment>(
                "INSERT INTO comments (article_id, author_id, body, parent_id) VALUES ($1,$2,$3,$4)
                 RETURNING id, article_id, author_id, body, parent_id, created_at",
            )
            .bind(new.article_id)
            .bind(new.author_id)
            .bind(&new.body)
            .bind(new.parent_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            Ok(comment)
        }

        async fn list_comments(&self, article_id: Id) -> RepoResult<Vec<Comment>> {
            sqlx::query_as::<_, Comment>(
                "SELECT id, article_id, author_id, body, parent_id, created_at FROM comments
                 WHERE article_id = $1 ORDER BY id ASC",
            )
            .bind(article_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
        }
    }

    #[async_trait]
    impl LikeRepo for PgRepo {
        async fn toggle_like(&self, article_id: Id, author_id: Id) -> RepoResult<LikeState> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            // per-pair lock held until commit/rollback
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(format!("like:{article_id}:{author_id}"))
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query("SELECT 1 FROM articles WHERE id = $1 FOR SHARE")
                .bind(article_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
            let removed: Option<(Id,)> =
                sqlx::query_as("DELETE FROM likes WHERE article_id = $1 AND author_id = $2 RETURNING id")
                    .bind(article_id)
                    .bind(author_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_err)?;
            if removed.is_none() {
                sqlx::query("INSERT INTO likes (article_id, author_id) VALUES ($1,$2)")
                    .bind(article_id)
                    .bind(author_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }
            tx.commit().await.map_err(db_err)?;
            Ok(LikeState { liked: removed.is_none() })
        }

        async fn count_likes(&self, article_id: Id) -> RepoResult<i64> {
            let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM likes WHERE article_id = $1")
                .bind(article_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
            Ok(n)
        }

        async fn has_liked(&self, article_id: Id, author_id: Id) -> RepoResult<bool> {
            let (b,): (bool,) =
                sqlx::query_as("SELECT EXISTS(SELECT 1 FROM likes WHERE article_id = $1 AND author_id = $2)")
                    .bind(article_id)
                    .bind(author_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(db_err)?;
            Ok(b)
        }
    }
}
