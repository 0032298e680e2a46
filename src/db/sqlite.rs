use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, error, info};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::{ConnectOptions, Row, Sqlite, Transaction};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::db::memory::require_admin;
use crate::db::{validate_new_poll, VoteBackend};
use crate::error::{VoteError, VoteResult};
use crate::feed::FeedHub;
use crate::identity::VoterIdentity;
use crate::models::{CountChanged, Poll, PollOption, VoteRecord};
use crate::voting::RevoteWindowPolicy;

/// Remote-backed store shared by every session that points at the same database.
pub struct Database {
    pool: SqlitePool,
    policy: RevoteWindowPolicy,
    admin_ids: HashSet<String>,
    feed: FeedHub,
    watcher: Option<JoinHandle<()>>,
}

impl Database {
    /// Open the database at `db_url`.
    ///
    /// For a file database, counts committed by any other connection (another
    /// process included) are picked up every `feed_poll` and published on the
    /// feed. An in-memory database has no other writers, so it is not watched.
    pub async fn connect(
        db_url: &str,
        policy: RevoteWindowPolicy,
        admin_ids: HashSet<String>,
        feed_capacity: usize,
        feed_poll: Duration,
    ) -> VoteResult<Self> {
        let in_memory = db_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database lives and dies with its one connection.
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options.clone())
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options.clone())
                .await?
        };

        Self::init_schema(&pool).await?;
        info!("Connected to vote database at {}", db_url);

        let feed = FeedHub::new(feed_capacity);
        let watcher = if in_memory {
            None
        } else {
            let watcher = CountWatcher::start(&options, feed.clone()).await?;
            Some(tokio::spawn(watcher.run(feed_poll)))
        };

        Ok(Self {
            pool,
            policy,
            admin_ids,
            feed,
            watcher,
        })
    }

    // Takes the write lock before the first read, so a concurrent writer
    // waits out the busy timeout instead of failing on an old snapshot.
    async fn begin_write(&self) -> VoteResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    async fn init_schema(pool: &SqlitePool) -> VoteResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS polls (
                id TEXT PRIMARY KEY,
                question TEXT NOT NULL,
                category TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                ends_at TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS poll_options (
                id TEXT NOT NULL,
                poll_id TEXT NOT NULL,
                text TEXT NOT NULL,
                position INTEGER NOT NULL,
                votes INTEGER NOT NULL DEFAULT 0 CHECK (votes >= 0),
                PRIMARY KEY (poll_id, id),
                FOREIGN KEY (poll_id) REFERENCES polls(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vote_records (
                poll_id TEXT NOT NULL,
                voter_id TEXT NOT NULL,
                option_id TEXT NOT NULL,
                voted_at TEXT NOT NULL,
                PRIMARY KEY (poll_id, voter_id),
                FOREIGN KEY (poll_id) REFERENCES polls(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    // Read the poll's end time, rejecting missing or closed polls
    async fn ensure_open(conn: &mut SqliteConnection, poll_id: &str, at: DateTime<Utc>) -> VoteResult<()> {
        let row = sqlx::query("SELECT ends_at FROM polls WHERE id = ?")
            .bind(poll_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| VoteError::NotFound(format!("poll {}", poll_id)))?;

        let ends_at = parse_timestamp(&row.get::<String, _>("ends_at"))?;
        if at >= ends_at {
            return Err(VoteError::PollClosed { poll_id: poll_id.to_string() });
        }
        Ok(())
    }

    async fn ensure_option(conn: &mut SqliteConnection, poll_id: &str, option_id: &str) -> VoteResult<()> {
        let exists = sqlx::query("SELECT 1 FROM poll_options WHERE id = ? AND poll_id = ?")
            .bind(option_id)
            .bind(poll_id)
            .fetch_optional(&mut *conn)
            .await?
            .is_some();

        if exists {
            Ok(())
        } else {
            Err(VoteError::NotFound(format!("option {} in poll {}", option_id, poll_id)))
        }
    }

    async fn current_count(conn: &mut SqliteConnection, poll_id: &str, option_id: &str) -> VoteResult<CountChanged> {
        let votes: i64 = sqlx::query("SELECT votes FROM poll_options WHERE id = ? AND poll_id = ?")
            .bind(option_id)
            .bind(poll_id)
            .fetch_one(&mut *conn)
            .await?
            .get("votes");

        Ok(CountChanged {
            poll_id: poll_id.to_string(),
            option_id: option_id.to_string(),
            new_count: u64::try_from(votes).unwrap_or(0),
        })
    }

    async fn load_options(&self, poll_id: &str) -> VoteResult<Vec<PollOption>> {
        let options = sqlx::query(
            r#"
            SELECT id, text, votes
            FROM poll_options
            WHERE poll_id = ?
            ORDER BY position
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| PollOption {
            id: row.get::<String, _>("id"),
            text: row.get::<String, _>("text"),
            votes: u64::try_from(row.get::<i64, _>("votes")).unwrap_or(0),
        })
        .collect();

        Ok(options)
    }

    async fn poll_from_row(&self, row: sqlx::sqlite::SqliteRow) -> VoteResult<Poll> {
        let id = row.get::<String, _>("id");
        let question = row.get::<String, _>("question");
        let category = row.get::<String, _>("category");
        let created_by = row.get::<String, _>("created_by");
        let created_at = parse_timestamp(&row.get::<String, _>("created_at"))?;
        let ends_at = parse_timestamp(&row.get::<String, _>("ends_at"))?;
        drop(row);

        let options = self.load_options(&id).await?;
        Ok(Poll::from_parts(id, question, category, created_by, created_at, ends_at, options))
    }
}

#[async_trait]
impl VoteBackend for Database {
    fn feed(&self) -> &FeedHub {
        &self.feed
    }

    async fn create_poll(&self, poll: &Poll) -> VoteResult<()> {
        validate_new_poll(poll)?;
        let mut tx = self.begin_write().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO polls (id, question, category, created_by, created_at, ends_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&poll.id)
        .bind(&poll.question)
        .bind(&poll.category)
        .bind(&poll.created_by)
        .bind(format_timestamp(poll.created_at))
        .bind(format_timestamp(poll.ends_at))
        .execute(&mut *tx)
        .await;

        if let Err(sqlx::Error::Database(db_err)) = &inserted {
            if db_err.is_unique_violation() {
                return Err(VoteError::InvalidPoll(format!("poll {} already exists", poll.id)));
            }
        }
        inserted?;

        for (i, option) in poll.options().iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO poll_options (id, poll_id, text, position, votes)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&option.id)
            .bind(&poll.id)
            .bind(&option.text)
            .bind(i as i64)
            .bind(i64::try_from(option.votes).unwrap_or(i64::MAX))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_polls(&self) -> VoteResult<Vec<Poll>> {
        let rows = sqlx::query(
            r#"
            SELECT id, question, category, created_by, created_at, ends_at
            FROM polls
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut polls = Vec::with_capacity(rows.len());
        for row in rows {
            polls.push(self.poll_from_row(row).await?);
        }
        Ok(polls)
    }

    async fn load_poll(&self, poll_id: &str) -> VoteResult<Poll> {
        let row = sqlx::query(
            r#"
            SELECT id, question, category, created_by, created_at, ends_at
            FROM polls
            WHERE id = ?
            "#,
        )
        .bind(poll_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| VoteError::NotFound(format!("poll {}", poll_id)))?;

        self.poll_from_row(row).await
    }

    async fn find_vote(&self, poll_id: &str, identity: &VoterIdentity) -> VoteResult<Option<VoteRecord>> {
        let Some(voter_id) = identity.voter_id() else {
            return Ok(None);
        };

        let row = sqlx::query(
            r#"
            SELECT poll_id, voter_id, option_id, voted_at
            FROM vote_records
            WHERE poll_id = ? AND voter_id = ?
            "#,
        )
        .bind(poll_id)
        .bind(voter_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(VoteRecord {
                poll_id: row.get::<String, _>("poll_id"),
                voter_id: row.get::<String, _>("voter_id"),
                option_id: row.get::<String, _>("option_id"),
                voted_at: parse_timestamp(&row.get::<String, _>("voted_at"))?,
            })),
            None => Ok(None),
        }
    }

    async fn submit_first_vote(
        &self,
        poll_id: &str,
        option_id: &str,
        identity: &VoterIdentity,
        at: DateTime<Utc>,
    ) -> VoteResult<()> {
        let mut tx = self.begin_write().await?;
        Self::ensure_open(&mut tx, poll_id, at).await?;
        Self::ensure_option(&mut tx, poll_id, option_id).await?;

        if let Some(voter_id) = identity.voter_id() {
            let inserted = sqlx::query(
                r#"
                INSERT INTO vote_records (poll_id, voter_id, option_id, voted_at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(poll_id)
            .bind(voter_id)
            .bind(option_id)
            .bind(format_timestamp(at))
            .execute(&mut *tx)
            .await;

            if let Err(sqlx::Error::Database(db_err)) = &inserted {
                if db_err.is_unique_violation() {
                    return Err(VoteError::DuplicateVote { poll_id: poll_id.to_string() });
                }
            }
            inserted?;
        }

        sqlx::query("UPDATE poll_options SET votes = votes + 1 WHERE id = ? AND poll_id = ?")
            .bind(option_id)
            .bind(poll_id)
            .execute(&mut *tx)
            .await?;

        let event = Self::current_count(&mut tx, poll_id, option_id).await?;
        tx.commit().await?;

        info!("Recorded first vote on poll {} option {}", poll_id, option_id);
        self.feed.publish(event);
        Ok(())
    }

    async fn submit_revote(
        &self,
        poll_id: &str,
        from_option_id: &str,
        to_option_id: &str,
        identity: &VoterIdentity,
        at: DateTime<Utc>,
    ) -> VoteResult<()> {
        let mut tx = self.begin_write().await?;
        Self::ensure_open(&mut tx, poll_id, at).await?;
        Self::ensure_option(&mut tx, poll_id, from_option_id).await?;
        Self::ensure_option(&mut tx, poll_id, to_option_id).await?;

        if let Some(voter_id) = identity.voter_id() {
            let stale = || VoteError::StaleVote {
                poll_id: poll_id.to_string(),
                expected: from_option_id.to_string(),
            };

            let row = sqlx::query("SELECT option_id, voted_at FROM vote_records WHERE poll_id = ? AND voter_id = ?")
                .bind(poll_id)
                .bind(voter_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(stale)?;

            let voted_at = parse_timestamp(&row.get::<String, _>("voted_at"))?;
            if !self.policy.is_open(Some(voted_at), at) {
                return Err(VoteError::DuplicateVote { poll_id: poll_id.to_string() });
            }

            // Conditional on the option still being `from`, so a concurrent move loses cleanly.
            let moved = sqlx::query(
                r#"
                UPDATE vote_records
                SET option_id = ?, voted_at = ?
                WHERE poll_id = ? AND voter_id = ? AND option_id = ?
                "#,
            )
            .bind(to_option_id)
            .bind(format_timestamp(at))
            .bind(poll_id)
            .bind(voter_id)
            .bind(from_option_id)
            .execute(&mut *tx)
            .await?;

            if moved.rows_affected() != 1 {
                return Err(stale());
            }
        }

        if from_option_id == to_option_id {
            tx.commit().await?;
            return Ok(());
        }

        sqlx::query("UPDATE poll_options SET votes = votes - 1 WHERE id = ? AND poll_id = ? AND votes > 0")
            .bind(from_option_id)
            .bind(poll_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE poll_options SET votes = votes + 1 WHERE id = ? AND poll_id = ?")
            .bind(to_option_id)
            .bind(poll_id)
            .execute(&mut *tx)
            .await?;

        let events = [
            Self::current_count(&mut tx, poll_id, from_option_id).await?,
            Self::current_count(&mut tx, poll_id, to_option_id).await?,
        ];
        tx.commit().await?;

        info!(
            "Moved vote on poll {} from {} to {}",
            poll_id, from_option_id, to_option_id
        );
        for event in events {
            self.feed.publish(event);
        }
        Ok(())
    }

    async fn delete_poll(&self, poll_id: &str, identity: &VoterIdentity) -> VoteResult<()> {
        require_admin(&self.admin_ids, identity)?;
        let mut tx = self.begin_write().await?;

        sqlx::query("DELETE FROM vote_records WHERE poll_id = ?")
            .bind(poll_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM poll_options WHERE poll_id = ?")
            .bind(poll_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM polls WHERE id = ?")
            .bind(poll_id)
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(VoteError::NotFound(format!("poll {}", poll_id)));
        }
        tx.commit().await?;
        info!("Deleted poll {}", poll_id);
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Turns commits made through other connections into feed events.
///
/// `PRAGMA data_version` only moves when another connection commits, so an
/// idle database costs one pragma per tick.
struct CountWatcher {
    conn: SqliteConnection,
    feed: FeedHub,
    data_version: i64,
    counts: HashMap<(String, String), i64>,
}

impl CountWatcher {
    async fn start(options: &SqliteConnectOptions, feed: FeedHub) -> VoteResult<Self> {
        let mut conn = options.connect().await?;
        let data_version = data_version(&mut conn).await?;
        let counts = read_counts(&mut conn).await?;
        Ok(Self {
            conn,
            feed,
            data_version,
            counts,
        })
    }

    async fn run(mut self, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.check().await {
                error!("Watching vote counts failed: {}", e);
            }
        }
    }

    async fn check(&mut self) -> VoteResult<()> {
        let version = data_version(&mut self.conn).await?;
        if version == self.data_version {
            return Ok(());
        }
        self.data_version = version;

        let fresh = read_counts(&mut self.conn).await?;
        let mut published = 0;
        for ((poll_id, option_id), votes) in &fresh {
            let key = (poll_id.clone(), option_id.clone());
            if self.counts.get(&key) != Some(votes) {
                self.feed.publish(CountChanged {
                    poll_id: poll_id.clone(),
                    option_id: option_id.clone(),
                    new_count: u64::try_from(*votes).unwrap_or(0),
                });
                published += 1;
            }
        }
        debug!("Database changed, published {} count updates", published);
        self.counts = fresh;
        Ok(())
    }
}

async fn data_version(conn: &mut SqliteConnection) -> VoteResult<i64> {
    let version: i64 = sqlx::query_scalar("PRAGMA data_version")
        .fetch_one(&mut *conn)
        .await?;
    Ok(version)
}

async fn read_counts(conn: &mut SqliteConnection) -> VoteResult<HashMap<(String, String), i64>> {
    let rows = sqlx::query("SELECT poll_id, id, votes FROM poll_options")
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let key = (row.get::<String, _>("poll_id"), row.get::<String, _>("id"));
            (key, row.get::<i64, _>("votes"))
        })
        .collect())
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> VoteResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| VoteError::Corrupt(format!("stored timestamp '{}': {}", raw, e)))
}
