//! SQLite database operations
//!
//! All database access goes through this module.
//! Uses SQLx with a WAL-mode pool and embedded migrations.

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

/// Reason recorded on jobs cancelled because their note went away
pub const CANCELLED_REASON: &str = "cancelled";

const JOB_COLUMNS: &str = "id, activity_id, recipient_inbox, payload, attempts, next_attempt_at, \
     state, last_error, claimed_at, created_at, updated_at";

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Actors
    // =========================================================================

    /// Insert or overwrite a cached remote actor keyed by URI.
    pub async fn upsert_actor(&self, actor: &RemoteActor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO actors (
                uri, handle, display_name, inbox_url, shared_inbox_url, public_key_id,
                public_key_pem, summary, icon_url, profile_url, raw_json, fetched_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uri) DO UPDATE SET
                handle = excluded.handle,
                display_name = excluded.display_name,
                inbox_url = excluded.inbox_url,
                shared_inbox_url = excluded.shared_inbox_url,
                public_key_id = excluded.public_key_id,
                public_key_pem = excluded.public_key_pem,
                summary = excluded.summary,
                icon_url = excluded.icon_url,
                profile_url = excluded.profile_url,
                raw_json = excluded.raw_json,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(&actor.uri)
        .bind(&actor.handle)
        .bind(&actor.display_name)
        .bind(&actor.inbox_url)
        .bind(&actor.shared_inbox_url)
        .bind(&actor.public_key_id)
        .bind(&actor.public_key_pem)
        .bind(&actor.summary)
        .bind(&actor.icon_url)
        .bind(&actor.profile_url)
        .bind(&actor.raw_json)
        .bind(actor.fetched_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a cached actor by URI
    pub async fn get_actor(&self, uri: &str) -> Result<Option<RemoteActor>, AppError> {
        let actor = sqlx::query_as::<_, RemoteActor>("SELECT * FROM actors WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    // =========================================================================
    // Notes
    // =========================================================================

    pub async fn insert_note(&self, note: &Note) -> Result<(), AppError> {
        sqlx::query("INSERT INTO notes (id, content, federated_id, created_at) VALUES (?, ?, ?, ?)")
            .bind(&note.id)
            .bind(&note.content)
            .bind(&note.federated_id)
            .bind(note.created_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn get_note(&self, id: &str) -> Result<Option<Note>, AppError> {
        let note = sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(note)
    }

    /// Record the object URI a note was published under.
    ///
    /// Only sets it once; the unique index rejects reuse across notes.
    pub async fn set_note_federated_id(&self, id: &str, federated_id: &str) -> Result<bool, AppError> {
        let result =
            sqlx::query("UPDATE notes SET federated_id = ? WHERE id = ? AND federated_id IS NULL")
                .bind(federated_id)
                .bind(id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_note(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM notes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count_notes(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM notes")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // =========================================================================
    // Follow relations
    // =========================================================================

    /// Insert a follow relation. Returns false when the pair already exists.
    ///
    /// An existing pair keeps its `created_at` but takes the newer Follow id,
    /// so a later Undo of that Follow still matches.
    pub async fn insert_follow_relation(&self, relation: &FollowRelation) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO follow_relations (follower_uri, target_uri, follow_activity_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&relation.follower_uri)
        .bind(&relation.target_uri)
        .bind(&relation.follow_activity_id)
        .bind(relation.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        if relation.follow_activity_id.is_some() {
            sqlx::query(
                "UPDATE follow_relations SET follow_activity_id = ? WHERE follower_uri = ? AND target_uri = ?",
            )
            .bind(&relation.follow_activity_id)
            .bind(&relation.follower_uri)
            .bind(&relation.target_uri)
            .execute(&self.pool)
            .await?;
        }

        Ok(false)
    }

    pub async fn follow_relation_exists(
        &self,
        follower_uri: &str,
        target_uri: &str,
    ) -> Result<bool, AppError> {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT EXISTS(SELECT 1 FROM follow_relations WHERE follower_uri = ? AND target_uri = ?)",
        )
        .bind(follower_uri)
        .bind(target_uri)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists != 0)
    }

    /// Remove a follow relation.
    ///
    /// When `follow_activity_id` is given, only a relation created by that
    /// Follow (or one with no recorded Follow id) is removed.
    pub async fn delete_follow_relation(
        &self,
        follower_uri: &str,
        target_uri: &str,
        follow_activity_id: Option<&str>,
    ) -> Result<bool, AppError> {
        let result = match follow_activity_id {
            Some(activity_id) => {
                sqlx::query(
                    r#"
                    DELETE FROM follow_relations
                    WHERE follower_uri = ? AND target_uri = ?
                      AND (follow_activity_id IS NULL OR follow_activity_id = ?)
                    "#,
                )
                .bind(follower_uri)
                .bind(target_uri)
                .bind(activity_id)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "DELETE FROM follow_relations WHERE follower_uri = ? AND target_uri = ?",
                )
                .bind(follower_uri)
                .bind(target_uri)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() > 0)
    }

    /// Current followers of `target_uri`, oldest first
    pub async fn followers_of(&self, target_uri: &str) -> Result<Vec<FollowRelation>, AppError> {
        let relations = sqlx::query_as::<_, FollowRelation>(
            "SELECT * FROM follow_relations WHERE target_uri = ? ORDER BY created_at ASC",
        )
        .bind(target_uri)
        .fetch_all(&self.pool)
        .await?;

        Ok(relations)
    }

    pub async fn count_followers(&self, target_uri: &str) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM follow_relations WHERE target_uri = ?")
                .bind(target_uri)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // =========================================================================
    // Shares
    // =========================================================================

    /// Record an Announce. Returns false when the activity was already recorded.
    pub async fn insert_share(&self, share: &Share) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO shares (activity_id, sharer_uri, object_uri, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&share.activity_id)
        .bind(&share.sharer_uri)
        .bind(&share.object_uri)
        .bind(share.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn shares_of(&self, object_uri: &str) -> Result<Vec<Share>, AppError> {
        let shares = sqlx::query_as::<_, Share>(
            "SELECT * FROM shares WHERE object_uri = ? ORDER BY created_at ASC",
        )
        .bind(object_uri)
        .fetch_all(&self.pool)
        .await?;

        Ok(shares)
    }

    // =========================================================================
    // Inbox dedup ledger
    // =========================================================================

    /// Atomically claim an activity id for processing.
    ///
    /// Returns false if the id is already in the ledger, in which case the
    /// caller must treat the activity as a replay.
    pub async fn reserve_inbox_item(&self, item: &InboxItem) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO inbox_items (activity_id, activity_type, actor_uri, received_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&item.activity_id)
        .bind(&item.activity_type)
        .bind(&item.actor_uri)
        .bind(item.received_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Drop a reservation whose dispatch failed so a redelivery is processed.
    pub async fn release_inbox_item(&self, activity_id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM inbox_items WHERE activity_id = ?")
            .bind(activity_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn inbox_item_exists(&self, activity_id: &str) -> Result<bool, AppError> {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT EXISTS(SELECT 1 FROM inbox_items WHERE activity_id = ?)",
        )
        .bind(activity_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists != 0)
    }

    // =========================================================================
    // Delivery jobs
    // =========================================================================

    /// Create pending jobs, all due at `now_ms`, in one transaction.
    pub async fn enqueue_jobs(
        &self,
        jobs: &[NewDeliveryJob],
        now_ms: i64,
    ) -> Result<Vec<String>, AppError> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(jobs.len());

        for job in jobs {
            let id = EntityId::new().0;
            sqlx::query(
                r#"
                INSERT INTO delivery_jobs (
                    id, activity_id, recipient_inbox, payload, attempts,
                    next_attempt_at, state, created_at, updated_at
                ) VALUES (?, ?, ?, ?, 0, ?, 'pending', ?, ?)
                "#,
            )
            .bind(&id)
            .bind(&job.activity_id)
            .bind(&job.recipient_inbox)
            .bind(&job.payload)
            .bind(now_ms)
            .bind(now_ms)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
            ids.push(id);
        }

        tx.commit().await?;
        Ok(ids)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<DeliveryJob>, AppError> {
        let job = sqlx::query_as::<_, DeliveryJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM delivery_jobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Claim up to `limit` pending jobs whose `next_attempt_at` has elapsed.
    ///
    /// Uses an IMMEDIATE transaction so selection and claim are atomic; each
    /// row is still moved with a state-guarded update.
    pub async fn claim_due_jobs(&self, now_ms: i64, limit: u32) -> Result<Vec<DeliveryJob>, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<Vec<DeliveryJob>, AppError> = async {
            let due = sqlx::query_as::<_, DeliveryJob>(&format!(
                r#"
                SELECT {JOB_COLUMNS} FROM delivery_jobs
                WHERE state = 'pending' AND next_attempt_at <= ?
                ORDER BY next_attempt_at ASC, id ASC
                LIMIT ?
                "#
            ))
            .bind(now_ms)
            .bind(i64::from(limit))
            .fetch_all(&mut *conn)
            .await?;

            let mut claimed = Vec::with_capacity(due.len());
            for mut job in due {
                let updated = sqlx::query(
                    "UPDATE delivery_jobs SET state = 'in_flight', claimed_at = ?, updated_at = ? WHERE id = ? AND state = 'pending'",
                )
                .bind(now_ms)
                .bind(now_ms)
                .bind(&job.id)
                .execute(&mut *conn)
                .await?;

                if updated.rows_affected() > 0 {
                    job.state = JobState::InFlight;
                    job.claimed_at = Some(now_ms);
                    job.updated_at = now_ms;
                    claimed.push(job);
                }
            }

            Ok(claimed)
        }
        .await;

        match result {
            Ok(claimed) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(claimed)
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    /// Whether a job is still claimed (not cancelled or finished meanwhile).
    pub async fn job_is_in_flight(&self, id: &str) -> Result<bool, AppError> {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT EXISTS(SELECT 1 FROM delivery_jobs WHERE id = ? AND state = 'in_flight')",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists != 0)
    }

    /// in_flight -> succeeded
    pub async fn mark_job_succeeded(&self, id: &str, attempts: i64, now_ms: i64) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET state = 'succeeded', attempts = ?, last_error = NULL, updated_at = ?
            WHERE id = ? AND state = 'in_flight'
            "#,
        )
        .bind(attempts)
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// in_flight -> pending with a later due time
    pub async fn reschedule_job(
        &self,
        id: &str,
        attempts: i64,
        next_attempt_at: i64,
        error: &str,
        now_ms: i64,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET state = 'pending', attempts = ?, next_attempt_at = ?, last_error = ?,
                claimed_at = NULL, updated_at = ?
            WHERE id = ? AND state = 'in_flight'
            "#,
        )
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(error)
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// in_flight -> dead
    pub async fn mark_job_dead(
        &self,
        id: &str,
        attempts: i64,
        error: &str,
        now_ms: i64,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET state = 'dead', attempts = ?, last_error = ?, updated_at = ?
            WHERE id = ? AND state = 'in_flight'
            "#,
        )
        .bind(attempts)
        .bind(error)
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Restart sweep: every in_flight job left by a previous process
    /// becomes pending and due immediately.
    pub async fn reset_in_flight_jobs(&self, now_ms: i64) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET state = 'pending', claimed_at = NULL, next_attempt_at = MIN(next_attempt_at, ?),
                updated_at = ?
            WHERE state = 'in_flight'
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Return jobs claimed at or before `claimed_before_ms` to pending.
    ///
    /// Covers claims whose result was never recorded while the process kept
    /// running.
    pub async fn reset_stale_in_flight_jobs(
        &self,
        claimed_before_ms: i64,
        now_ms: i64,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET state = 'pending', claimed_at = NULL, next_attempt_at = MIN(next_attempt_at, ?),
                updated_at = ?
            WHERE state = 'in_flight' AND claimed_at <= ?
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(claimed_before_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Mark all unfinished jobs of an activity dead with reason `cancelled`.
    pub async fn cancel_jobs_for_activity(&self, activity_id: &str, now_ms: i64) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET state = 'dead', last_error = ?, updated_at = ?
            WHERE activity_id = ? AND state IN ('pending', 'in_flight')
            "#,
        )
        .bind(CANCELLED_REASON)
        .bind(now_ms)
        .bind(activity_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// List jobs, newest first, optionally filtered by state
    pub async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: u32,
    ) -> Result<Vec<DeliveryJob>, AppError> {
        let jobs = match state {
            Some(state) => {
                sqlx::query_as::<_, DeliveryJob>(&format!(
                    "SELECT {JOB_COLUMNS} FROM delivery_jobs WHERE state = ? ORDER BY updated_at DESC, id DESC LIMIT ?"
                ))
                .bind(state)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, DeliveryJob>(&format!(
                    "SELECT {JOB_COLUMNS} FROM delivery_jobs ORDER BY updated_at DESC, id DESC LIMIT ?"
                ))
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(jobs)
    }

    pub async fn jobs_for_activity(&self, activity_id: &str) -> Result<Vec<DeliveryJob>, AppError> {
        let jobs = sqlx::query_as::<_, DeliveryJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM delivery_jobs WHERE activity_id = ? ORDER BY created_at ASC, id ASC"
        ))
        .bind(activity_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Number of jobs in each state; states with no jobs are reported as 0.
    pub async fn count_jobs_by_state(&self) -> Result<Vec<(JobState, i64)>, AppError> {
        let rows = sqlx::query_as::<_, (JobState, i64)>(
            "SELECT state, COUNT(*) FROM delivery_jobs GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(JobState::ALL
            .iter()
            .map(|state| {
                let count = rows
                    .iter()
                    .find(|(row_state, _)| row_state == state)
                    .map(|(_, count)| *count)
                    .unwrap_or(0);
                (*state, count)
            })
            .collect())
    }
}

/// Current time in unix milliseconds, the unit used by delivery jobs.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
