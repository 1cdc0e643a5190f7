//! Database access layer with SQLx and PostgreSQL

use crate::error::{AppError, Result};
use crate::models::{
    ChangeDecision, EfficiencyStats, MetricsCheckRecord, PollCandidate, PollOutcome, PostKey,
    PostMetrics, PostMetricsSnapshot, SnapshotCursor, StorageReport, TierEfficiency,
};
use crate::store::{MetricsStore, PollRequest};
use crate::tiers::{interval_sql, tier_case_sql};
use crate::tracker::{post_age_hours, MetricsChangeTracker};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info};

const CHECK_COLUMNS: &str = r#"
    channel_id, msg_id, last_checked_at, last_changed_at,
    check_count, save_count, stable_since,
    post_age_hours::float8 AS post_age_hours,
    created_at, updated_at
"#;

const SNAPSHOT_COLUMNS: &str = "channel_id, msg_id, snapshot_time, views, forwards, replies, reactions";

/// Database connection pool and operations
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .connect(connection_string)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {}", e)))?;

        info!("Database connection pool established");
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }
}

fn row_to_check_record(row: &PgRow) -> Result<MetricsCheckRecord> {
    Ok(MetricsCheckRecord {
        key: PostKey::new(row.try_get("channel_id")?, row.try_get("msg_id")?),
        last_checked_at: row.try_get("last_checked_at")?,
        last_changed_at: row.try_get("last_changed_at")?,
        check_count: row.try_get("check_count")?,
        save_count: row.try_get("save_count")?,
        stable_since: row.try_get("stable_since")?,
        post_age_hours: row.try_get("post_age_hours")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_snapshot(row: &PgRow) -> Result<PostMetricsSnapshot> {
    Ok(PostMetricsSnapshot::new(
        PostKey::new(row.try_get("channel_id")?, row.try_get("msg_id")?),
        row.try_get("snapshot_time")?,
        PostMetrics::new(
            row.try_get("views")?,
            row.try_get("forwards")?,
            row.try_get("replies")?,
            row.try_get("reactions")?,
        ),
    ))
}

#[async_trait]
impl MetricsStore for Database {
    async fn apply_poll(
        &self,
        request: &PollRequest,
        tracker: &MetricsChangeTracker,
    ) -> Result<PollOutcome> {
        let key = request.key;
        let mut tx = self.pool.begin().await?;

        let posted_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT date FROM posts WHERE channel_id = $1 AND msg_id = $2",
        )
        .bind(key.channel_id)
        .bind(key.msg_id)
        .fetch_optional(&mut *tx)
        .await?;
        let posted_at = posted_at.ok_or_else(|| AppError::NotFound(format!("post {}", key)))?;

        // Make sure the row exists, then lock it for the rest of the poll
        sqlx::query(
            r#"
            INSERT INTO post_metrics_checks (
                channel_id, msg_id, last_checked_at, check_count, save_count,
                created_at, updated_at
            ) VALUES ($1, $2, $3, 0, 0, $3, $3)
            ON CONFLICT (channel_id, msg_id) DO NOTHING
            "#,
        )
        .bind(key.channel_id)
        .bind(key.msg_id)
        .bind(request.observed_at)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM post_metrics_checks WHERE channel_id = $1 AND msg_id = $2 FOR UPDATE",
            CHECK_COLUMNS
        ))
        .bind(key.channel_id)
        .bind(key.msg_id)
        .fetch_one(&mut *tx)
        .await?;
        let existing = row_to_check_record(&row)?;

        let previous = sqlx::query(&format!(
            r#"
            SELECT {} FROM post_metrics
            WHERE channel_id = $1 AND msg_id = $2
            ORDER BY snapshot_time DESC
            LIMIT 1
            "#,
            SNAPSHOT_COLUMNS
        ))
        .bind(key.channel_id)
        .bind(key.msg_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row_to_snapshot(&row))
        .transpose()?;

        let age = post_age_hours(request.posted_at.unwrap_or(posted_at), request.observed_at);
        let (record, decision) = tracker.record_check(
            Some(existing),
            key,
            &request.metrics,
            previous.as_ref().map(|s| &s.metrics),
            request.observed_at,
            Some(age),
        );

        if decision == ChangeDecision::Stale {
            tx.rollback().await?;
            debug!(channel_id = key.channel_id, msg_id = key.msg_id, "Stale poll ignored");
            return Ok(PollOutcome {
                key,
                decision,
                record,
            });
        }

        if decision == ChangeDecision::Save {
            sqlx::query(&format!(
                r#"
                INSERT INTO post_metrics ({})
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (channel_id, msg_id, snapshot_time) DO NOTHING
                "#,
                SNAPSHOT_COLUMNS
            ))
            .bind(key.channel_id)
            .bind(key.msg_id)
            .bind(request.observed_at)
            .bind(request.metrics.views)
            .bind(request.metrics.forwards)
            .bind(request.metrics.replies)
            .bind(request.metrics.reactions)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE post_metrics_checks SET
                last_checked_at = $3,
                last_changed_at = $4,
                check_count = $5,
                save_count = $6,
                stable_since = $7,
                post_age_hours = $8,
                updated_at = $9
            WHERE channel_id = $1 AND msg_id = $2
            "#,
        )
        .bind(key.channel_id)
        .bind(key.msg_id)
        .bind(record.last_checked_at)
        .bind(record.last_changed_at)
        .bind(record.check_count)
        .bind(record.save_count)
        .bind(record.stable_since)
        .bind(record.post_age_hours)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(PollOutcome {
            key,
            decision,
            record,
        })
    }

    async fn due_candidates(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<PollCandidate>> {
        let age = "COALESCE(c.post_age_hours::float8, \
                   GREATEST(EXTRACT(EPOCH FROM ($1 - p.date)) / 3600.0, 0))";
        let interval = tier_case_sql(age, interval_sql);

        let query = format!(
            r#"
            SELECT
                p.channel_id, p.msg_id, p.date AS posted_at,
                c.last_checked_at,
                c.post_age_hours::float8 AS post_age_hours
            FROM posts p
            LEFT JOIN post_metrics_checks c
                ON c.channel_id = p.channel_id AND c.msg_id = p.msg_id
            WHERE c.last_checked_at IS NULL
               OR c.last_checked_at + ({interval}) <= $1
            ORDER BY c.last_checked_at + ({interval}) ASC NULLS FIRST,
                     p.channel_id, p.msg_id
            LIMIT $2
            "#
        );

        let rows = sqlx::query(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(PollCandidate {
                    key: PostKey::new(row.try_get("channel_id")?, row.try_get("msg_id")?),
                    posted_at: row.try_get("posted_at")?,
                    last_checked_at: row.try_get("last_checked_at")?,
                    post_age_hours: row.try_get("post_age_hours")?,
                })
            })
            .collect()
    }

    async fn refresh_post_ages(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE post_metrics_checks c SET
                post_age_hours = ROUND(
                    GREATEST(EXTRACT(EPOCH FROM ($1 - p.date)) / 3600.0, 0)::numeric, 2
                ),
                updated_at = $1
            FROM posts p
            WHERE p.channel_id = c.channel_id AND p.msg_id = c.msg_id
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn check_record(&self, key: PostKey) -> Result<Option<MetricsCheckRecord>> {
        sqlx::query(&format!(
            "SELECT {} FROM post_metrics_checks WHERE channel_id = $1 AND msg_id = $2",
            CHECK_COLUMNS
        ))
        .bind(key.channel_id)
        .bind(key.msg_id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row_to_check_record(&row))
        .transpose()
    }

    async fn latest_snapshot(&self, key: PostKey) -> Result<Option<PostMetricsSnapshot>> {
        sqlx::query(&format!(
            r#"
            SELECT {} FROM post_metrics
            WHERE channel_id = $1 AND msg_id = $2
            ORDER BY snapshot_time DESC
            LIMIT 1
            "#,
            SNAPSHOT_COLUMNS
        ))
        .bind(key.channel_id)
        .bind(key.msg_id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row_to_snapshot(&row))
        .transpose()
    }

    async fn count_snapshots(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM post_metrics")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn snapshot_page(
        &self,
        after: Option<SnapshotCursor>,
        limit: i64,
    ) -> Result<Vec<PostMetricsSnapshot>> {
        let rows = match after {
            Some(cursor) => {
                sqlx::query(&format!(
                    r#"
                    SELECT {} FROM post_metrics
                    WHERE (channel_id, msg_id, snapshot_time) > ($1, $2, $3)
                    ORDER BY channel_id, msg_id, snapshot_time
                    LIMIT $4
                    "#,
                    SNAPSHOT_COLUMNS
                ))
                .bind(cursor.key.channel_id)
                .bind(cursor.key.msg_id)
                .bind(cursor.snapshot_time)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    r#"
                    SELECT {} FROM post_metrics
                    ORDER BY channel_id, msg_id, snapshot_time
                    LIMIT $1
                    "#,
                    SNAPSHOT_COLUMNS
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(row_to_snapshot).collect()
    }

    async fn delete_snapshots(&self, rows: &[SnapshotCursor]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let channel_ids: Vec<i64> = rows.iter().map(|r| r.key.channel_id).collect();
        let msg_ids: Vec<i64> = rows.iter().map(|r| r.key.msg_id).collect();
        let times: Vec<DateTime<Utc>> = rows.iter().map(|r| r.snapshot_time).collect();

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            DELETE FROM post_metrics m
            USING UNNEST($1::bigint[], $2::bigint[], $3::timestamptz[])
                AS d(channel_id, msg_id, snapshot_time)
            WHERE m.channel_id = d.channel_id
              AND m.msg_id = d.msg_id
              AND m.snapshot_time = d.snapshot_time
            "#,
        )
        .bind(&channel_ids)
        .bind(&msg_ids)
        .bind(&times)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }

    async fn efficiency_stats(&self) -> Result<EfficiencyStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*)::bigint AS tracked_posts,
                COALESCE(SUM(check_count), 0)::bigint AS total_checks,
                COALESCE(SUM(save_count), 0)::bigint AS total_saves,
                COUNT(stable_since)::bigint AS stable_posts
            FROM post_metrics_checks
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let mut stats = EfficiencyStats {
            tracked_posts: row.try_get("tracked_posts")?,
            total_checks: row.try_get("total_checks")?,
            total_saves: row.try_get("total_saves")?,
            stable_posts: row.try_get("stable_posts")?,
            ..Default::default()
        };
        stats.compute_ratio();

        let tier = tier_case_sql("COALESCE(post_age_hours, 0)", |t| format!("'{}'", t));
        let rows = sqlx::query(&format!(
            r#"
            SELECT
                {tier} AS tier,
                COUNT(*)::bigint AS posts,
                COALESCE(SUM(check_count), 0)::bigint AS checks,
                COALESCE(SUM(save_count), 0)::bigint AS saves
            FROM post_metrics_checks
            GROUP BY 1
            ORDER BY MIN(COALESCE(post_age_hours, 0))
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        stats.by_tier = rows
            .iter()
            .map(|row| {
                Ok(TierEfficiency {
                    tier: row.try_get("tier")?,
                    posts: row.try_get("posts")?,
                    checks: row.try_get("checks")?,
                    saves: row.try_get("saves")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(stats)
    }

    async fn storage_report(&self) -> Result<StorageReport> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM post_metrics)::bigint AS snapshot_rows,
                (SELECT COUNT(*) FROM post_metrics_checks)::bigint AS tracked_posts,
                (SELECT COALESCE(SUM(check_count - save_count), 0)
                    FROM post_metrics_checks)::bigint AS rows_avoided,
                pg_total_relation_size('post_metrics')::bigint AS post_metrics_bytes,
                pg_total_relation_size('post_metrics_checks')::bigint AS post_metrics_checks_bytes
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let snapshot_rows: i64 = row.try_get("snapshot_rows")?;
        let tracked_posts: i64 = row.try_get("tracked_posts")?;

        Ok(StorageReport {
            snapshot_rows,
            tracked_posts,
            avg_snapshots_per_post: if tracked_posts == 0 {
                0.0
            } else {
                snapshot_rows as f64 / tracked_posts as f64
            },
            rows_avoided: row.try_get("rows_avoided")?,
            post_metrics_bytes: row.try_get("post_metrics_bytes")?,
            post_metrics_checks_bytes: row.try_get("post_metrics_checks_bytes")?,
        })
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}
