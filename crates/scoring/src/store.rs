//! SQLite-backed snapshot store.
//!
//! Holds the entity registry, append-only raw snapshots, pending category
//! suggestions, the score-definition registry and one committed result set
//! per snapshot date. A cycle's results are written in a single transaction:
//! readers see either the whole snapshot date or none of it.
//!
//! Uses `sqlx::query()` runtime queries (not compile-time `query!` macros)
//! since the database schema is created via `sqlx::migrate!`. Structured
//! values (payloads, breakdowns, statistics) are stored as JSON text.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use crate::core::correlation::RedundantPair;
use crate::core::pipeline::{CycleInput, CycleOutput, EntityInput};
use crate::errors::ScoringError;
use crate::types::{
    AlertFlag, AlertTier, Category, CategorySuggestion, CategoryUpdate, CompositeScore,
    CrossSectionalStats, DataQualityEvent, DerivedMetricRecord, Entity, OutlierFlag,
    RawSnapshot, RiskDefinition, ScoreDefinition, SourceKind,
};

/// Summary row of a committed cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub snapshot_ts: i64,
    pub committed_at: i64,
    pub entity_count: u32,
    pub quality_events: Vec<DataQualityEvent>,
    pub redundancies: Vec<RedundantPair>,
    pub outliers: Vec<OutlierFlag>,
}

/// SQLite snapshot store. Single writer per cycle; reads of committed
/// snapshot dates are always consistent.
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    /// Open (or create) the database at `db_path` and run migrations.
    pub async fn new(db_path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(1) // SQLite is single-writer
            .connect(&format!("sqlite:{db_path}?mode=rwc"))
            .await
            .context("failed to connect to SQLite database")?;

        let store = Self::migrate(pool).await?;
        info!(db_path, "snapshot store initialized");
        Ok(store)
    }

    /// Private in-memory database, for tests and dry runs.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        // One connection that never recycles: closing it would drop the data.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("failed to open in-memory SQLite database")?;
        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("failed to run database migrations")?;
        Ok(Self { pool })
    }

    // -----------------------------------------------------------------------
    // Entities
    // -----------------------------------------------------------------------

    /// Create the entity or update its display name. Category is untouched.
    pub async fn upsert_entity(&self, netuid: u32, name: &str) -> Result<()> {
        let now = now_unix();
        sqlx::query(
            "INSERT INTO entities (netuid, name, category, first_seen, updated_at) \
             VALUES (?, ?, NULL, ?, ?) \
             ON CONFLICT(netuid) DO UPDATE SET name = excluded.name, updated_at = excluded.updated_at",
        )
        .bind(netuid)
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        debug!(netuid, name, "entity upserted");
        Ok(())
    }

    pub async fn get_entity(&self, netuid: u32) -> Result<Option<Entity>> {
        let row = sqlx::query("SELECT netuid, name, category FROM entities WHERE netuid = ?")
            .bind(netuid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(entity_from_row))
    }

    pub async fn list_entities(&self) -> Result<Vec<Entity>> {
        let rows = sqlx::query("SELECT netuid, name, category FROM entities ORDER BY netuid")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(entity_from_row).collect())
    }

    /// Apply an enrichment label. Taxonomy labels set the category directly;
    /// anything else is stored as a pending suggestion.
    pub async fn apply_category_label(&self, netuid: u32, label: &str) -> Result<CategoryUpdate> {
        let mut entity = self
            .get_entity(netuid)
            .await?
            .with_context(|| format!("entity {netuid} not found"))?;

        let update = entity.apply_category_label(label, now_unix());
        match &update {
            CategoryUpdate::Assigned(category) => {
                self.set_category(netuid, *category).await?;
            }
            CategoryUpdate::Suggested(suggestion) => {
                sqlx::query(
                    "INSERT INTO category_suggestions (netuid, label, suggested_at) \
                     VALUES (?, ?, ?) ON CONFLICT(netuid, label) DO NOTHING",
                )
                .bind(suggestion.netuid)
                .bind(&suggestion.label)
                .bind(suggestion.suggested_at)
                .execute(&self.pool)
                .await?;
                info!(netuid, label = %suggestion.label, "category suggestion recorded");
            }
        }
        Ok(update)
    }

    async fn set_category(&self, netuid: u32, category: Category) -> Result<()> {
        sqlx::query("UPDATE entities SET category = ?, updated_at = ? WHERE netuid = ?")
            .bind(category.as_str())
            .bind(now_unix())
            .bind(netuid)
            .execute(&self.pool)
            .await?;
        debug!(netuid, category = category.as_str(), "category assigned");
        Ok(())
    }

    pub async fn pending_suggestions(&self) -> Result<Vec<CategorySuggestion>> {
        let rows = sqlx::query(
            "SELECT id, netuid, label, suggested_at, promoted_to FROM category_suggestions \
             WHERE promoted_to IS NULL ORDER BY suggested_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| CategorySuggestion {
                id: Some(r.get("id")),
                netuid: r.get("netuid"),
                label: r.get("label"),
                suggested_at: r.get("suggested_at"),
                promoted_to: r
                    .get::<Option<String>, _>("promoted_to")
                    .and_then(|c| Category::from_label(&c)),
            })
            .collect())
    }

    /// Map a pending suggestion onto an existing category and assign it.
    pub async fn promote_suggestion(&self, suggestion_id: i64, category: Category) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT netuid FROM category_suggestions WHERE id = ?")
            .bind(suggestion_id)
            .fetch_optional(&mut *tx)
            .await?
            .with_context(|| format!("suggestion {suggestion_id} not found"))?;
        let netuid: u32 = row.get("netuid");

        sqlx::query("UPDATE category_suggestions SET promoted_to = ? WHERE id = ?")
            .bind(category.as_str())
            .bind(suggestion_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE entities SET category = ?, updated_at = ? WHERE netuid = ?")
            .bind(category.as_str())
            .bind(now_unix())
            .bind(netuid)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(suggestion_id, netuid, category = category.as_str(), "suggestion promoted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Raw snapshots
    // -----------------------------------------------------------------------

    /// Append a raw snapshot. Per-entity sources create the entity on first
    /// sight with a placeholder name.
    pub async fn append_snapshot(&self, snapshot: &RawSnapshot) -> Result<i64> {
        let payload = serde_json::to_string(&snapshot.payload)?;
        let mut tx = self.pool.begin().await?;

        if let Some(netuid) = snapshot.netuid {
            sqlx::query(
                "INSERT INTO entities (netuid, name, category, first_seen, updated_at) \
                 VALUES (?, ?, NULL, ?, ?) ON CONFLICT(netuid) DO NOTHING",
            )
            .bind(netuid)
            .bind(format!("SN{netuid}"))
            .bind(snapshot.fetched_at)
            .bind(snapshot.fetched_at)
            .execute(&mut *tx)
            .await?;
        }

        let result = sqlx::query(
            "INSERT INTO raw_snapshots (netuid, source, payload, fetched_at) VALUES (?, ?, ?, ?)",
        )
        .bind(snapshot.netuid)
        .bind(snapshot.source.as_str())
        .bind(&payload)
        .bind(snapshot.fetched_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(
            netuid = ?snapshot.netuid,
            source = snapshot.source.as_str(),
            fetched_at = snapshot.fetched_at,
            "raw snapshot appended"
        );
        Ok(result.last_insert_rowid())
    }

    /// Assemble the input of the cycle at `snapshot_ts`: for every entity,
    /// the latest snapshot of each source fetched in
    /// `(snapshot_ts - window_seconds, snapshot_ts]`, plus the latest price
    /// feed in the same window. Entities with no snapshot in the window are
    /// left out of the population.
    pub async fn load_cycle_input(&self, snapshot_ts: i64, window_seconds: i64) -> Result<CycleInput> {
        let since = snapshot_ts - window_seconds;

        let rows = sqlx::query(
            "SELECT r.netuid, r.source, r.payload, r.fetched_at FROM raw_snapshots r \
             JOIN (SELECT netuid, source, MAX(fetched_at) AS latest FROM raw_snapshots \
                   WHERE netuid IS NOT NULL AND fetched_at <= ? AND fetched_at > ? \
                   GROUP BY netuid, source) m \
             ON r.netuid = m.netuid AND r.source = m.source AND r.fetched_at = m.latest \
             ORDER BY r.netuid, r.source, r.id DESC",
        )
        .bind(snapshot_ts)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut latest: BTreeMap<u32, (Option<RawSnapshot>, Option<RawSnapshot>)> = BTreeMap::new();
        for row in &rows {
            let Some(snapshot) = snapshot_from_row(row)? else {
                continue;
            };
            let Some(netuid) = snapshot.netuid else {
                continue;
            };
            let slot = latest.entry(netuid).or_default();
            match snapshot.source {
                SourceKind::Market if slot.0.is_none() => slot.0 = Some(snapshot),
                SourceKind::OnChain if slot.1.is_none() => slot.1 = Some(snapshot),
                _ => {}
            }
        }

        let mut entities = Vec::with_capacity(latest.len());
        for entity in self.list_entities().await? {
            if let Some((market, on_chain)) = latest.remove(&entity.netuid) {
                entities.push(EntityInput {
                    entity,
                    market,
                    on_chain,
                });
            }
        }

        let price_row = sqlx::query(
            "SELECT netuid, source, payload, fetched_at FROM raw_snapshots \
             WHERE netuid IS NULL AND source = ? AND fetched_at <= ? AND fetched_at > ? \
             ORDER BY fetched_at DESC, id DESC LIMIT 1",
        )
        .bind(SourceKind::Price.as_str())
        .bind(snapshot_ts)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;
        let price = match &price_row {
            Some(row) => snapshot_from_row(row)?,
            None => None,
        };

        info!(
            snapshot_ts,
            entities = entities.len(),
            has_price = price.is_some(),
            "cycle input assembled"
        );
        Ok(CycleInput {
            snapshot_ts,
            entities,
            price,
        })
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Record score and risk definitions, failing on a reused version tag
    /// with different content.
    pub async fn register_definitions(
        &self,
        scores: &[ScoreDefinition],
        risk: &RiskDefinition,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        register_in(&mut tx, scores, risk).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Registered definition body for `(name, version)`, if any.
    pub async fn score_definition(&self, name: &str, version: &str) -> Result<Option<ScoreDefinition>> {
        let row = sqlx::query(
            "SELECT definition FROM score_definitions WHERE kind = 'score' AND name = ? AND version = ?",
        )
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| decode_json(&r, "definition")).transpose()
    }

    // -----------------------------------------------------------------------
    // Cycle commit
    // -----------------------------------------------------------------------

    /// Write a cycle's results for its snapshot date as one transaction.
    ///
    /// Any previously committed results for the same date are replaced, so
    /// re-running a cycle is idempotent. On any error nothing is written.
    pub async fn commit_cycle(
        &self,
        output: &CycleOutput,
        scores: &[ScoreDefinition],
        risk: &RiskDefinition,
    ) -> Result<()> {
        let ts = output.snapshot_ts;
        let mut tx = self.pool.begin().await?;

        register_in(&mut tx, scores, risk).await?;

        for table in [
            "derived_metrics",
            "cross_sectional_stats",
            "composite_scores",
            "alert_flags",
            "cycles",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE snapshot_ts = ?"))
                .bind(ts)
                .execute(&mut *tx)
                .await?;
        }

        for record in &output.records {
            sqlx::query("INSERT INTO derived_metrics (snapshot_ts, netuid, record) VALUES (?, ?, ?)")
                .bind(ts)
                .bind(record.netuid)
                .bind(serde_json::to_string(record)?)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("INSERT INTO cross_sectional_stats (snapshot_ts, stats) VALUES (?, ?)")
            .bind(ts)
            .bind(serde_json::to_string(&output.stats)?)
            .execute(&mut *tx)
            .await?;

        for score in &output.scores {
            sqlx::query(
                "INSERT INTO composite_scores \
                 (snapshot_ts, netuid, name, version, value, raw_composite, breakdown) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(ts)
            .bind(score.netuid)
            .bind(&score.name)
            .bind(&score.version)
            .bind(score.value)
            .bind(score.raw_composite)
            .bind(serde_json::to_string(&score.breakdown)?)
            .execute(&mut *tx)
            .await?;
        }

        for alert in &output.alerts {
            sqlx::query(
                "INSERT INTO alert_flags \
                 (snapshot_ts, netuid, name, version, tier, risk_score, contributions) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(ts)
            .bind(alert.netuid)
            .bind(&alert.name)
            .bind(&alert.version)
            .bind(alert.tier.as_str())
            .bind(alert.risk_score)
            .bind(serde_json::to_string(&alert.contributions)?)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO cycles \
             (snapshot_ts, committed_at, entity_count, quality_events, redundancies, outliers) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(ts)
        .bind(now_unix())
        .bind(output.records.len() as i64)
        .bind(serde_json::to_string(&output.quality_events)?)
        .bind(serde_json::to_string(&output.redundancies)?)
        .bind(serde_json::to_string(&output.outliers)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            snapshot_ts = ts,
            records = output.records.len(),
            scores = output.scores.len(),
            alerts = output.alerts.len(),
            "cycle committed"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Presentation queries
    // -----------------------------------------------------------------------

    /// Most recent committed snapshot date.
    pub async fn latest_snapshot_ts(&self) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT MAX(snapshot_ts) AS ts FROM cycles")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<Option<i64>, _>("ts"))
    }

    /// Most recent committed snapshot date at or before `ts`.
    pub async fn snapshot_as_of(&self, ts: i64) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT MAX(snapshot_ts) AS ts FROM cycles WHERE snapshot_ts <= ?")
            .bind(ts)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<Option<i64>, _>("ts"))
    }

    pub async fn cycle_report(&self, snapshot_ts: i64) -> Result<Option<CycleReport>> {
        let row = sqlx::query("SELECT * FROM cycles WHERE snapshot_ts = ?")
            .bind(snapshot_ts)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(CycleReport {
            snapshot_ts,
            committed_at: row.get("committed_at"),
            entity_count: row.get("entity_count"),
            quality_events: decode_json(&row, "quality_events")?,
            redundancies: decode_json(&row, "redundancies")?,
            outliers: decode_json(&row, "outliers")?,
        }))
    }

    pub async fn records_at(&self, snapshot_ts: i64) -> Result<Vec<DerivedMetricRecord>> {
        let rows = sqlx::query("SELECT record FROM derived_metrics WHERE snapshot_ts = ? ORDER BY netuid")
            .bind(snapshot_ts)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| decode_json(r, "record")).collect()
    }

    pub async fn stats_at(&self, snapshot_ts: i64) -> Result<Option<CrossSectionalStats>> {
        let row = sqlx::query("SELECT stats FROM cross_sectional_stats WHERE snapshot_ts = ?")
            .bind(snapshot_ts)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_json(&r, "stats")).transpose()
    }

    /// Scores of one `(name, version)` at a snapshot date, by netuid.
    pub async fn scores_at(
        &self,
        snapshot_ts: i64,
        name: &str,
        version: &str,
    ) -> Result<Vec<CompositeScore>> {
        let rows = sqlx::query(
            "SELECT * FROM composite_scores \
             WHERE snapshot_ts = ? AND name = ? AND version = ? ORDER BY netuid",
        )
        .bind(snapshot_ts)
        .bind(name)
        .bind(version)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                Ok(CompositeScore {
                    netuid: r.get("netuid"),
                    snapshot_ts,
                    name: r.get("name"),
                    version: r.get("version"),
                    value: r.get("value"),
                    raw_composite: r.get("raw_composite"),
                    breakdown: decode_json(r, "breakdown")?,
                })
            })
            .collect()
    }

    pub async fn alerts_at(&self, snapshot_ts: i64) -> Result<Vec<AlertFlag>> {
        let rows = sqlx::query("SELECT * FROM alert_flags WHERE snapshot_ts = ? ORDER BY netuid")
            .bind(snapshot_ts)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| {
                let tier: String = r.get("tier");
                Ok(AlertFlag {
                    netuid: r.get("netuid"),
                    snapshot_ts,
                    name: r.get("name"),
                    version: r.get("version"),
                    tier: AlertTier::from_db(&tier)
                        .with_context(|| format!("unknown alert tier '{tier}'"))?,
                    risk_score: r.get("risk_score"),
                    contributions: decode_json(r, "contributions")?,
                })
            })
            .collect()
    }

    /// Direct access to the underlying pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn entity_from_row(row: &SqliteRow) -> Entity {
    Entity {
        netuid: row.get("netuid"),
        name: row.get("name"),
        category: row
            .get::<Option<String>, _>("category")
            .and_then(|c| Category::from_label(&c)),
    }
}

/// Decode a raw snapshot row. Rows with an unknown source label are skipped.
fn snapshot_from_row(row: &SqliteRow) -> Result<Option<RawSnapshot>> {
    let source: String = row.get("source");
    let Some(source) = SourceKind::from_db(&source) else {
        return Ok(None);
    };
    Ok(Some(RawSnapshot {
        netuid: row.get("netuid"),
        source,
        payload: decode_json(row, "payload")?,
        fetched_at: row.get("fetched_at"),
    }))
}

fn decode_json<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T> {
    let text: String = row.get(column);
    serde_json::from_str(&text).with_context(|| format!("decoding column {column}"))
}

async fn register_in(
    tx: &mut Transaction<'_, Sqlite>,
    scores: &[ScoreDefinition],
    risk: &RiskDefinition,
) -> Result<()> {
    for def in scores {
        register_one(tx, "score", &def.name, &def.version, serde_json::to_string(def)?).await?;
    }
    register_one(tx, "risk", &risk.name, &risk.version, serde_json::to_string(risk)?).await
}

/// Insert a definition body, or verify it matches the one already bound to
/// the tag. Bodies are compared as parsed JSON, not text.
async fn register_one(
    tx: &mut Transaction<'_, Sqlite>,
    kind: &str,
    name: &str,
    version: &str,
    body: String,
) -> Result<()> {
    let existing = sqlx::query(
        "SELECT definition FROM score_definitions WHERE kind = ? AND name = ? AND version = ?",
    )
    .bind(kind)
    .bind(name)
    .bind(version)
    .fetch_optional(&mut **tx)
    .await?;

    match existing {
        Some(row) => {
            let stored: serde_json::Value = decode_json(&row, "definition")?;
            let incoming: serde_json::Value = serde_json::from_str(&body)?;
            if stored != incoming {
                return Err(ScoringError::VersionConflict {
                    name: name.to_string(),
                    version: version.to_string(),
                }
                .into());
            }
        }
        None => {
            sqlx::query(
                "INSERT INTO score_definitions (kind, name, version, definition, registered_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(kind)
            .bind(name)
            .bind(version)
            .bind(&body)
            .bind(now_unix())
            .execute(&mut **tx)
            .await?;
            info!(kind, name, version, "definition registered");
        }
    }
    Ok(())
}
