use std::collections::{BTreeSet, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::classify::EvaluationWindow;
use crate::models::{LocaleKind, OutcomeStatus, PairKey, PairOutcome};

// A pair is complete only within one scope: a new cutoff or newer data
// starts a fresh set of outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunScope {
    pub locale_kind: LocaleKind,
    pub cutoff: NaiveDate,
    pub data_end: NaiveDate,
}

impl RunScope {
    pub fn new(locale_kind: LocaleKind, cutoff: NaiveDate, data_end: NaiveDate) -> Self {
        Self {
            locale_kind,
            cutoff,
            data_end,
        }
    }

    pub fn window(&self) -> EvaluationWindow {
        EvaluationWindow::new(self.cutoff)
    }
}

pub fn latest_scope(
    scopes: impl IntoIterator<Item = RunScope>,
    locale_kind: LocaleKind,
    cutoff: NaiveDate,
) -> Option<RunScope> {
    scopes
        .into_iter()
        .filter(|scope| scope.locale_kind == locale_kind && scope.cutoff == cutoff)
        .max_by_key(|scope| scope.data_end)
}

#[allow(async_fn_in_trait)]
pub trait CompletionStore {
    async fn completed(&self, scope: &RunScope) -> anyhow::Result<HashSet<PairKey>>;

    // False when the key was already recorded for `scope`.
    async fn append(
        &mut self,
        scope: &RunScope,
        run_id: Uuid,
        outcome: &PairOutcome,
    ) -> anyhow::Result<bool>;

    async fn outcomes(&self, scope: &RunScope) -> anyhow::Result<Vec<PairOutcome>>;

    async fn scopes(&self) -> anyhow::Result<Vec<RunScope>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordedOutcome {
    run_id: Uuid,
    scope: RunScope,
    #[serde(flatten)]
    outcome: PairOutcome,
}

#[derive(Debug)]
pub struct JsonlStore {
    path: PathBuf,
    file: File,
    entries: Vec<(RunScope, PairOutcome)>,
    keys: HashSet<(RunScope, PairKey)>,
}

impl JsonlStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = Vec::new();
        let mut keys = HashSet::new();

        let mut torn_tail = false;
        if path.exists() {
            let bytes =
                std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
            torn_tail = bytes.last().is_some_and(|last| *last != b'\n');
            let contents = String::from_utf8_lossy(&bytes);
            for (index, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RecordedOutcome>(line) {
                    Ok(recorded) => {
                        if keys.insert((recorded.scope, recorded.outcome.key.clone())) {
                            entries.push((recorded.scope, recorded.outcome));
                        }
                    }
                    Err(err) => {
                        warn!(path = %path.display(), line = index + 1, %err, "skipping unreadable progress entry");
                    }
                }
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {} for append", path.display()))?;
        if torn_tail {
            // Terminate the partial line so the next entry starts clean.
            file.write_all(b"\n")?;
        }

        Ok(Self {
            path,
            file,
            entries,
            keys,
        })
    }
}

impl CompletionStore for JsonlStore {
    async fn completed(&self, scope: &RunScope) -> anyhow::Result<HashSet<PairKey>> {
        Ok(self
            .keys
            .iter()
            .filter(|(recorded, _)| recorded == scope)
            .map(|(_, key)| key.clone())
            .collect())
    }

    async fn append(
        &mut self,
        scope: &RunScope,
        run_id: Uuid,
        outcome: &PairOutcome,
    ) -> anyhow::Result<bool> {
        let key = (*scope, outcome.key.clone());
        if self.keys.contains(&key) {
            return Ok(false);
        }
        let mut line = serde_json::to_string(&RecordedOutcome {
            run_id,
            scope: *scope,
            outcome: outcome.clone(),
        })?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.flush())
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        self.keys.insert(key);
        self.entries.push((*scope, outcome.clone()));
        Ok(true)
    }

    async fn outcomes(&self, scope: &RunScope) -> anyhow::Result<Vec<PairOutcome>> {
        Ok(self
            .entries
            .iter()
            .filter(|(recorded, _)| recorded == scope)
            .map(|(_, outcome)| outcome.clone())
            .collect())
    }

    async fn scopes(&self) -> anyhow::Result<Vec<RunScope>> {
        let scopes: BTreeSet<RunScope> = self.entries.iter().map(|(scope, _)| *scope).collect();
        Ok(scopes.into_iter().collect())
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CompletionStore for PgStore {
    async fn completed(&self, scope: &RunScope) -> anyhow::Result<HashSet<PairKey>> {
        let rows = sqlx::query(
            r#"
            SELECT entity, locale FROM species_early_warning.alert_outcomes
            WHERE locale_kind = $1 AND cutoff = $2 AND data_end = $3
            "#,
        )
        .bind(scope.locale_kind.to_string())
        .bind(scope.cutoff)
        .bind(scope.data_end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| PairKey::new(row.get::<String, _>("entity"), row.get::<String, _>("locale")))
            .collect())
    }

    async fn append(
        &mut self,
        scope: &RunScope,
        run_id: Uuid,
        outcome: &PairOutcome,
    ) -> anyhow::Result<bool> {
        let terminal_alert = match &outcome.status {
            OutcomeStatus::Modeled { terminal_alert, .. } => Some(*terminal_alert),
            OutcomeStatus::Skipped(_) => None,
        };
        let result = sqlx::query(
            r#"
            INSERT INTO species_early_warning.alert_outcomes
            (locale_kind, cutoff, data_end, entity, locale, run_id, terminal_alert, outcome)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (locale_kind, cutoff, data_end, entity, locale) DO NOTHING
            "#,
        )
        .bind(scope.locale_kind.to_string())
        .bind(scope.cutoff)
        .bind(scope.data_end)
        .bind(&outcome.key.entity)
        .bind(&outcome.key.locale)
        .bind(run_id)
        .bind(terminal_alert)
        .bind(serde_json::to_string(outcome)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn outcomes(&self, scope: &RunScope) -> anyhow::Result<Vec<PairOutcome>> {
        let rows = sqlx::query(
            r#"
            SELECT outcome FROM species_early_warning.alert_outcomes
            WHERE locale_kind = $1 AND cutoff = $2 AND data_end = $3
            ORDER BY entity, locale
            "#,
        )
        .bind(scope.locale_kind.to_string())
        .bind(scope.cutoff)
        .bind(scope.data_end)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let json: String = row.get("outcome");
                serde_json::from_str(&json).context("corrupt outcome row")
            })
            .collect()
    }

    async fn scopes(&self) -> anyhow::Result<Vec<RunScope>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT locale_kind, cutoff, data_end
            FROM species_early_warning.alert_outcomes
            ORDER BY locale_kind, cutoff, data_end
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let kind: String = row.get("locale_kind");
                let locale_kind = match kind.as_str() {
                    "country" => LocaleKind::Country,
                    "language" => LocaleKind::Language,
                    other => anyhow::bail!("unknown locale kind '{other}' in alert_outcomes"),
                };
                Ok(RunScope::new(locale_kind, row.get("cutoff"), row.get("data_end")))
            })
            .collect()
    }
}
