//! Direct Postgres backend. A unit's apply runs in a single transaction.

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info};
use wts_core::{CanonicalTaskRecord, NaturalKey, Unit, UnitNumber};

use crate::rows::{CarRow, TaskRow, UnitRow};
use crate::{
    fetch_paginated, with_retry, ApplyReport, BackoffPolicy, ChangeSet, StoreError, TaskStore,
    DEFAULT_PAGE_SIZE, INSERT_BATCH_SIZE,
};

const TASK_COLUMNS: &str = "unit_number, owner_key, task_key, sort_order, task_number, task_name, \
     description, status, duration_minutes, duration_origin, headcount, phase, phase_origin, \
     completed_by, team, team_origin, completed_at, reference_code, position, scope_delayed, \
     wi_reference, review_flags";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    page_size: usize,
    backoff: BackoffPolicy,
}

fn task_row(row: &PgRow) -> Result<TaskRow, sqlx::Error> {
    Ok(TaskRow {
        unit_number: row.try_get("unit_number")?,
        owner_key: row.try_get("owner_key")?,
        task_key: row.try_get("task_key")?,
        sort_order: row.try_get("sort_order")?,
        task_number: row.try_get("task_number")?,
        task_name: row.try_get("task_name")?,
        description: row.try_get("description")?,
        status: row.try_get("status")?,
        duration_minutes: row.try_get("duration_minutes")?,
        duration_origin: row.try_get("duration_origin")?,
        headcount: row.try_get("headcount")?,
        phase: row.try_get("phase")?,
        phase_origin: row.try_get("phase_origin")?,
        completed_by: row.try_get("completed_by")?,
        team: row.try_get("team")?,
        team_origin: row.try_get("team_origin")?,
        completed_at: row.try_get("completed_at")?,
        reference_code: row.try_get("reference_code")?,
        position: row.try_get("position")?,
        scope_delayed: row.try_get("scope_delayed")?,
        wi_reference: row.try_get("wi_reference")?,
        review_flags: row.try_get("review_flags")?,
    })
}

async fn upsert_unit_in(tx: &mut Transaction<'_, Postgres>, unit: &UnitRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO train_units (unit_number, train_id, train_name, construction_phase)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (unit_number) DO UPDATE
           SET train_id = EXCLUDED.train_id,
               train_name = EXCLUDED.train_name,
               construction_phase = EXCLUDED.construction_phase,
               updated_at = NOW()
        "#,
    )
    .bind(&unit.unit_number)
    .bind(&unit.train_id)
    .bind(&unit.train_name)
    .bind(&unit.construction_phase)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to Postgres")?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            page_size: DEFAULT_PAGE_SIZE,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .context("running task ledger migrations")?;
        info!("task ledger schema is up to date");
        Ok(())
    }

    async fn task_page(
        &self,
        unit_number: Option<&UnitNumber>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CanonicalTaskRecord>, StoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM task_records \
              WHERE ($1::text IS NULL OR unit_number = $1) \
              ORDER BY unit_number, owner_key, task_key, sort_order \
              LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(unit_number.map(ToString::to_string))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| task_row(row).map_err(StoreError::from)?.into_record())
            .collect()
    }

    async fn apply_in_transaction(&self, changes: &ChangeSet) -> Result<ApplyReport, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut report = ApplyReport::default();

        upsert_unit_in(&mut tx, &UnitRow::from_unit(&changes.unit)).await?;
        for car in &changes.cars {
            let row = CarRow::from_car(car);
            sqlx::query(
                r#"
                INSERT INTO cars (unit_number, car_type, car_number)
                VALUES ($1, $2, $3)
                ON CONFLICT (unit_number, car_type) DO UPDATE
                   SET car_number = COALESCE(EXCLUDED.car_number, cars.car_number)
                "#,
            )
            .bind(&row.unit_number)
            .bind(&row.car_type)
            .bind(&row.car_number)
            .execute(&mut *tx)
            .await?;
        }

        for batch in changes.inserts.chunks(INSERT_BATCH_SIZE) {
            let rows = batch
                .iter()
                .map(TaskRow::from_record)
                .collect::<Result<Vec<_>, _>>()?;
            let mut builder =
                QueryBuilder::<Postgres>::new(format!("INSERT INTO task_records ({TASK_COLUMNS}) "));
            builder.push_values(rows, |mut b, row| {
                b.push_bind(row.unit_number)
                    .push_bind(row.owner_key)
                    .push_bind(row.task_key)
                    .push_bind(row.sort_order)
                    .push_bind(row.task_number)
                    .push_bind(row.task_name)
                    .push_bind(row.description)
                    .push_bind(row.status)
                    .push_bind(row.duration_minutes)
                    .push_bind(row.duration_origin)
                    .push_bind(row.headcount)
                    .push_bind(row.phase)
                    .push_bind(row.phase_origin)
                    .push_bind(row.completed_by)
                    .push_bind(row.team)
                    .push_bind(row.team_origin)
                    .push_bind(row.completed_at)
                    .push_bind(row.reference_code)
                    .push_bind(row.position)
                    .push_bind(row.scope_delayed)
                    .push_bind(row.wi_reference)
                    .push_bind(row.review_flags);
            });
            builder.build().execute(&mut *tx).await?;
            report.inserted += batch.len();
        }

        for record in &changes.updates {
            let row = TaskRow::from_record(record)?;
            let result = sqlx::query(
                r#"
                UPDATE task_records
                   SET task_number = $5,
                       task_name = $6,
                       description = $7,
                       status = $8,
                       duration_minutes = $9,
                       duration_origin = $10,
                       headcount = $11,
                       phase = $12,
                       phase_origin = $13,
                       completed_by = $14,
                       team = $15,
                       team_origin = $16,
                       completed_at = $17,
                       reference_code = $18,
                       position = $19,
                       scope_delayed = $20,
                       wi_reference = $21,
                       review_flags = $22
                 WHERE unit_number = $1 AND owner_key = $2 AND task_key = $3 AND sort_order = $4
                "#,
            )
            .bind(row.unit_number)
            .bind(row.owner_key)
            .bind(row.task_key)
            .bind(row.sort_order)
            .bind(row.task_number)
            .bind(row.task_name)
            .bind(row.description)
            .bind(row.status)
            .bind(row.duration_minutes)
            .bind(row.duration_origin)
            .bind(row.headcount)
            .bind(row.phase)
            .bind(row.phase_origin)
            .bind(row.completed_by)
            .bind(row.team)
            .bind(row.team_origin)
            .bind(row.completed_at)
            .bind(row.reference_code)
            .bind(row.position)
            .bind(row.scope_delayed)
            .bind(row.wi_reference)
            .bind(row.review_flags)
            .execute(&mut *tx)
            .await?;
            expect_one_row(result.rows_affected(), "update", &record.natural_key())?;
            report.updated += 1;
        }

        for key in &changes.delete_keys {
            let sort_order = i32::try_from(key.sort_order)
                .map_err(|_| StoreError::Serialization(format!("sort order of {key}")))?;
            let result = sqlx::query(
                r#"
                DELETE FROM task_records
                 WHERE unit_number = $1 AND owner_key = $2 AND task_key = $3 AND sort_order = $4
                "#,
            )
            .bind(key.unit_number.to_string())
            .bind(&key.owner_key)
            .bind(&key.task_name)
            .bind(sort_order)
            .execute(&mut *tx)
            .await?;
            expect_one_row(result.rows_affected(), "delete", key)?;
            report.deleted += 1;
        }

        // Dropping `tx` on any early return rolls the unit back.
        tx.commit().await?;
        debug!(?report, unit = %changes.unit_number(), "committed unit");
        Ok(report)
    }
}

fn expect_one_row(affected: u64, verb: &str, key: &NaturalKey) -> Result<(), StoreError> {
    if affected == 1 {
        Ok(())
    } else {
        Err(StoreError::Conflict(format!(
            "{verb} of {key} touched {affected} rows"
        )))
    }
}

#[async_trait]
impl TaskStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn fetch_unit(&self, unit_number: &UnitNumber) -> Result<Option<Unit>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT unit_number, train_id, train_name, construction_phase
              FROM train_units
             WHERE unit_number = $1
            "#,
        )
        .bind(unit_number.to_string())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        UnitRow {
            unit_number: row.try_get("unit_number")?,
            train_id: row.try_get("train_id")?,
            train_name: row.try_get("train_name")?,
            construction_phase: row.try_get("construction_phase")?,
        }
        .into_unit()
        .map(Some)
    }

    async fn upsert_unit(&self, unit: &Unit) -> Result<(), StoreError> {
        let row = &UnitRow::from_unit(unit);
        let pool = &self.pool;
        with_retry(&self.backoff, "upsert_unit", || async move {
            let mut tx = pool.begin().await?;
            upsert_unit_in(&mut tx, row).await?;
            tx.commit().await?;
            Ok::<(), StoreError>(())
        })
        .await
    }

    async fn fetch_unit_tasks(
        &self,
        unit_number: &UnitNumber,
    ) -> Result<Vec<CanonicalTaskRecord>, StoreError> {
        fetch_paginated(self.page_size, |offset, limit| {
            self.task_page(Some(unit_number), offset, limit)
        })
        .await
    }

    async fn fetch_all_tasks(&self) -> Result<Vec<CanonicalTaskRecord>, StoreError> {
        fetch_paginated(self.page_size, |offset, limit| self.task_page(None, offset, limit)).await
    }

    async fn apply_reconciliation(&self, changes: &ChangeSet) -> Result<ApplyReport, StoreError> {
        with_retry(&self.backoff, "apply_reconciliation", || {
            self.apply_in_transaction(changes)
        })
        .await
    }
}
