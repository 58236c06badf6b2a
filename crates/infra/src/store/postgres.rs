//! Postgres-backed farm-operations store.
//!
//! Mirrors the [`crate::FarmOps`] contract as inherent async methods. Each
//! mutating operation runs inside one transaction; the settlement and step
//! paths take row locks (`SELECT ... FOR UPDATE`) with a short
//! `lock_timeout`, so a concurrent settle on the same worker either waits
//! briefly or surfaces as [`StoreError::Busy`] for the caller to retry.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use tanibuku_core::{
    ActivityId, DomainError, FarmId, MasterStepId, Money, PeriodId, RecordId, StepId, UserId,
    WorkerId,
};
use tanibuku_ledger::{
    plan_settlement, summarize, AccrualId, KasbonAdvance, KasbonId, KasbonStatus, PaymentId,
    Settlement, SettlementId, WageAccrual, WorkerBalance,
};
use tanibuku_periods::{Expense, ExpenseId, Income, IncomeId, Period, PeriodStatus};
use tanibuku_steps::{
    FarmActivity, FarmingStep, StepAction, StepActivityLog, StepStatus,
};

use crate::ops::{
    LedgerScope, NewCashPayment, NewKasbonAdvance, NewWageAccrual, SettleRequest,
};

/// Errors from the Postgres store: domain rejections pass through typed,
/// infrastructure failures are wrapped with the failing operation name.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("database failure during {op}")]
    Database {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// A row lock could not be acquired in time; safe to retry.
    #[error("store busy during {op}, retry")]
    Busy { op: &'static str },
}

pub type StoreResult<T> = Result<T, StoreError>;

fn map_sqlx_error(op: &'static str, source: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &source {
        // 55P03: lock_not_available (lock_timeout expired).
        if db.code().as_deref() == Some("55P03") {
            return StoreError::Busy { op };
        }
    }
    StoreError::Database { op, source }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS farms (
        id uuid PRIMARY KEY,
        name text NOT NULL,
        active_period_id uuid
    )",
    "CREATE TABLE IF NOT EXISTS workers (
        id uuid PRIMARY KEY,
        name text NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS farm_workers (
        farm_id uuid NOT NULL,
        worker_id uuid NOT NULL,
        PRIMARY KEY (farm_id, worker_id)
    )",
    "CREATE TABLE IF NOT EXISTS periods (
        id uuid PRIMARY KEY,
        farm_id uuid NOT NULL,
        name text NOT NULL,
        opening_balance bigint NOT NULL,
        closing_balance bigint,
        status text NOT NULL,
        started_on date NOT NULL,
        ended_on date
    )",
    "CREATE TABLE IF NOT EXISTS farming_steps (
        id uuid PRIMARY KEY,
        farm_id uuid NOT NULL,
        period_id uuid NOT NULL,
        master_step_id uuid NOT NULL,
        status text NOT NULL,
        started_at timestamptz,
        finished_at timestamptz
    )",
    "CREATE TABLE IF NOT EXISTS farm_activities (
        id uuid PRIMARY KEY,
        farm_id uuid NOT NULL,
        step_id uuid NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS wage_accruals (
        id uuid PRIMARY KEY,
        worker_id uuid NOT NULL,
        activity_id uuid NOT NULL,
        amount bigint NOT NULL,
        earned_on date NOT NULL,
        paid boolean NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS kasbon_advances (
        id uuid PRIMARY KEY,
        worker_id uuid NOT NULL,
        activity_id uuid NOT NULL,
        amount bigint NOT NULL,
        amount_repaid bigint NOT NULL,
        issued_on date NOT NULL,
        status text NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS cash_payments (
        id uuid PRIMARY KEY,
        worker_id uuid NOT NULL,
        activity_id uuid NOT NULL,
        amount bigint NOT NULL,
        paid_on date NOT NULL,
        kind text NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS settlements (
        id uuid PRIMARY KEY,
        worker_id uuid NOT NULL,
        farm_id uuid NOT NULL,
        total_earnings bigint NOT NULL,
        total_kasbon bigint NOT NULL,
        cash_paid bigint NOT NULL,
        settled_on date NOT NULL,
        notes text
    )",
    "CREATE TABLE IF NOT EXISTS step_activity_logs (
        id uuid PRIMARY KEY,
        step_id uuid NOT NULL,
        action text NOT NULL,
        description text NOT NULL,
        actor_id uuid,
        at timestamptz NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS incomes (
        id uuid PRIMARY KEY,
        period_id uuid NOT NULL,
        total_amount bigint NOT NULL,
        received_on date NOT NULL,
        description text
    )",
    "CREATE TABLE IF NOT EXISTS expenses (
        id uuid PRIMARY KEY,
        period_id uuid NOT NULL,
        activity_id uuid,
        amount bigint NOT NULL,
        spent_on date NOT NULL,
        description text
    )",
];

/// Farm-operations store on a Postgres pool.
#[derive(Debug, Clone)]
pub struct PostgresFarmStore {
    pool: PgPool,
}

impl PostgresFarmStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the tables if they do not exist yet.
    #[instrument(skip(self))]
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for ddl in SCHEMA {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    // ---- registry & period setup ----

    #[instrument(skip(self, name))]
    pub async fn register_farm(&self, name: &str) -> StoreResult<FarmId> {
        let id = FarmId::new();
        sqlx::query("INSERT INTO farms (id, name, active_period_id) VALUES ($1, $2, NULL)")
            .bind(*id.as_uuid())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("register_farm", e))?;
        Ok(id)
    }

    #[instrument(skip(self, name), fields(%farm_id))]
    pub async fn register_worker(&self, farm_id: FarmId, name: &str) -> StoreResult<WorkerId> {
        const OP: &str = "register_worker";
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(OP, e))?;

        let farm_exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM farms WHERE id = $1)")
                .bind(*farm_id.as_uuid())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error(OP, e))?;
        if !farm_exists {
            return Err(DomainError::not_found("farm").into());
        }

        let id = WorkerId::new();
        sqlx::query("INSERT INTO workers (id, name) VALUES ($1, $2)")
            .bind(*id.as_uuid())
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(OP, e))?;
        sqlx::query("INSERT INTO farm_workers (farm_id, worker_id) VALUES ($1, $2)")
            .bind(*farm_id.as_uuid())
            .bind(*id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(OP, e))?;
        tx.commit().await.map_err(|e| map_sqlx_error(OP, e))?;
        Ok(id)
    }

    /// Open a period and seed one draft step (with activity) per master step.
    #[instrument(skip(self, name, master_steps), fields(%farm_id))]
    pub async fn open_period(
        &self,
        farm_id: FarmId,
        name: &str,
        opening_balance: Money,
        started_on: NaiveDate,
        master_steps: &[MasterStepId],
    ) -> StoreResult<PeriodId> {
        const OP: &str = "open_period";
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(OP, e))?;
        set_lock_timeout(&mut tx, OP).await?;

        let row = sqlx::query("SELECT active_period_id FROM farms WHERE id = $1 FOR UPDATE")
            .bind(*farm_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(OP, e))?
            .ok_or_else(|| DomainError::not_found("farm"))?;
        let active: Option<Uuid> = row.try_get("active_period_id").map_err(|e| map_sqlx_error(OP, e))?;
        if active.is_some() {
            return Err(DomainError::conflict("farm already has an active period").into());
        }

        let period = Period::open(farm_id, name, opening_balance, started_on);
        sqlx::query(
            "INSERT INTO periods (id, farm_id, name, opening_balance, closing_balance, status, started_on, ended_on)
             VALUES ($1, $2, $3, $4, NULL, $5, $6, NULL)",
        )
        .bind(*period.id.as_uuid())
        .bind(*farm_id.as_uuid())
        .bind(&period.name)
        .bind(period.opening_balance.minor())
        .bind("active")
        .bind(period.started_on)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(OP, e))?;

        for master in master_steps {
            let step = FarmingStep::draft(farm_id, period.id, *master);
            let activity = FarmActivity::for_step(&step);
            sqlx::query(
                "INSERT INTO farming_steps (id, farm_id, period_id, master_step_id, status, started_at, finished_at)
                 VALUES ($1, $2, $3, $4, $5, NULL, NULL)",
            )
            .bind(*step.id.as_uuid())
            .bind(*farm_id.as_uuid())
            .bind(*period.id.as_uuid())
            .bind(*master.as_uuid())
            .bind(step.status.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(OP, e))?;
            sqlx::query("INSERT INTO farm_activities (id, farm_id, step_id) VALUES ($1, $2, $3)")
                .bind(*activity.id.as_uuid())
                .bind(*farm_id.as_uuid())
                .bind(*step.id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error(OP, e))?;
        }

        sqlx::query("UPDATE farms SET active_period_id = $2 WHERE id = $1")
            .bind(*farm_id.as_uuid())
            .bind(*period.id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(OP, e))?;
        tx.commit().await.map_err(|e| map_sqlx_error(OP, e))?;
        info!(%farm_id, period_id = %period.id, steps = master_steps.len(), "period opened");
        Ok(period.id)
    }

    #[instrument(skip(self, description), fields(%period_id))]
    pub async fn record_income(
        &self,
        period_id: PeriodId,
        total_amount: Money,
        received_on: NaiveDate,
        description: Option<String>,
    ) -> StoreResult<IncomeId> {
        const OP: &str = "record_income";
        self.ensure_period_active(period_id, OP).await?;

        let income = Income::new(period_id, total_amount, received_on, description)?;
        sqlx::query(
            "INSERT INTO incomes (id, period_id, total_amount, received_on, description)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(*income.id.0.as_uuid())
        .bind(*period_id.as_uuid())
        .bind(income.total_amount.minor())
        .bind(income.received_on)
        .bind(&income.description)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(OP, e))?;
        Ok(income.id)
    }

    #[instrument(skip(self, description), fields(%period_id))]
    pub async fn record_expense(
        &self,
        period_id: PeriodId,
        activity_id: Option<ActivityId>,
        amount: Money,
        spent_on: NaiveDate,
        description: Option<String>,
    ) -> StoreResult<ExpenseId> {
        const OP: &str = "record_expense";
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(OP, e))?;

        let farm_id = self.period_farm_if_active(&mut tx, period_id, OP).await?;

        let mut log = None;
        if let Some(activity_id) = activity_id {
            let (activity_farm, step) = self.activity_step(&mut tx, activity_id, OP).await?;
            if activity_farm != farm_id {
                return Err(DomainError::validation(
                    "activity does not belong to the period's farm",
                )
                .into());
            }
            step.ensure_mutable()?;
            log = Some(StepActivityLog::event(
                step.id,
                "expense",
                "Cost added to step.",
                None,
                Utc::now(),
            ));
        }

        let expense = Expense::new(period_id, activity_id, amount, spent_on, description)?;
        sqlx::query(
            "INSERT INTO expenses (id, period_id, activity_id, amount, spent_on, description)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(*expense.id.0.as_uuid())
        .bind(*period_id.as_uuid())
        .bind(expense.activity_id.map(|a| *a.as_uuid()))
        .bind(expense.amount.minor())
        .bind(expense.spent_on)
        .bind(&expense.description)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(OP, e))?;
        if let Some(log) = log {
            insert_log(&mut tx, &log, OP).await?;
        }
        tx.commit().await.map_err(|e| map_sqlx_error(OP, e))?;
        Ok(expense.id)
    }

    // ---- ledger writes ----

    #[instrument(skip(self, input), fields(worker = %input.worker_id))]
    pub async fn record_wage_accrual(&self, input: NewWageAccrual) -> StoreResult<AccrualId> {
        const OP: &str = "record_wage_accrual";
        self.check_ledger_target(input.worker_id, input.activity_id, OP)
            .await?;

        let accrual = WageAccrual::new(
            input.worker_id,
            input.activity_id,
            input.amount,
            input.earned_on,
        )?;
        sqlx::query(
            "INSERT INTO wage_accruals (id, worker_id, activity_id, amount, earned_on, paid)
             VALUES ($1, $2, $3, $4, $5, FALSE)",
        )
        .bind(*accrual.id.0.as_uuid())
        .bind(*accrual.worker_id.as_uuid())
        .bind(*accrual.activity_id.as_uuid())
        .bind(accrual.amount.minor())
        .bind(accrual.earned_on)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(OP, e))?;
        info!(worker = %input.worker_id, amount = %input.amount, "wage accrual recorded");
        Ok(accrual.id)
    }

    #[instrument(skip(self, input), fields(worker = %input.worker_id))]
    pub async fn record_kasbon_advance(&self, input: NewKasbonAdvance) -> StoreResult<KasbonId> {
        const OP: &str = "record_kasbon_advance";
        self.check_ledger_target(input.worker_id, input.activity_id, OP)
            .await?;

        let advance = KasbonAdvance::new(
            input.worker_id,
            input.activity_id,
            input.amount,
            input.issued_on,
        )?;
        sqlx::query(
            "INSERT INTO kasbon_advances (id, worker_id, activity_id, amount, amount_repaid, issued_on, status)
             VALUES ($1, $2, $3, $4, 0, $5, 'open')",
        )
        .bind(*advance.id.0.as_uuid())
        .bind(*advance.worker_id.as_uuid())
        .bind(*advance.activity_id.as_uuid())
        .bind(advance.amount.minor())
        .bind(advance.issued_on)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(OP, e))?;
        info!(worker = %input.worker_id, amount = %input.amount, "kasbon advance recorded");
        Ok(advance.id)
    }

    #[instrument(skip(self, input), fields(worker = %input.worker_id))]
    pub async fn record_cash_payment(&self, input: NewCashPayment) -> StoreResult<PaymentId> {
        const OP: &str = "record_cash_payment";
        self.check_ledger_target(input.worker_id, input.activity_id, OP)
            .await?;

        let payment = tanibuku_ledger::CashPayment::new(
            input.worker_id,
            input.activity_id,
            input.amount,
            input.paid_on,
        )?;
        sqlx::query(
            "INSERT INTO cash_payments (id, worker_id, activity_id, amount, paid_on, kind)
             VALUES ($1, $2, $3, $4, $5, 'direct_wage')",
        )
        .bind(*payment.id.0.as_uuid())
        .bind(*payment.worker_id.as_uuid())
        .bind(*payment.activity_id.as_uuid())
        .bind(payment.amount.minor())
        .bind(payment.paid_on)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(OP, e))?;
        Ok(payment.id)
    }

    // ---- settlement ----

    /// One settlement pass, fully inside a transaction. The worker's unpaid
    /// accruals and open advances are row-locked before planning, so two
    /// concurrent passes cannot both consume the same wage.
    #[instrument(skip(self, request), fields(worker = %request.worker_id, farm = %request.farm_id))]
    pub async fn settle(&self, request: SettleRequest) -> StoreResult<Settlement> {
        const OP: &str = "settle";
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(OP, e))?;
        set_lock_timeout(&mut tx, OP).await?;

        let registered: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM farm_workers WHERE farm_id = $1 AND worker_id = $2)",
        )
        .bind(*request.farm_id.as_uuid())
        .bind(*request.worker_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(OP, e))?;
        if !registered {
            return Err(DomainError::not_found("worker").into());
        }

        let accrual_rows = sqlx::query(
            "SELECT wa.id, wa.worker_id, wa.activity_id, wa.amount, wa.earned_on, wa.paid
             FROM wage_accruals wa
             JOIN farm_activities fa ON fa.id = wa.activity_id
             WHERE wa.worker_id = $1 AND fa.farm_id = $2 AND wa.paid = FALSE
             FOR UPDATE OF wa",
        )
        .bind(*request.worker_id.as_uuid())
        .bind(*request.farm_id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(OP, e))?;

        let advance_rows = sqlx::query(
            "SELECT ka.id, ka.worker_id, ka.activity_id, ka.amount, ka.amount_repaid, ka.issued_on, ka.status
             FROM kasbon_advances ka
             JOIN farm_activities fa ON fa.id = ka.activity_id
             WHERE ka.worker_id = $1 AND fa.farm_id = $2 AND ka.status = 'open'
             FOR UPDATE OF ka",
        )
        .bind(*request.worker_id.as_uuid())
        .bind(*request.farm_id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(OP, e))?;

        let accruals: Vec<WageAccrual> = accrual_rows
            .iter()
            .map(accrual_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error(OP, e))?;
        let mut advances: Vec<KasbonAdvance> = advance_rows
            .iter()
            .map(advance_from_row)
            .collect::<Result<_, _>>()?;

        let plan = plan_settlement(&accruals, &advances)?;
        if plan.total_earnings.is_zero() {
            warn!(worker = %request.worker_id, "settlement pass with zero earnings (audit checkpoint)");
        }

        if !plan.consumed_accruals.is_empty() {
            let ids: Vec<Uuid> = plan
                .consumed_accruals
                .iter()
                .map(|id| *id.0.as_uuid())
                .collect();
            sqlx::query("UPDATE wage_accruals SET paid = TRUE WHERE id = ANY($1)")
                .bind(ids)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error(OP, e))?;
        }

        for repayment in &plan.repayments {
            let advance = advances
                .iter_mut()
                .find(|k| k.id == repayment.kasbon_id)
                .ok_or_else(|| DomainError::not_found("kasbon advance"))?;
            advance.apply_repayment(repayment.pay)?;
            sqlx::query("UPDATE kasbon_advances SET amount_repaid = $2, status = $3 WHERE id = $1")
                .bind(*advance.id.0.as_uuid())
                .bind(advance.amount_repaid.minor())
                .bind(kasbon_status_str(advance.status))
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error(OP, e))?;
        }

        let settlement = Settlement {
            id: SettlementId::generate(),
            worker_id: request.worker_id,
            farm_id: request.farm_id,
            total_earnings: plan.total_earnings,
            total_kasbon: plan.total_kasbon,
            cash_paid: plan.cash_paid,
            settled_on: request.settled_on,
            notes: request.notes,
        };
        sqlx::query(
            "INSERT INTO settlements (id, worker_id, farm_id, total_earnings, total_kasbon, cash_paid, settled_on, notes)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(*settlement.id.0.as_uuid())
        .bind(*settlement.worker_id.as_uuid())
        .bind(*settlement.farm_id.as_uuid())
        .bind(settlement.total_earnings.minor())
        .bind(settlement.total_kasbon.minor())
        .bind(settlement.cash_paid.minor())
        .bind(settlement.settled_on)
        .bind(&settlement.notes)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(OP, e))?;

        tx.commit().await.map_err(|e| map_sqlx_error(OP, e))?;
        info!(
            worker = %settlement.worker_id,
            earnings = %settlement.total_earnings,
            kasbon = %settlement.total_kasbon,
            cash = %settlement.cash_paid,
            "settlement recorded"
        );
        Ok(settlement)
    }

    // ---- reads ----

    /// Derive `{pending_wage, open_kasbon}` fresh from the stored records.
    #[instrument(skip(self), fields(worker = %worker_id))]
    pub async fn summarize(
        &self,
        worker_id: WorkerId,
        scope: LedgerScope,
    ) -> StoreResult<WorkerBalance> {
        const OP: &str = "summarize";
        let worker_exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM workers WHERE id = $1)")
                .bind(*worker_id.as_uuid())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error(OP, e))?;
        if !worker_exists {
            return Err(DomainError::not_found("worker").into());
        }

        let (accruals, advances) = match scope {
            LedgerScope::Farm(farm_id) => {
                let farm_exists: bool =
                    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM farms WHERE id = $1)")
                        .bind(*farm_id.as_uuid())
                        .fetch_one(&self.pool)
                        .await
                        .map_err(|e| map_sqlx_error(OP, e))?;
                if !farm_exists {
                    return Err(DomainError::not_found("farm").into());
                }
                let accrual_rows = sqlx::query(
                    "SELECT wa.id, wa.worker_id, wa.activity_id, wa.amount, wa.earned_on, wa.paid
                     FROM wage_accruals wa
                     JOIN farm_activities fa ON fa.id = wa.activity_id
                     WHERE wa.worker_id = $1 AND fa.farm_id = $2",
                )
                .bind(*worker_id.as_uuid())
                .bind(*farm_id.as_uuid())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error(OP, e))?;
                let advance_rows = sqlx::query(
                    "SELECT ka.id, ka.worker_id, ka.activity_id, ka.amount, ka.amount_repaid, ka.issued_on, ka.status
                     FROM kasbon_advances ka
                     JOIN farm_activities fa ON fa.id = ka.activity_id
                     WHERE ka.worker_id = $1 AND fa.farm_id = $2",
                )
                .bind(*worker_id.as_uuid())
                .bind(*farm_id.as_uuid())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error(OP, e))?;
                (accrual_rows, advance_rows)
            }
            LedgerScope::Activity(activity_id) => {
                let activity_exists: bool =
                    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM farm_activities WHERE id = $1)")
                        .bind(*activity_id.as_uuid())
                        .fetch_one(&self.pool)
                        .await
                        .map_err(|e| map_sqlx_error(OP, e))?;
                if !activity_exists {
                    return Err(DomainError::not_found("activity").into());
                }
                let accrual_rows = sqlx::query(
                    "SELECT id, worker_id, activity_id, amount, earned_on, paid
                     FROM wage_accruals WHERE worker_id = $1 AND activity_id = $2",
                )
                .bind(*worker_id.as_uuid())
                .bind(*activity_id.as_uuid())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error(OP, e))?;
                let advance_rows = sqlx::query(
                    "SELECT id, worker_id, activity_id, amount, amount_repaid, issued_on, status
                     FROM kasbon_advances WHERE worker_id = $1 AND activity_id = $2",
                )
                .bind(*worker_id.as_uuid())
                .bind(*activity_id.as_uuid())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error(OP, e))?;
                (accrual_rows, advance_rows)
            }
        };

        let accruals: Vec<WageAccrual> = accruals
            .iter()
            .map(accrual_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error(OP, e))?;
        let advances: Vec<KasbonAdvance> = advances
            .iter()
            .map(advance_from_row)
            .collect::<Result<_, _>>()?;
        Ok(summarize(&accruals, &advances)?)
    }

    /// Settlement history for a worker, newest first.
    #[instrument(skip(self), fields(worker = %worker_id))]
    pub async fn settlements_for(&self, worker_id: WorkerId) -> StoreResult<Vec<Settlement>> {
        const OP: &str = "settlements_for";
        let rows = sqlx::query(
            "SELECT id, worker_id, farm_id, total_earnings, total_kasbon, cash_paid, settled_on, notes
             FROM settlements WHERE worker_id = $1 ORDER BY settled_on DESC, id DESC",
        )
        .bind(*worker_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(OP, e))?;
        rows.iter()
            .map(settlement_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error(OP, e))
    }

    /// Activity-log timeline for a step, newest first.
    #[instrument(skip(self), fields(%step_id))]
    pub async fn step_logs(&self, step_id: StepId) -> StoreResult<Vec<StepActivityLog>> {
        const OP: &str = "step_logs";
        let rows = sqlx::query(
            "SELECT id, step_id, action, description, actor_id, at
             FROM step_activity_logs WHERE step_id = $1 ORDER BY at DESC",
        )
        .bind(*step_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(OP, e))?;
        rows.iter()
            .map(log_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error(OP, e))
    }

    // ---- step lifecycle ----

    /// Drive the step lifecycle. For `lock`, workers linked to the step's
    /// activity with outstanding kasbon block the move.
    #[instrument(skip(self), fields(%step_id, %action))]
    pub async fn transition_step(
        &self,
        step_id: StepId,
        action: StepAction,
        actor: Option<UserId>,
    ) -> StoreResult<FarmingStep> {
        const OP: &str = "transition_step";
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(OP, e))?;
        set_lock_timeout(&mut tx, OP).await?;

        let row = sqlx::query(
            "SELECT id, farm_id, period_id, master_step_id, status, started_at, finished_at
             FROM farming_steps WHERE id = $1 FOR UPDATE",
        )
        .bind(*step_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(OP, e))?
        .ok_or_else(|| DomainError::not_found("step"))?;
        let mut step = step_from_row(&row)?;

        let debtors: Vec<WorkerId> = if action == StepAction::Lock {
            let rows = sqlx::query(
                "SELECT DISTINCT ka.worker_id
                 FROM kasbon_advances ka
                 JOIN farm_activities fa ON fa.id = ka.activity_id
                 WHERE fa.step_id = $1 AND ka.status = 'open'
                   AND ka.amount - ka.amount_repaid > 0",
            )
            .bind(*step_id.as_uuid())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(OP, e))?;
            rows.iter()
                .map(|r| r.try_get::<Uuid, _>("worker_id").map(WorkerId::from_uuid))
                .collect::<Result<_, _>>()
                .map_err(|e| map_sqlx_error(OP, e))?
        } else {
            Vec::new()
        };

        let transition = step.transition(action, Utc::now(), &debtors)?;
        step.apply(&transition);

        sqlx::query(
            "UPDATE farming_steps SET status = $2, started_at = $3, finished_at = $4 WHERE id = $1",
        )
        .bind(*step.id.as_uuid())
        .bind(step.status.as_str())
        .bind(step.started_at)
        .bind(step.finished_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(OP, e))?;

        let log = StepActivityLog::for_transition(&transition, actor);
        insert_log(&mut tx, &log, OP).await?;

        tx.commit().await.map_err(|e| map_sqlx_error(OP, e))?;
        info!(step = %step_id, %action, status = %step.status, "step transitioned");
        Ok(step)
    }

    // ---- period close ----

    /// Close a period: all steps terminal, roll up the closing balance,
    /// clear the farm's active-period pointer.
    #[instrument(skip(self), fields(%period_id))]
    pub async fn close_period(&self, period_id: PeriodId) -> StoreResult<Period> {
        const OP: &str = "close_period";
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(OP, e))?;
        set_lock_timeout(&mut tx, OP).await?;

        let row = sqlx::query(
            "SELECT id, farm_id, name, opening_balance, closing_balance, status, started_on, ended_on
             FROM periods WHERE id = $1 FOR UPDATE",
        )
        .bind(*period_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(OP, e))?
        .ok_or_else(|| DomainError::not_found("period"))?;
        let mut period = period_from_row(&row)?;

        let step_rows = sqlx::query("SELECT id, status FROM farming_steps WHERE period_id = $1")
            .bind(*period_id.as_uuid())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(OP, e))?;
        let mut steps = Vec::with_capacity(step_rows.len());
        for r in &step_rows {
            let id: Uuid = r.try_get("id").map_err(|e| map_sqlx_error(OP, e))?;
            let status: String = r.try_get("status").map_err(|e| map_sqlx_error(OP, e))?;
            steps.push((StepId::from_uuid(id), parse_step_status(&status)?));
        }

        let total_income: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(total_amount), 0)::bigint FROM incomes WHERE period_id = $1",
        )
        .bind(*period_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(OP, e))?;
        let total_expense: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0)::bigint FROM expenses WHERE period_id = $1",
        )
        .bind(*period_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(OP, e))?;

        let close = period.close(
            &steps,
            Money::from_minor(total_income),
            Money::from_minor(total_expense),
            Utc::now().date_naive(),
        )?;
        period.apply_close(&close);

        sqlx::query("UPDATE periods SET status = 'closed', closing_balance = $2, ended_on = $3 WHERE id = $1")
            .bind(*period_id.as_uuid())
            .bind(close.closing_balance.minor())
            .bind(close.ended_on)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(OP, e))?;
        sqlx::query(
            "UPDATE farms SET active_period_id = NULL WHERE id = $1 AND active_period_id = $2",
        )
        .bind(*period.farm_id.as_uuid())
        .bind(*period_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(OP, e))?;

        tx.commit().await.map_err(|e| map_sqlx_error(OP, e))?;
        info!(period = %period_id, closing = %close.closing_balance, "period closed");
        Ok(period)
    }

    // ---- private helpers ----

    async fn ensure_period_active(&self, period_id: PeriodId, op: &'static str) -> StoreResult<()> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM periods WHERE id = $1")
                .bind(*period_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error(op, e))?;
        match status.as_deref() {
            None => Err(DomainError::not_found("period").into()),
            Some("active") => Ok(()),
            Some(_) => {
                Err(DomainError::conflict(format!("period {period_id} is closed")).into())
            }
        }
    }

    async fn period_farm_if_active(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        period_id: PeriodId,
        op: &'static str,
    ) -> StoreResult<FarmId> {
        let row = sqlx::query("SELECT farm_id, status FROM periods WHERE id = $1")
            .bind(*period_id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error(op, e))?
            .ok_or_else(|| DomainError::not_found("period"))?;
        let status: String = row.try_get("status").map_err(|e| map_sqlx_error(op, e))?;
        if status != "active" {
            return Err(DomainError::conflict(format!("period {period_id} is closed")).into());
        }
        let farm_id: Uuid = row.try_get("farm_id").map_err(|e| map_sqlx_error(op, e))?;
        Ok(FarmId::from_uuid(farm_id))
    }

    async fn activity_step(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        activity_id: ActivityId,
        op: &'static str,
    ) -> StoreResult<(FarmId, FarmingStep)> {
        let row = sqlx::query(
            "SELECT fa.farm_id AS activity_farm,
                    s.id, s.farm_id, s.period_id, s.master_step_id, s.status, s.started_at, s.finished_at
             FROM farm_activities fa
             JOIN farming_steps s ON s.id = fa.step_id
             WHERE fa.id = $1",
        )
        .bind(*activity_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(op, e))?
        .ok_or_else(|| DomainError::not_found("activity"))?;
        let activity_farm: Uuid = row
            .try_get("activity_farm")
            .map_err(|e| map_sqlx_error(op, e))?;
        let step = step_from_row(&row)?;
        Ok((FarmId::from_uuid(activity_farm), step))
    }

    /// Worker registered to the activity's farm and the owning step not
    /// locked.
    async fn check_ledger_target(
        &self,
        worker_id: WorkerId,
        activity_id: ActivityId,
        op: &'static str,
    ) -> StoreResult<()> {
        let worker_exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM workers WHERE id = $1)")
                .bind(*worker_id.as_uuid())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error(op, e))?;
        if !worker_exists {
            return Err(DomainError::not_found("worker").into());
        }

        let row = sqlx::query(
            "SELECT fa.farm_id, fa.step_id, s.status,
                    EXISTS (SELECT 1 FROM farm_workers fw
                            WHERE fw.farm_id = fa.farm_id AND fw.worker_id = $2) AS registered
             FROM farm_activities fa
             JOIN farming_steps s ON s.id = fa.step_id
             WHERE fa.id = $1",
        )
        .bind(*activity_id.as_uuid())
        .bind(*worker_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(op, e))?
        .ok_or_else(|| DomainError::not_found("activity"))?;

        let registered: bool = row.try_get("registered").map_err(|e| map_sqlx_error(op, e))?;
        if !registered {
            return Err(
                DomainError::validation("worker is not registered to this farm").into(),
            );
        }
        let status: String = row.try_get("status").map_err(|e| map_sqlx_error(op, e))?;
        if parse_step_status(&status)? == StepStatus::Locked {
            let step_id: Uuid = row.try_get("step_id").map_err(|e| map_sqlx_error(op, e))?;
            return Err(DomainError::LockedStep(StepId::from_uuid(step_id)).into());
        }
        Ok(())
    }
}

async fn set_lock_timeout(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    op: &'static str,
) -> StoreResult<()> {
    sqlx::query("SET LOCAL lock_timeout = '2s'")
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(op, e))?;
    Ok(())
}

async fn insert_log(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    log: &StepActivityLog,
    op: &'static str,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO step_activity_logs (id, step_id, action, description, actor_id, at)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(*log.id.0.as_uuid())
    .bind(*log.step_id.as_uuid())
    .bind(&log.action)
    .bind(&log.description)
    .bind(log.actor_id.map(|a| *a.as_uuid()))
    .bind(log.at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(op, e))?;
    Ok(())
}

// ---- row mapping ----

fn accrual_from_row(row: &PgRow) -> Result<WageAccrual, sqlx::Error> {
    Ok(WageAccrual {
        id: AccrualId::new(RecordId::from_uuid(row.try_get("id")?)),
        worker_id: WorkerId::from_uuid(row.try_get("worker_id")?),
        activity_id: ActivityId::from_uuid(row.try_get("activity_id")?),
        amount: Money::from_minor(row.try_get("amount")?),
        earned_on: row.try_get("earned_on")?,
        paid: row.try_get("paid")?,
    })
}

fn advance_from_row(row: &PgRow) -> StoreResult<KasbonAdvance> {
    let status: String = row
        .try_get("status")
        .map_err(|e| map_sqlx_error("advance_from_row", e))?;
    let read = |name: &str| -> StoreResult<Uuid> {
        row.try_get(name)
            .map_err(|e| map_sqlx_error("advance_from_row", e))
    };
    Ok(KasbonAdvance {
        id: KasbonId::new(RecordId::from_uuid(read("id")?)),
        worker_id: WorkerId::from_uuid(read("worker_id")?),
        activity_id: ActivityId::from_uuid(read("activity_id")?),
        amount: Money::from_minor(
            row.try_get("amount")
                .map_err(|e| map_sqlx_error("advance_from_row", e))?,
        ),
        amount_repaid: Money::from_minor(
            row.try_get("amount_repaid")
                .map_err(|e| map_sqlx_error("advance_from_row", e))?,
        ),
        issued_on: row
            .try_get("issued_on")
            .map_err(|e| map_sqlx_error("advance_from_row", e))?,
        status: parse_kasbon_status(&status)?,
    })
}

fn settlement_from_row(row: &PgRow) -> Result<Settlement, sqlx::Error> {
    Ok(Settlement {
        id: SettlementId::new(RecordId::from_uuid(row.try_get("id")?)),
        worker_id: WorkerId::from_uuid(row.try_get("worker_id")?),
        farm_id: FarmId::from_uuid(row.try_get("farm_id")?),
        total_earnings: Money::from_minor(row.try_get("total_earnings")?),
        total_kasbon: Money::from_minor(row.try_get("total_kasbon")?),
        cash_paid: Money::from_minor(row.try_get("cash_paid")?),
        settled_on: row.try_get("settled_on")?,
        notes: row.try_get("notes")?,
    })
}

fn log_from_row(row: &PgRow) -> Result<StepActivityLog, sqlx::Error> {
    let actor: Option<Uuid> = row.try_get("actor_id")?;
    Ok(StepActivityLog {
        id: tanibuku_steps::LogId(RecordId::from_uuid(row.try_get("id")?)),
        step_id: StepId::from_uuid(row.try_get("step_id")?),
        action: row.try_get("action")?,
        description: row.try_get("description")?,
        actor_id: actor.map(UserId::from_uuid),
        at: row.try_get::<DateTime<Utc>, _>("at")?,
    })
}

fn step_from_row(row: &PgRow) -> StoreResult<FarmingStep> {
    let op = "step_from_row";
    let status: String = row.try_get("status").map_err(|e| map_sqlx_error(op, e))?;
    Ok(FarmingStep {
        id: StepId::from_uuid(row.try_get("id").map_err(|e| map_sqlx_error(op, e))?),
        farm_id: FarmId::from_uuid(row.try_get("farm_id").map_err(|e| map_sqlx_error(op, e))?),
        period_id: PeriodId::from_uuid(
            row.try_get("period_id").map_err(|e| map_sqlx_error(op, e))?,
        ),
        master_step_id: MasterStepId::from_uuid(
            row.try_get("master_step_id")
                .map_err(|e| map_sqlx_error(op, e))?,
        ),
        status: parse_step_status(&status)?,
        started_at: row
            .try_get("started_at")
            .map_err(|e| map_sqlx_error(op, e))?,
        finished_at: row
            .try_get("finished_at")
            .map_err(|e| map_sqlx_error(op, e))?,
    })
}

fn period_from_row(row: &PgRow) -> StoreResult<Period> {
    let op = "period_from_row";
    let status: String = row.try_get("status").map_err(|e| map_sqlx_error(op, e))?;
    let closing: Option<i64> = row
        .try_get("closing_balance")
        .map_err(|e| map_sqlx_error(op, e))?;
    Ok(Period {
        id: PeriodId::from_uuid(row.try_get("id").map_err(|e| map_sqlx_error(op, e))?),
        farm_id: FarmId::from_uuid(row.try_get("farm_id").map_err(|e| map_sqlx_error(op, e))?),
        name: row.try_get("name").map_err(|e| map_sqlx_error(op, e))?,
        opening_balance: Money::from_minor(
            row.try_get("opening_balance")
                .map_err(|e| map_sqlx_error(op, e))?,
        ),
        closing_balance: closing.map(Money::from_minor),
        status: parse_period_status(&status)?,
        started_on: row
            .try_get("started_on")
            .map_err(|e| map_sqlx_error(op, e))?,
        ended_on: row.try_get("ended_on").map_err(|e| map_sqlx_error(op, e))?,
    })
}

fn parse_step_status(s: &str) -> StoreResult<StepStatus> {
    match s {
        "draft" => Ok(StepStatus::Draft),
        "in_progress" => Ok(StepStatus::InProgress),
        "finished" => Ok(StepStatus::Finished),
        "locked" => Ok(StepStatus::Locked),
        other => Err(DomainError::validation(format!("unknown step status: {other}")).into()),
    }
}

fn parse_kasbon_status(s: &str) -> StoreResult<KasbonStatus> {
    match s {
        "open" => Ok(KasbonStatus::Open),
        "paid" => Ok(KasbonStatus::Paid),
        other => Err(DomainError::validation(format!("unknown kasbon status: {other}")).into()),
    }
}

fn parse_period_status(s: &str) -> StoreResult<PeriodStatus> {
    match s {
        "active" => Ok(PeriodStatus::Active),
        "closed" => Ok(PeriodStatus::Closed),
        other => Err(DomainError::validation(format!("unknown period status: {other}")).into()),
    }
}

fn kasbon_status_str(status: KasbonStatus) -> &'static str {
    match status {
        KasbonStatus::Open => "open",
        KasbonStatus::Paid => "paid",
    }
}
