use super::{utc_day_bounds, PositionStore, StoreError};
use crate::models::{CloseReason, Position, PositionStatus, Side};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use uuid::Uuid;

const POSITION_COLUMNS: &str = r#"
    id, symbol, side, entry_price, exit_price, quantity, leverage,
    stop_loss, take_profit, entry_time, exit_time, status, realized_pnl,
    stop_loss_order_id, take_profit_order_id, close_reason,
    trailing_stop_price, trailing_stop_distance
"#;

/// Postgres persistence for positions
pub struct PostgresPositionStore {
    pool: PgPool,
}

impl PostgresPositionStore {
    /// Connect and run embedded migrations
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    /// * `max_connections` - Pool size
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Buy => "buy",
        Side::Sell => "sell",
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

fn position_from_row(row: &PgRow) -> Result<Position, StoreError> {
    let side_raw: String = row.try_get("side")?;
    let side = match side_raw.as_str() {
        "buy" => Side::Buy,
        "sell" => Side::Sell,
        other => return Err(StoreError::Corrupt(format!("invalid side {:?}", other))),
    };

    let status_raw: String = row.try_get("status")?;
    let status = PositionStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("invalid status {:?}", status_raw)))?;

    let reason_raw: Option<String> = row.try_get("close_reason")?;
    let close_reason = reason_raw
        .map(|r| {
            CloseReason::parse(&r)
                .ok_or_else(|| StoreError::Corrupt(format!("invalid close reason {:?}", r)))
        })
        .transpose()?;

    let leverage: i32 = row.try_get("leverage")?;
    let leverage = u32::try_from(leverage)
        .map_err(|_| StoreError::Corrupt(format!("invalid leverage {}", leverage)))?;

    Ok(Position {
        id: Some(row.try_get::<Uuid, _>("id")?),
        symbol: row.try_get("symbol")?,
        side,
        entry_price: row.try_get("entry_price")?,
        exit_price: row.try_get("exit_price")?,
        quantity: row.try_get("quantity")?,
        leverage,
        stop_loss: row.try_get("stop_loss")?,
        take_profit: row.try_get("take_profit")?,
        entry_time: row.try_get::<DateTime<Utc>, _>("entry_time")?,
        exit_time: row.try_get::<Option<DateTime<Utc>>, _>("exit_time")?,
        status,
        realized_pnl: row.try_get("realized_pnl")?,
        stop_loss_order_id: row.try_get("stop_loss_order_id")?,
        take_profit_order_id: row.try_get("take_profit_order_id")?,
        close_reason,
        trailing_stop_price: row.try_get("trailing_stop_price")?,
        trailing_stop_distance: row.try_get("trailing_stop_distance")?,
    })
}

#[async_trait]
impl PositionStore for PostgresPositionStore {
    async fn create(&self, position: &Position) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();

        let result = sqlx::query(
            r#"
            INSERT INTO positions (
                id, symbol, side, entry_price, exit_price, quantity, leverage,
                stop_loss, take_profit, entry_time, exit_time, status, realized_pnl,
                stop_loss_order_id, take_profit_order_id, close_reason,
                trailing_stop_price, trailing_stop_distance
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(id)
        .bind(&position.symbol)
        .bind(side_str(position.side))
        .bind(position.entry_price)
        .bind(position.exit_price)
        .bind(position.quantity)
        .bind(position.leverage as i32)
        .bind(position.stop_loss)
        .bind(position.take_profit)
        .bind(position.entry_time)
        .bind(position.exit_time)
        .bind(position.status.as_str())
        .bind(position.realized_pnl)
        .bind(&position.stop_loss_order_id)
        .bind(&position.take_profit_order_id)
        .bind(position.close_reason.map(|r| r.as_str()))
        .bind(position.trailing_stop_price)
        .bind(position.trailing_stop_distance)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::DuplicateOpenPosition(position.symbol.clone()))
            }
            Err(e) => return Err(e.into()),
        }

        tracing::debug!("Created position {} for {}", id, position.symbol);

        Ok(id)
    }

    async fn update(&self, position: &Position) -> Result<(), StoreError> {
        let id = position.id.ok_or(StoreError::MissingId)?;

        // Entry fields never change after creation
        let result = sqlx::query(
            r#"
            UPDATE positions SET
                exit_price = $2,
                exit_time = $3,
                status = $4,
                realized_pnl = $5,
                stop_loss_order_id = $6,
                take_profit_order_id = $7,
                close_reason = $8,
                trailing_stop_price = $9,
                trailing_stop_distance = $10,
                updated_at = NOW()
            WHERE id = $1 AND status = 'Open'
            "#,
        )
        .bind(id)
        .bind(position.exit_price)
        .bind(position.exit_time)
        .bind(position.status.as_str())
        .bind(position.realized_pnl)
        .bind(&position.stop_loss_order_id)
        .bind(&position.take_profit_order_id)
        .bind(position.close_reason.map(|r| r.as_str()))
        .bind(position.trailing_stop_price)
        .bind(position.trailing_stop_distance)
        .execute(&self.pool)
        .await;

        let result = match result {
            Ok(result) => result,
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::DuplicateOpenPosition(position.symbol.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        if result.rows_affected() == 0 {
            // Either the id is unknown or the row is already Closed
            let exists = sqlx::query("SELECT 1 FROM positions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            return Err(match exists {
                Some(_) => StoreError::AlreadyClosed(id),
                None => StoreError::NotFound(id),
            });
        }

        tracing::debug!(
            "Updated position {} for {} ({})",
            id,
            position.symbol,
            position.status.as_str()
        );

        Ok(())
    }

    async fn find_open(&self, symbol: &str) -> Result<Option<Position>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM positions WHERE symbol = $1 AND status = 'Open'",
            POSITION_COLUMNS
        ))
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(position_from_row).transpose()
    }

    async fn count_closed_on(&self, symbol: &str, day: NaiveDate) -> Result<u32, StoreError> {
        let (start, end) = utc_day_bounds(day);

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS closed
            FROM positions
            WHERE symbol = $1 AND status = 'Closed'
              AND exit_time >= $2 AND exit_time < $3
            "#,
        )
        .bind(symbol)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        let closed: i64 = row.try_get("closed")?;
        Ok(closed.max(0) as u32)
    }
}
