// Position persistence
pub mod memory;
pub mod postgres;

pub use memory::MemoryPositionStore;
pub use postgres::PostgresPositionStore;

use crate::models::Position;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("an open position already exists for {0}")]
    DuplicateOpenPosition(String),

    #[error("position {0} not found")]
    NotFound(Uuid),

    #[error("position {0} is already closed")]
    AlreadyClosed(Uuid),

    #[error("position has no id; it was never created")]
    MissingId,

    #[error("corrupt position row: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Durable record of positions.
///
/// Implementations must reject a second Open position for the same symbol,
/// independently of any check the caller makes.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Insert a new position and return its id
    async fn create(&self, position: &Position) -> Result<Uuid, StoreError>;

    /// Overwrite an existing Open position (used to close it).
    ///
    /// A position that is already Closed in the store is immutable:
    /// the write fails with [`StoreError::AlreadyClosed`].
    async fn update(&self, position: &Position) -> Result<(), StoreError>;

    async fn find_open(&self, symbol: &str) -> Result<Option<Position>, StoreError>;

    /// Positions for `symbol` closed on the UTC calendar day `day`
    async fn count_closed_on(&self, symbol: &str, day: NaiveDate) -> Result<u32, StoreError>;

    async fn count_closed_today(&self, symbol: &str) -> Result<u32, StoreError> {
        self.count_closed_on(symbol, Utc::now().date_naive()).await
    }
}

/// `[start, end)` of a UTC calendar day
pub(crate) fn utc_day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = day.and_time(chrono::NaiveTime::MIN).and_utc();
    (start, start + Duration::days(1))
}
