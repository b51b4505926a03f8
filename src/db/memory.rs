use super::{utc_day_bounds, PositionStore, StoreError};
use crate::models::{Position, PositionStatus};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// In-process position store for paper runs and tests
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    positions: Mutex<Vec<Position>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn positions(&self) -> MutexGuard<'_, Vec<Position>> {
        self.positions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of every stored position, in insertion order
    pub fn all(&self) -> Vec<Position> {
        self.positions().clone()
    }

    pub fn open_count(&self, symbol: &str) -> usize {
        self.positions()
            .iter()
            .filter(|p| p.symbol == symbol && p.status == PositionStatus::Open)
            .count()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn create(&self, position: &Position) -> Result<Uuid, StoreError> {
        let mut positions = self.positions();

        let duplicate = position.status == PositionStatus::Open
            && positions
                .iter()
                .any(|p| p.symbol == position.symbol && p.status == PositionStatus::Open);
        if duplicate {
            return Err(StoreError::DuplicateOpenPosition(position.symbol.clone()));
        }

        let id = Uuid::new_v4();
        let mut stored = position.clone();
        stored.id = Some(id);
        positions.push(stored);
        Ok(id)
    }

    async fn update(&self, position: &Position) -> Result<(), StoreError> {
        let id = position.id.ok_or(StoreError::MissingId)?;
        let mut positions = self.positions();

        let index = positions
            .iter()
            .position(|p| p.id == Some(id))
            .ok_or(StoreError::NotFound(id))?;
        if positions[index].status == PositionStatus::Closed {
            return Err(StoreError::AlreadyClosed(id));
        }

        if position.status == PositionStatus::Open {
            let conflict = positions.iter().any(|p| {
                p.id != Some(id) && p.symbol == position.symbol && p.status == PositionStatus::Open
            });
            if conflict {
                return Err(StoreError::DuplicateOpenPosition(position.symbol.clone()));
            }
        }

        positions[index] = position.clone();
        Ok(())
    }

    async fn find_open(&self, symbol: &str) -> Result<Option<Position>, StoreError> {
        Ok(self
            .positions()
            .iter()
            .find(|p| p.symbol == symbol && p.status == PositionStatus::Open)
            .cloned())
    }

    async fn count_closed_on(&self, symbol: &str, day: NaiveDate) -> Result<u32, StoreError> {
        let (start, end) = utc_day_bounds(day);
        let count = self
            .positions()
            .iter()
            .filter(|p| p.symbol == symbol && p.status == PositionStatus::Closed)
            .filter(|p| p.exit_time.is_some_and(|t| t >= start && t < end))
            .count();
        Ok(count as u32)
    }
}
