// Trading strategy module
pub mod sma_cross;

pub use sma_cross::{SmaCrossConfig, SmaCrossStrategy};

use crate::models::{CloseReason, Position, PriceBar};

/// Decides when to open and close positions.
///
/// Called only from the orchestrator's single consumer loop, with finalized
/// bars. Implementations may keep indicator state between calls.
pub trait SignalSource: Send + Sync {
    /// Get strategy name
    fn name(&self) -> &str;

    /// Finalized bars needed before any decision is requested
    fn required_history_length(&self) -> usize;

    fn should_enter(&mut self, history: &[PriceBar], current_price: f64) -> bool;

    /// `Some(reason)` to close now.
    ///
    /// May record trailing-stop bookkeeping on `position`; the orchestrator
    /// persists it with the close.
    fn should_close(
        &mut self,
        position: &mut Position,
        history: &[PriceBar],
        current_price: f64,
    ) -> Option<CloseReason>;
}
