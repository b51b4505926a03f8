// Position lifecycle: the orchestrator and its price history cache
pub mod orchestrator;
pub mod price_history;

pub use orchestrator::{BarOutcome, EngineConfig, Orchestrator, Phase, SagaError};
pub use price_history::{PriceHistory, PushOutcome, DEFAULT_HISTORY_CAPACITY};
