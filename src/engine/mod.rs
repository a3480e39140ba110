pub mod bus;
pub mod fingerprint;
pub mod healing;
pub mod normalize;
pub mod orchestrator;
pub mod parser;
pub mod provider;
pub mod subscription;
pub mod types;

pub use bus::{BusEvent, EventBus, EventHandler, EventPayload, EventType};
pub use fingerprint::{FingerprintEngine, FingerprintStore, IngestOutcome};
pub use healing::{Applicability, ContextProvider, HealingContext, HealingStrategy};
pub use orchestrator::{AttemptOutcome, AttemptRecord, HealingOrchestrator, HealingStore};
pub use provider::{CompletionClient, CompletionRequest, CompletionResponse};
