// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod adapters;
pub mod api;
pub mod bus;
pub mod config;
pub mod error;
pub mod hub;
pub mod item;
pub mod metrics;
pub mod normalize;
pub mod scheduler;
pub mod shutdown;
pub mod telemetry;

// ---- Re-exports for stable public API ----
pub use crate::api::{router, AppState};
pub use crate::bus::{EventBus, StreamMessage, RAW_CHANNEL};
pub use crate::item::Item;
pub use crate::normalize::{normalize, NormalizeContext};
