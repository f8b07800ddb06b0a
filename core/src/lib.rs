//! Mining cycle engine.
//!
//! Pure, synchronous building blocks shared by the service:
//! - `rate`: coins/hour from active boost plans
//! - `state`: the persisted `CycleState` record
//! - `engine`: the idle → mining → cooldown state machine
//! - `reconcile`: remote-wins merge of local and remote records
//! - `clock`: injectable time source

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod rate;
pub mod reconcile;
pub mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, CycleConfig};
pub use engine::{Action, CycleSnapshot, MilestoneEvent, MilestoneKind, MiningEngine};
pub use error::CycleError;
pub use rate::{compute_rate, BoostPlan, RateCalculator};
pub use reconcile::{merge, RecordOrigin, Reconciled};
pub use state::{CycleId, CycleState, PendingCredit, Phase, StoredPhase};
