//! Execution layer for the harness: process supervision, run
//! orchestration, the in-process event bus, the redesign pipeline, and
//! reference ingest. Builds on `harness-core`'s registry and domain types
//! and `harness-agent`'s Claude Code CLI subprocess wire protocol.

pub mod bus;
pub mod error;
pub mod ingest;
pub mod orchestrator;
pub mod redesign;
pub mod supervisor;

pub use bus::{Event, EventBus};
pub use error::{EngineError, Result};
pub use ingest::ScreenshotCollaborator;
pub use orchestrator::{Orchestrator, Phase};
pub use redesign::{ApprovalOutcome, PhaseWaiters, RedesignEngine};
pub use supervisor::{IdleWindows, RunSignal, Supervisor};
