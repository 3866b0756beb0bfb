// =============================================================================
// Exit Management Module
// =============================================================================
//
// Leverage-aware exit plans, local trigger detection, fill ordering and the
// lifecycle engine that ties them to the ledger and the order gateway.

pub mod monitor;
pub mod planner;
pub mod sequencer;
pub mod triggers;

pub use monitor::{EngineEvent, EngineHandle, LifecycleEngine, OpenRequest};
pub use planner::{ExitPlan, ExitPlanConfig, ExitPlanner, PerformanceTier, TierTable};
