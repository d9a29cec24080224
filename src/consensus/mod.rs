//! Consensus
//!
//! Stake-weighted leader election, the per-round state machine and the
//! async driver that runs it.

pub mod driver;
pub mod election;
pub mod engine;
pub mod faults;
pub mod status;

pub use driver::{wall_clock_round, ControlCommand, DriverContext, DriverSettings, RoundDriver};
pub use election::{elect_leader, election_seed, leader_schedule};
pub use engine::{
    Action, Agreement, AttemptOutcome, AttemptRecord, ConsensusEngine, ConsensusError,
    FailureReason, RoundCounters, RoundOutcome, RoundState, RoundStatus, RoundSummary,
};
pub use faults::{FaultKind, FaultLedger, FaultRecord};
pub use status::{FaultView, NodeMetrics, NodeStatus, RoundView};
