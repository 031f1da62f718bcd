mod engine;
mod types;

pub use engine::run_simulation;
pub use types::{
    AllocationEntry, AssetParams, DEFAULT_SIMULATIONS, HoldingEntry, MAX_SIMULATIONS,
    SimulationConfig, SimulationError, SimulationRequest, SimulationResult,
};
