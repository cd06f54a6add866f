//! Observer trait for header oracle events.

use opentxs_common::{OracleState, Position, Reorg};

/// Callback receiver for header oracle events.
///
/// Callbacks run while the oracle is being mutated, so implementations
/// should only record the event. The bus module queues them and publishes
/// once the oracle lock is released.
pub trait HeaderOracleObserver {
    /// The best chain changed. Called once per mutation, after the change
    /// is durable.
    fn reorg(&self, reorg: &Reorg);

    /// A connected header became banned by the checkpoint.
    fn header_banned(&self, position: &Position);

    /// The oracle became available, degraded or stopped.
    fn state_changed(&self, state: &OracleState);
}

/// Observer that ignores every event.
pub struct NoOpObserver;

impl HeaderOracleObserver for NoOpObserver {
    fn reorg(&self, _: &Reorg) {}
    fn header_banned(&self, _: &Position) {}
    fn state_changed(&self, _: &OracleState) {}
}
