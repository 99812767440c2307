use crate::FlowKey;

/// Why a table write did not happen
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableError {
    /// Another writer created the key first
    Occupied,
    /// No room left for a new key
    Full,
}

/// Flow key to packet count, shared by every core.
pub trait FlowCountTable {
    /// Add one to an existing counter, wrapping on overflow. Returns `false`
    /// when the key is not in the table.
    fn increment(&mut self, key: FlowKey) -> bool;

    /// Create a counter for a key that is not in the table yet.
    fn insert(&mut self, key: FlowKey, count: i64) -> Result<(), TableError>;
}

/// Single slot holding the CPU that receives redirected frames. Written by
/// the control plane only.
pub trait CpuConfigTable {
    fn target_cpu(&self) -> Option<u32>;
}

/// Counter with one slot per core; the slot is picked by the core doing the
/// increment.
pub trait PerCpuPacketCounter {
    /// Add one to the calling core's slot. A missing slot is ignored.
    fn increment_local(&mut self);
}
