//! Start gates.
//!
//! A gate suppresses blocks until a target is reached, then stays open for
//! the rest of the stream. Exclusive gates drop the triggering block too —
//! used when resuming after an already-processed block.

use chainsift_core::Block;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateTarget {
    Num(u64),
    Id(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    Inclusive,
    Exclusive,
}

#[derive(Debug, Clone)]
pub struct Gate {
    target: GateTarget,
    mode: GateMode,
    open: bool,
}

impl Gate {
    pub fn new(target: GateTarget, mode: GateMode) -> Self {
        Self {
            target,
            mode,
            open: false,
        }
    }

    pub fn num(num: u64, mode: GateMode) -> Self {
        Self::new(GateTarget::Num(num), mode)
    }

    pub fn id(id: impl Into<String>, mode: GateMode) -> Self {
        Self::new(GateTarget::Id(id.into()), mode)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Whether `block` passes. Mutates the gate on first trigger.
    pub fn pass(&mut self, block: &Block) -> bool {
        if self.open {
            return true;
        }
        let triggered = match &self.target {
            GateTarget::Num(num) => block.num >= *num,
            GateTarget::Id(id) => block.id == *id,
        };
        if triggered {
            self.open = true;
            tracing::debug!(num = block.num, id = %block.id, "gate opened");
            return self.mode == GateMode::Inclusive;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsift_testing::block;

    #[test]
    fn inclusive_num_gate_passes_trigger_block() {
        let mut gate = Gate::num(5, GateMode::Inclusive);
        assert!(!gate.pass(&block(4, "a", "", 0)));
        assert!(gate.pass(&block(5, "b", "a", 0)));
        assert!(gate.pass(&block(3, "c", "", 0))); // open stays open
    }

    #[test]
    fn exclusive_id_gate_drops_trigger_block() {
        let mut gate = Gate::id("bb", GateMode::Exclusive);
        assert!(!gate.pass(&block(1, "aa", "", 0)));
        assert!(!gate.pass(&block(2, "bb", "aa", 0)));
        assert!(gate.is_open());
        assert!(gate.pass(&block(3, "cc", "bb", 0)));
    }
}
