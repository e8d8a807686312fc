//! Backend configuration handed in by the driver.

use serde::{Deserialize, Serialize};

/// Where runtime-sized objects (struct instances, array data) come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStrategy {
    /// Import `env.malloc` from the host.
    #[default]
    External,
    /// Synthesise a bump allocator function inside the module.
    Internal,
}

/// Syntactic form of the emitted WAT text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WritingStyle {
    /// One instruction per line, `block … end` keywords.
    #[default]
    Linear,
    /// S-expressions; control instructions carry their children as operands.
    Folded,
}

/// The syscall-interface dialect. Only one value is currently defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyscallInterface {
    #[default]
    HyggeSi,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CompilerConfig {
    pub allocation_strategy: AllocationStrategy,
    pub si: SyscallInterface,
    pub style: WritingStyle,
    /// Run the peephole pass over every function body after lowering.
    pub peephole: bool,
}

impl CompilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_style(mut self, style: WritingStyle) -> Self {
        self.style = style;
        self
    }

    pub fn with_peephole(mut self, peephole: bool) -> Self {
        self.peephole = peephole;
        self
    }

    pub fn with_allocation_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.allocation_strategy = strategy;
        self
    }
}
