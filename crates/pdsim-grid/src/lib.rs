//! Worker-grid collaborators for PDSim.
//!
//! The scheduler in `pdsim-core` treats primitive generation and the on-chip
//! transport as external services. This crate defines those seams as traits
//! and ships simple implementations so a run can execute end to end:
//!
//! | Component | Role |
//! |-----------|------|
//! | [`TemplateGenerator`] | Op-by-op decoder layer stream |
//! | [`FusedGenerator`] | Single fused compute op per iteration |
//! | [`SimulatedGrid`] | Linear-cost transport with seeded EOF sampling |

pub mod grid;
pub mod instructions;
pub mod traits;

pub use grid::{GridTiming, SimulatedGrid};
pub use instructions::{
    start_payload_bytes, ComputeOp, FusedGenerator, Instruction, InstructionStream, SizingTable,
    TemplateGenerator,
};
pub use traits::*;

/// Create an instruction generator by name.
pub fn generator_by_name(name: &str) -> Option<Box<dyn InstructionGenerator>> {
    match name {
        "template" => Some(Box::new(TemplateGenerator::new())),
        "fused" => Some(Box::new(FusedGenerator::new())),
        _ => None,
    }
}

/// List all available generator names.
pub fn available_generators() -> Vec<&'static str> {
    vec!["template", "fused"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_by_name() {
        for name in available_generators() {
            let gen = generator_by_name(name).unwrap_or_else(|| panic!("Missing: {}", name));
            assert_eq!(gen.name(), name);
        }
        assert!(generator_by_name("nonexistent").is_none());
    }
}
