//! GPU-driven draw submission.
//!
//! The descriptor table describes every drawable once; each frame the synthesis
//! kernel turns it into indirect draw commands, the optimizer copies them into the
//! replay buffer, and render passes replay them batch by batch.

pub mod commands;
pub mod descriptor_table;
pub mod layout;
pub mod optimizer;
pub mod synthesis;

pub use commands::{DrawIndexedIndirectArgs, IndirectCommandBuffer, COMMAND_STRIDE};
pub use descriptor_table::{DescriptorBuffers, DescriptorTable, Drawable, GeometrySlot, ReplayBatch};
pub use optimizer::{IcbOptimizePass, ReplayPlan};
pub use synthesis::{CommandSynthesisPass, SynthesisInputs};
