pub mod reaction_diffusion;

pub use reaction_diffusion::{setup_reaction_diffusion_physics, ReactionDiffusionParams};
