//! Service artifacts
//!
//! Parses build recipes and turns each service's build context into a
//! runnable artifact before anything is started.

pub mod recipe;
pub mod stage;

pub use recipe::{BuildRecipe, Instruction, RecipeStage};
pub use stage::{context_digest, Artifact, BuildStage};

/// Recipe file looked up in a build context when none is named
pub const DEFAULT_RECIPE_FILE: &str = "Dockerfile";
