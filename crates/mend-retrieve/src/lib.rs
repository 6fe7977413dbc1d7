//! Context assembly for mend repairs.
//!
//! Retrieval merges bounded graph traversal with vector search into a ranked
//! Needed set. The pattern library maps diagnostics to structural fixes, and
//! the packer lays the result out within a token budget.

pub mod packer;
pub mod patterns;
pub mod retrieval;
pub mod signature;
pub mod token_budget;
pub mod types;

pub use packer::{ContextBundle, ContextPacker, ContextSection, SectionRole};
pub use patterns::{EditLocus, Pattern, PatternLibrary, PatternMatch, PatternTarget};
pub use retrieval::RetrievalEngine;
pub use signature::BoundPlacement;
pub use types::{
    NeededNode, NeededSet, PatternError, Provenance, RetrievalConstraints, RetrievalError,
    RetrievalFeatures, RetrievalHints,
};
