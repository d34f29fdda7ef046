//! # Snap Compiler
//!
//! Middle-end lowering for the Snap compiler: takes a type-checked tree and
//! rewrites it, one pass at a time, into the small three-address-like subset
//! the code generator consumes.
//!
//! ## Architecture
//!
//! - [`pass`]: the [`CompilerPass`] trait, structural default recursion and
//!   scope tracking shared by every pass
//! - [`decl_scan`]: declaration scanning, so a pass sees every binding of a
//!   block before visiting its statements
//! - [`expose_conversions`]: implicit conversions become explicit casts
//! - [`vtables`]: traits become vtable structs, trait-object structs and
//!   forwarding thunks
//! - [`erase_unions`]: unions become tagged structs
//! - [`decompose`]: nested expressions are split into temporaries
//! - [`erase_eseq`]: expression sequences are hoisted into statements
//! - [`pipeline`]: runs the passes above in order
//!
//! ## Design Principles
//!
//! - Passes never mutate a tree in place; each visit returns the rewritten node
//! - Every pass consults the same [`Environment`], so types and temporaries
//!   introduced by one pass are known to the next
//! - Errors propagate out of the first failing pass unchanged

pub mod pass;
pub mod decl_scan;
pub mod expose_conversions;
pub mod vtables;
pub mod erase_unions;
pub mod decompose;
pub mod erase_eseq;
pub mod pipeline;

// Re-export key types
pub use pass::{Anchor, CompilerPass, PassState};
pub use decl_scan::DeclScanner;
pub use expose_conversions::{expose_conversions, ExposeConversionsPass};
pub use vtables::{vtables, VtablesPass};
pub use erase_unions::{erase_unions, EraseUnionsPass};
pub use decompose::{decompose, DecomposePass};
pub use erase_eseq::{erase_eseq, EraseEseqOptions, EraseEseqPass};
pub use pipeline::{LoweringConfig, LoweringPipeline, LoweringStage};

pub use snap_typed_ast::{CompilerError, CompilerResult, Environment, Node};
