//! # Snap Typed AST
//!
//! The tree, scope environment and type oracle shared by every lowering pass
//! of the Snap compiler middle-end.
//!
//! ## Overview
//!
//! - **Syntax tree**: a closed set of statement and expression kinds
//!   ([`NodeKind`], [`ExprKind`]) with stable node identity
//! - **Environment**: an arena of lexical scopes addressed by [`ScopeId`],
//!   holding symbol and type tables, stack frames and breadcrumbs
//! - **Type registry**: nominal structs, traits, generics and the tagged
//!   lowering of union types
//! - **Type checker**: rvalue, lvalue and type-expression checking plus the
//!   convertibility rules the passes consult
//! - **Memory efficiency**: identifiers are interned
//!
//! ## Architecture
//!
//! A front end produces a [`Node`] tree whose blocks point at scopes in an
//! [`Environment`]. Lowering passes (in `snap_compiler`) consume the tree and
//! produce a new one, querying [`TypeChecker`] against the live scope of the
//! node they are rewriting. Because the tree stores only scope ids, every
//! pass observes the same scopes, and declaration scanning updates them in
//! place.
//!
//! ## Usage
//!
//! ```rust
//! use snap_typed_ast::{Environment, Expr, Type, TypeChecker};
//!
//! let mut env = Environment::new();
//! let root = env.root();
//! let mut tc = TypeChecker::new(&mut env, root);
//! let ty = tc.check(&Expr::literal_int(300)).unwrap();
//! assert_eq!(ty, Type::comp_time_int(300));
//! ```

pub mod arena;

pub mod source;
pub mod error;
pub mod diagnostics;

pub mod type_registry;
pub mod typed_ast;
pub mod typed_builder;

pub mod environment;
pub mod frame;
pub mod layout;
pub mod mangler;
pub mod nominal;
pub mod type_checker;

// Re-exports for convenience
pub use arena::InternedString;

pub use source::{Location, SourceFile, Span};
pub use error::{CompilerError, CompilerResult};
pub use diagnostics::{Diagnostic, DiagnosticLevel};

pub use type_registry::{
    ArithmeticType, BooleanType, FunctionType, GenericRef, IntClass, StructId, StructRef, StructTypeInfo,
    TraitId, TraitRef, TraitTypeInfo, Type, TypeRegistry, Visibility,
};

pub use typed_ast::{
    Asm, Assert, BinaryOp, Block, Expr, ExprKind, ForIn, FunctionDeclaration, Goto, GotoIfFalse, If, Impl,
    ImplFor, Import, LabelDeclaration, Match, MatchClause, Module, Node, NodeId, NodeKind, Return, Seq,
    StorageClass, StructDeclaration, StructInitializerArgument, StructMember, TestDeclaration,
    TraitDeclaration, Typealias, UnaryOp, VarDeclaration, While,
};

pub use environment::{
    Breadcrumb, Environment, InitializationStatus, Scope, ScopeId, Storage, Symbol, SymbolFacts, TypeRecord,
    PANIC_FUNCTION, TEMP_PREFIX,
};
pub use frame::{Frame, GrowthDirection};
pub use layout::{LayoutKind, MemoryLayoutStrategy, Turtle16Layout, UNION_TAG_SIZE};

pub use type_checker::{Convertibility, TypeChecker, COUNT, POINTEE};

pub use typed_builder::TypedASTBuilder;
