//! # Memory Layout
//!
//! Sizes of resolved types on the target. Sizes are in machine words.

use serde::{Deserialize, Serialize};

use crate::environment::Environment;
use crate::type_registry::Type;

/// Size of the tag field of a lowered union
pub const UNION_TAG_SIZE: usize = 1;

/// Computes the storage size of a type
pub trait MemoryLayoutStrategy: std::fmt::Debug + Send + Sync {
    fn sizeof(&self, ty: &Type, env: &Environment) -> usize;

    /// Words between the frame pointer and the last argument (return
    /// address and saved frame pointer)
    fn sizeof_save_area(&self) -> usize {
        2
    }
}

/// Word-addressed 16-bit target: every scalar is one word
#[derive(Debug, Clone, Copy, Default)]
pub struct Turtle16Layout;

impl MemoryLayoutStrategy for Turtle16Layout {
    fn sizeof(&self, ty: &Type, env: &Environment) -> usize {
        match ty {
            Type::Void | Type::Function(_) | Type::GenericFunction(_) | Type::Label => 0,
            Type::GenericStruct(_) | Type::GenericTrait(_) => 0,
            Type::Bool(_) | Type::Arithmetic(_) | Type::Pointer(_) | Type::ConstPointer(_) => 1,
            Type::Array { count, element } => count.unwrap_or(0) * self.sizeof(element, env),
            // base pointer plus count
            Type::DynamicArray(_) | Type::ConstDynamicArray(_) => 2,
            Type::Struct(s) | Type::ConstStruct(s) => {
                let fields = env.types.struct_info(s.id).fields;
                env.scope(fields)
                    .symbols
                    .values()
                    .map(|symbol| self.sizeof(&symbol.ty, env))
                    .sum()
            }
            // trait objects are a pair of pointers
            Type::Trait(_) | Type::ConstTrait(_) => 2,
            Type::Union(members) => {
                UNION_TAG_SIZE + members.iter().map(|m| self.sizeof(m, env)).max().unwrap_or(0)
            }
        }
    }
}

/// Selects a layout strategy from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LayoutKind {
    #[default]
    Turtle16,
}

impl LayoutKind {
    pub fn strategy(self) -> &'static dyn MemoryLayoutStrategy {
        match self {
            LayoutKind::Turtle16 => &Turtle16Layout,
        }
    }
}
