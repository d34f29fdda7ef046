//! # Environment
//!
//! Lexical scopes for a Snap program, stored in an arena and addressed by
//! [`ScopeId`].
//!
//! ## Architecture
//!
//! Every block, function body, module, struct and trait owns one scope. A
//! scope points at its parent; lookups walk the parent chain. The tree only
//! stores scope ids, so the same scope is observed by every pass that runs
//! over the tree, and declaration scanning mutates it in place.
//!
//! A scope may own a [`Frame`]. Scopes that do not own one allocate from the
//! nearest ancestor that does.
//!
//! The root scope binds the built-in types and the runtime `__panic`
//! function. Compiler temporaries are named from a counter held here so
//! names never collide between passes.

use indexmap::{IndexMap, IndexSet};
use log::trace;
use serde::{Deserialize, Serialize};

use crate::arena::InternedString;
use crate::error::{CompilerError, CompilerResult};
use crate::frame::{Frame, GrowthDirection};
use crate::layout::{LayoutKind, MemoryLayoutStrategy};
use crate::mangler;
use crate::source::Span;
use crate::type_registry::{FunctionType, Type, TypeRegistry, Visibility};
use crate::typed_ast::NodeId;

/// Reserved prefix of compiler-generated temporaries
pub const TEMP_PREFIX: &str = "__temp";

/// Name of the runtime routine invoked on a failed union cast
pub const PANIC_FUNCTION: &str = "__panic";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Storage {
    /// Offset in the static data area, assigned on first allocation
    Static(Option<i64>),
    /// Offset relative to the frame pointer
    Automatic(Option<i64>),
    Register,
}

impl Storage {
    pub fn is_static(&self) -> bool {
        matches!(self, Storage::Static(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InitializationStatus {
    #[default]
    Uninitialized,
    MaybeInitialized,
    Initialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SymbolFacts {
    pub initialization_status: InitializationStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub ty: Type,
    pub storage: Storage,
    pub visibility: Visibility,
    /// Declaration this binding came from; `None` for hand-made bindings
    pub decl: Option<NodeId>,
    pub facts: SymbolFacts,
}

impl Symbol {
    pub fn new(ty: Type, storage: Storage) -> Self {
        Self {
            ty,
            storage,
            visibility: Visibility::Private,
            decl: None,
            facts: SymbolFacts::default(),
        }
    }

    pub fn with_decl(mut self, decl: NodeId) -> Self {
        self.decl = Some(decl);
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn initialized(mut self) -> Self {
        self.facts.initialization_status = InitializationStatus::Initialized;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeRecord {
    pub ty: Type,
    pub visibility: Visibility,
    pub decl: Option<NodeId>,
}

impl TypeRecord {
    pub fn new(ty: Type) -> Self {
        Self {
            ty,
            visibility: Visibility::Private,
            decl: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameLookup {
    Inherit,
    Set(Frame),
}

/// What kind of construct opened a scope
#[derive(Debug, Clone, PartialEq)]
pub enum Breadcrumb {
    Function(FunctionType),
    Module {
        name: InternedString,
        use_global_namespace: bool,
    },
    Struct(InternedString),
    Trait(InternedString),
}

impl Breadcrumb {
    /// Name contributed to mangled names
    pub fn name(&self) -> Option<InternedString> {
        match self {
            Breadcrumb::Function(f) => f.name,
            Breadcrumb::Module { name, .. } => Some(*name),
            Breadcrumb::Struct(name) | Breadcrumb::Trait(name) => Some(*name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub symbols: IndexMap<InternedString, Symbol>,
    pub types: IndexMap<InternedString, TypeRecord>,
    pub frame_lookup: FrameLookup,
    pub breadcrumb: Option<Breadcrumb>,
    pub imported_modules: IndexSet<InternedString>,
}

impl Scope {
    fn new(parent: Option<ScopeId>, frame_lookup: FrameLookup) -> Self {
        Self {
            parent,
            symbols: IndexMap::new(),
            types: IndexMap::new(),
            frame_lookup,
            breadcrumb: None,
            imported_modules: IndexSet::new(),
        }
    }
}

/// Arena of scopes plus the nominal type registry and module table
#[derive(Debug, Clone)]
pub struct Environment {
    scopes: Vec<Scope>,
    root: ScopeId,
    pub types: TypeRegistry,
    modules: IndexMap<InternedString, ScopeId>,
    static_frame: Frame,
    layout: LayoutKind,
    temp_counter: usize,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        Self::with_layout(LayoutKind::default())
    }

    pub fn with_layout(layout: LayoutKind) -> Self {
        let mut env = Self {
            scopes: vec![Scope::new(None, FrameLookup::Set(Frame::default()))],
            root: ScopeId(0),
            types: TypeRegistry::new(),
            modules: IndexMap::new(),
            static_frame: Frame::default(),
            layout,
            temp_counter: 0,
        };
        env.bind_builtins();
        env
    }

    fn bind_builtins(&mut self) {
        let root = self.root;
        for (name, ty) in [
            ("void", Type::Void),
            ("bool", Type::BOOL),
            ("u8", Type::U8),
            ("u16", Type::U16),
            ("i8", Type::I8),
            ("i16", Type::I16),
        ] {
            self.bind_type(root, name.into(), TypeRecord::new(ty));
        }
        let panic = FunctionType::named(
            PANIC_FUNCTION.into(),
            PANIC_FUNCTION.into(),
            Type::Void,
            vec![Type::ConstDynamicArray(Box::new(Type::U8))],
        );
        self.bind_symbol(
            root,
            PANIC_FUNCTION.into(),
            Symbol::new(Type::Function(panic), Storage::Static(None)).initialized(),
        );
    }

    pub fn root(&self) -> ScopeId {
        self.root
    }

    /// Open a scope that allocates from its parent's frame
    pub fn new_scope(&mut self, parent: Option<ScopeId>) -> ScopeId {
        self.push_scope(Scope::new(parent, FrameLookup::Inherit))
    }

    /// Open a scope with its own frame, as function bodies and structs do
    pub fn new_scope_with_frame(&mut self, parent: Option<ScopeId>, frame: Frame) -> ScopeId {
        self.push_scope(Scope::new(parent, FrameLookup::Set(frame)))
    }

    fn push_scope(&mut self, scope: Scope) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(scope);
        id
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    pub fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.0 as usize]
    }

    pub fn parent(&self, id: ScopeId) -> Option<ScopeId> {
        self.scope(id).parent
    }

    pub fn set_breadcrumb(&mut self, scope: ScopeId, breadcrumb: Breadcrumb) {
        self.scope_mut(scope).breadcrumb = Some(breadcrumb);
    }

    pub fn set_frame(&mut self, scope: ScopeId, frame: Frame) {
        self.scope_mut(scope).frame_lookup = FrameLookup::Set(frame);
    }

    pub fn bind_symbol(&mut self, scope: ScopeId, name: InternedString, symbol: Symbol) {
        trace!("[ENV] bind symbol {} : {} in scope {}", name, symbol.ty, scope.0);
        self.scope_mut(scope).symbols.insert(name, symbol);
    }

    pub fn bind_type(&mut self, scope: ScopeId, name: InternedString, record: TypeRecord) {
        trace!("[ENV] bind type {} = {} in scope {}", name, record.ty, scope.0);
        self.scope_mut(scope).types.insert(name, record);
    }

    fn chain(&self, scope: ScopeId) -> impl Iterator<Item = ScopeId> + '_ {
        std::iter::successors(Some(scope), move |id| self.parent(*id))
    }

    /// Scope holding the binding of `name`, searching at most `max_depth`
    /// parents above `scope`
    pub fn symbol_scope(&self, scope: ScopeId, name: InternedString, max_depth: usize) -> Option<ScopeId> {
        self.chain(scope)
            .take(max_depth.saturating_add(1))
            .find(|id| self.scope(*id).symbols.contains_key(&name))
    }

    pub fn lookup_symbol(&self, scope: ScopeId, name: InternedString) -> Option<&Symbol> {
        self.lookup_symbol_max_depth(scope, name, usize::MAX)
    }

    pub fn lookup_symbol_max_depth(&self, scope: ScopeId, name: InternedString, max_depth: usize) -> Option<&Symbol> {
        let owner = self.symbol_scope(scope, name, max_depth)?;
        self.scope(owner).symbols.get(&name)
    }

    pub fn lookup_symbol_mut(&mut self, scope: ScopeId, name: InternedString) -> Option<&mut Symbol> {
        let owner = self.symbol_scope(scope, name, usize::MAX)?;
        self.scope_mut(owner).symbols.get_mut(&name)
    }

    /// Resolve an identifier or fail with an unresolved-identifier error
    pub fn resolve_symbol(&self, scope: ScopeId, name: InternedString, span: Option<Span>) -> CompilerResult<&Symbol> {
        self.lookup_symbol(scope, name)
            .ok_or_else(|| CompilerError::unresolved_identifier(name, span))
    }

    pub fn lookup_type_record_max_depth(
        &self,
        scope: ScopeId,
        name: InternedString,
        max_depth: usize,
    ) -> Option<&TypeRecord> {
        self.chain(scope)
            .take(max_depth.saturating_add(1))
            .find_map(|id| self.scope(id).types.get(&name))
    }

    pub fn lookup_type_record(&self, scope: ScopeId, name: InternedString) -> Option<&TypeRecord> {
        self.lookup_type_record_max_depth(scope, name, usize::MAX)
    }

    pub fn lookup_type(&self, scope: ScopeId, name: InternedString) -> Option<&Type> {
        self.lookup_type_record(scope, name).map(|record| &record.ty)
    }

    pub fn resolve_type(&self, scope: ScopeId, name: InternedString, span: Option<Span>) -> CompilerResult<Type> {
        self.lookup_type(scope, name)
            .cloned()
            .ok_or_else(|| CompilerError::unresolved_type(name, span))
    }

    pub fn symbol_exists(&self, scope: ScopeId, name: InternedString, max_depth: usize) -> bool {
        self.symbol_scope(scope, name, max_depth).is_some()
    }

    pub fn type_exists(&self, scope: ScopeId, name: InternedString, max_depth: usize) -> bool {
        self.lookup_type_record_max_depth(scope, name, max_depth).is_some()
    }

    /// Breadcrumbs from the outermost scope inward
    pub fn breadcrumbs(&self, scope: ScopeId) -> Vec<Breadcrumb> {
        let mut crumbs: Vec<Breadcrumb> = self
            .chain(scope)
            .filter_map(|id| self.scope(id).breadcrumb.clone())
            .collect();
        crumbs.reverse();
        crumbs
    }

    /// Signature of the innermost function enclosing `scope`
    pub fn enclosing_function_type(&self, scope: ScopeId) -> Option<FunctionType> {
        self.chain(scope).find_map(|id| match &self.scope(id).breadcrumb {
            Some(Breadcrumb::Function(f)) => Some(f.clone()),
            _ => None,
        })
    }

    /// Whether `scope` sits directly inside a function body or is one
    pub fn is_inside_function(&self, scope: ScopeId) -> bool {
        self.enclosing_function_type(scope).is_some()
    }

    pub fn mangle_name(&self, scope: ScopeId, name: InternedString) -> InternedString {
        mangler::mangle(&self.breadcrumbs(scope), name)
    }

    fn frame_owner(&self, scope: ScopeId) -> ScopeId {
        self.chain(scope)
            .find(|id| matches!(self.scope(*id).frame_lookup, FrameLookup::Set(_)))
            .unwrap_or(self.root)
    }

    /// Allocate automatic storage from the nearest frame
    pub fn allocate(&mut self, scope: ScopeId, size: usize) -> i64 {
        let owner = self.frame_owner(scope);
        match &mut self.scope_mut(owner).frame_lookup {
            FrameLookup::Set(frame) => frame.allocate(size),
            FrameLookup::Inherit => 0,
        }
    }

    pub fn allocate_static(&mut self, size: usize) -> i64 {
        self.static_frame.allocate(size)
    }

    pub fn reset_static_frame(&mut self) {
        self.static_frame.reset();
    }

    /// A fresh frame for laying out function locals
    pub fn function_frame() -> Frame {
        Frame::new(0, GrowthDirection::Up)
    }

    pub fn layout(&self) -> &'static dyn MemoryLayoutStrategy {
        self.layout.strategy()
    }

    pub fn layout_kind(&self) -> LayoutKind {
        self.layout
    }

    pub fn sizeof(&self, ty: &Type) -> usize {
        self.layout().sizeof(ty, self)
    }

    pub fn next_temp_name(&mut self) -> InternedString {
        let name = format!("{}{}", TEMP_PREFIX, self.temp_counter);
        self.temp_counter += 1;
        InternedString::from(name)
    }

    /// Drop bindings a previous scan derived from declarations. Hand-made
    /// bindings (no declaration identity) survive.
    pub fn clear_declared_bindings(&mut self, scope: ScopeId) {
        let s = self.scope_mut(scope);
        s.symbols.retain(|_, symbol| symbol.decl.is_none());
        s.types.retain(|_, record| record.decl.is_none());
        s.imported_modules.clear();
        if let FrameLookup::Set(frame) = &mut s.frame_lookup {
            frame.reset();
        }
    }

    pub fn register_module(&mut self, name: InternedString, scope: ScopeId, span: Option<Span>) -> CompilerResult<()> {
        if self.modules.contains_key(&name) {
            return Err(CompilerError::redefinition(
                format!("module duplicates existing module \"{}\"", name),
                span,
            ));
        }
        self.modules.insert(name, scope);
        Ok(())
    }

    pub fn forget_module(&mut self, name: InternedString) {
        self.modules.shift_remove(&name);
    }

    pub fn module(&self, name: InternedString) -> Option<ScopeId> {
        self.modules.get(&name).copied()
    }

    /// Record `module` as imported into `scope`; false if it already was
    pub fn mark_imported(&mut self, scope: ScopeId, module: InternedString) -> bool {
        self.scope_mut(scope).imported_modules.insert(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_walks_parent_chain() {
        let mut env = Environment::new();
        let outer = env.new_scope(Some(env.root()));
        let inner = env.new_scope(Some(outer));
        env.bind_symbol(outer, "a".into(), Symbol::new(Type::U8, Storage::Automatic(Some(0))));

        assert_eq!(env.lookup_symbol(inner, "a".into()).map(|s| &s.ty), Some(&Type::U8));
        assert!(env.lookup_symbol_max_depth(inner, "a".into(), 0).is_none());
        assert!(env.lookup_symbol_max_depth(inner, "a".into(), 1).is_some());
        assert_eq!(env.lookup_type(inner, "u16".into()), Some(&Type::U16));
    }

    #[test]
    fn test_unresolved_identifier() {
        let env = Environment::new();
        let err = env.resolve_symbol(env.root(), "nope".into(), None).unwrap_err();
        assert_eq!(err.to_string(), "use of unresolved identifier: `nope'");
    }

    #[test]
    fn test_clear_keeps_hand_made_bindings() {
        let mut env = Environment::new();
        let scope = env.new_scope(Some(env.root()));
        env.bind_symbol(scope, "manual".into(), Symbol::new(Type::U8, Storage::Static(None)));
        env.bind_symbol(
            scope,
            "declared".into(),
            Symbol::new(Type::U8, Storage::Static(None)).with_decl(NodeId::fresh()),
        );
        env.clear_declared_bindings(scope);
        assert!(env.lookup_symbol(scope, "manual".into()).is_some());
        assert!(env.lookup_symbol(scope, "declared".into()).is_none());
    }

    #[test]
    fn test_frame_allocation_delegates_to_owner() {
        let mut env = Environment::new();
        let func = env.new_scope_with_frame(Some(env.root()), Environment::function_frame());
        let block = env.new_scope(Some(func));
        assert_eq!(env.allocate(block, 1), 0);
        assert_eq!(env.allocate(func, 2), 1);
        assert_eq!(env.allocate(block, 1), 3);
    }

    #[test]
    fn test_temp_names_are_unique() {
        let mut env = Environment::new();
        let a = env.next_temp_name();
        let b = env.next_temp_name();
        assert_ne!(a, b);
        assert!(a.starts_with(TEMP_PREFIX));
    }

    #[test]
    fn test_enclosing_function_and_mangling() {
        let mut env = Environment::new();
        let module = env.new_scope(None);
        env.set_breadcrumb(
            module,
            Breadcrumb::Module {
                name: "m".into(),
                use_global_namespace: false,
            },
        );
        let func = env.new_scope_with_frame(Some(module), Environment::function_frame());
        let f = FunctionType::named("f".into(), "m_f".into(), Type::U8, vec![]);
        env.set_breadcrumb(func, Breadcrumb::Function(f.clone()));
        let block = env.new_scope(Some(func));

        assert_eq!(env.enclosing_function_type(block), Some(f));
        assert_eq!(env.mangle_name(block, "g".into()), "m_f_g");
        assert!(env.enclosing_function_type(module).is_none());
    }

    #[test]
    fn test_duplicate_module() {
        let mut env = Environment::new();
        let s = env.new_scope(None);
        env.register_module("m".into(), s, None).unwrap();
        let err = env.register_module("m".into(), s, None).unwrap_err();
        assert_eq!(err.to_string(), "module duplicates existing module \"m\"");
    }
}
