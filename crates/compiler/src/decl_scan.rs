//! # Declaration Scanning
//!
//! Binds the declarations of a block into its scope before any statement of
//! the block is visited, so functions, structs and traits can be referenced
//! ahead of their declaration and may be mutually recursive.
//!
//! ## Phases
//!
//! The direct children of a block (looking through `Seq`) are scanned in a
//! fixed order, each phase seeing everything bound by the earlier ones:
//!
//! 1. modules, then imports
//! 2. struct identities; generic struct, trait and function templates
//! 3. trait identities
//! 4. typealiases
//! 5. struct layouts
//! 6. trait members, vtable and trait-object structs, trait-object thunks
//! 7. function signatures
//! 8. `impl` blocks, then `impl ... for` blocks with trait conformance
//! 9. static vtable instances
//! 10. labels
//!
//! Other variables are not forward-declared; the pass binds each one as its
//! declaration is visited.
//!
//! ## Rescanning
//!
//! Every scanning pass sees the same scopes. [`prepare_tree`] drops the
//! bindings a previous pass derived from declarations before a new pass
//! starts, and struct and trait identities are keyed by declaring scope and
//! name so a rescan reuses them.

use log::{debug, trace};
use snap_typed_ast::mangler;
use snap_typed_ast::nominal::{self, TRAIT_OBJECT_FIELD, TRAIT_VTABLE_FIELD};
use snap_typed_ast::type_registry::{GenericFunctionInfo, GenericStructInfo, GenericTraitInfo};
use snap_typed_ast::{
    Breadcrumb, CompilerError, CompilerResult, Environment, Expr, ExprKind, FunctionDeclaration, FunctionType,
    Impl, ImplFor, Import, InternedString, Module, Node, NodeId, NodeKind, ScopeId, Span, StorageClass, Storage,
    StructDeclaration, Symbol, TraitDeclaration, TraitRef, Type, TypeChecker, TypeRecord, Typealias,
    VarDeclaration, Visibility,
};

use crate::pass::{visit_branch, Anchor, CompilerPass};

/// Name bound in a function scope for the return slot
pub const RETURN_VALUE: &str = "__returnValue";

/// Drop stale declaration-derived bindings from every scope of `tree`
pub fn prepare_tree(env: &mut Environment, tree: &Node) {
    let mut scopes = Vec::new();
    let mut modules = Vec::new();
    tree.walk_nodes(&mut |node| match &node.kind {
        NodeKind::Block(block) => scopes.push(block.scope),
        NodeKind::Module(module) => modules.push(module.name),
        _ => {}
    });
    trace!("[DECL_SCAN] clearing {} scopes", scopes.len());
    for scope in scopes {
        env.clear_declared_bindings(scope);
    }
    for module in modules {
        env.forget_module(module);
    }
    env.reset_static_frame();
}

fn flatten<'a>(children: &'a [Node], out: &mut Vec<&'a Node>) {
    for child in children {
        match &child.kind {
            NodeKind::Seq(seq) => flatten(&seq.children, out),
            _ => out.push(child),
        }
    }
}

/// Scan the declarations among `children` into the pass's current scope
pub fn scan_block<P: CompilerPass>(pass: &mut P, children: &[Node]) -> CompilerResult<()> {
    let mut decls = Vec::new();
    flatten(children, &mut decls);
    if decls.is_empty() {
        return Ok(());
    }
    let scope = pass.current_scope();
    debug!("[DECL_SCAN] scope {} ({} declarations)", scope.0, decls.len());

    for node in &decls {
        if let NodeKind::Module(module) = &node.kind {
            scan_module(pass, node, module)?;
        }
    }

    let mut scanner = DeclScanner::new(pass.env(), scope);
    scanner.scan(&decls)
}

/// A module's block is rewritten while its parent is scanned, so that its
/// public bindings exist before any import is resolved
fn scan_module<P: CompilerPass>(pass: &mut P, node: &Node, module: &Module) -> CompilerResult<()> {
    let scope = module
        .scope()
        .ok_or_else(|| CompilerError::internal("module body is not a block", node.span))?;
    pass.env().register_module(module.name, scope, node.span)?;
    pass.env().set_breadcrumb(
        scope,
        Breadcrumb::Module {
            name: module.name,
            use_global_namespace: false,
        },
    );
    let block = visit_branch(pass, (*module.block).clone())?;
    let rebuilt = Anchor::of_node(node).node(NodeKind::Module(Module {
        name: module.name,
        block: Box::new(block),
    }));
    pass.state().scanned_modules.insert(module.name, rebuilt);
    Ok(())
}

/// Binds the declarations of one scope
pub struct DeclScanner<'e> {
    env: &'e mut Environment,
    scope: ScopeId,
}

impl<'e> DeclScanner<'e> {
    pub fn new(env: &'e mut Environment, scope: ScopeId) -> Self {
        Self { env, scope }
    }

    fn type_checker_in(&mut self, scope: ScopeId) -> TypeChecker<'_> {
        TypeChecker::new(&mut *self.env, scope)
    }

    fn resolve(&mut self, expr: &Expr) -> CompilerResult<Type> {
        let scope = self.scope;
        self.type_checker_in(scope).check_type_expr(expr)
    }

    /// Run every phase over the flattened declarations of the scope
    pub fn scan(&mut self, decls: &[&Node]) -> CompilerResult<()> {
        for node in decls {
            if let NodeKind::Import(import) = &node.kind {
                self.scan_import(import, node.id, node.span)?;
            }
        }
        for node in decls {
            match &node.kind {
                NodeKind::StructDeclaration(decl) => self.reserve_struct(decl, node.id, node.span)?,
                NodeKind::TraitDeclaration(decl) if decl.is_generic() => {
                    self.scan_generic_trait(decl, node.id, node.span)?
                }
                NodeKind::FunctionDeclaration(func) if func.is_generic() => {
                    let scope = self.scope;
                    self.scan_function(scope, scope, node.id, func, node.span)?;
                }
                _ => {}
            }
        }
        for node in decls {
            if let NodeKind::TraitDeclaration(decl) = &node.kind {
                if !decl.is_generic() {
                    self.reserve_trait(decl, node.id, node.span)?;
                }
            }
        }
        for node in decls {
            if let NodeKind::Typealias(alias) = &node.kind {
                self.scan_typealias(alias, node.id, node.span)?;
            }
        }
        for node in decls {
            if let NodeKind::StructDeclaration(decl) = &node.kind {
                if !decl.is_generic() {
                    self.layout_struct(decl, node.span)?;
                }
            }
        }
        for node in decls {
            if let NodeKind::TraitDeclaration(decl) = &node.kind {
                if !decl.is_generic() {
                    self.scan_trait_members(decl, node.id, node.span)?;
                }
            }
        }
        for node in decls {
            if let NodeKind::FunctionDeclaration(func) = &node.kind {
                if !func.is_generic() {
                    let scope = self.scope;
                    self.scan_function(scope, scope, node.id, func, node.span)?;
                }
            }
        }
        for node in decls {
            if let NodeKind::Impl(imp) = &node.kind {
                self.scan_impl(imp, node.span)?;
            }
        }
        for node in decls {
            if let NodeKind::ImplFor(imp) = &node.kind {
                self.scan_impl_for(imp, node.id, node.span)?;
            }
        }
        for node in decls {
            if let NodeKind::VarDeclaration(decl) = &node.kind {
                if is_vtable_instance(decl) {
                    self.declare_vtable_instance(decl, node.id, node.span)?;
                }
            }
        }
        for node in decls {
            if let NodeKind::LabelDeclaration(label) = &node.kind {
                self.check_redefinition(self.scope, label.identifier, node.id, "label", node.span)?;
                let symbol = Symbol::new(Type::Label, Storage::Static(None)).with_decl(node.id);
                self.env.bind_symbol(self.scope, label.identifier, symbol);
            }
        }
        Ok(())
    }

    /// A name may be bound once per scope; the declaration that made the
    /// existing binding may bind it again
    pub fn check_redefinition(
        &self,
        scope: ScopeId,
        name: InternedString,
        decl: NodeId,
        what: &str,
        span: Option<Span>,
    ) -> CompilerResult<()> {
        if let Some(symbol) = self.env.lookup_symbol_max_depth(scope, name, 0) {
            if symbol.decl != Some(decl) {
                return Err(CompilerError::redefinition(
                    format!("{} redefines existing symbol: `{}'", what, name),
                    span,
                ));
            }
        }
        if let Some(record) = self.env.lookup_type_record_max_depth(scope, name, 0) {
            if record.decl != Some(decl) {
                return Err(CompilerError::redefinition(
                    format!("{} redefines existing type: `{}'", what, name),
                    span,
                ));
            }
        }
        Ok(())
    }

    pub fn scan_import(&mut self, import: &Import, decl: NodeId, span: Option<Span>) -> CompilerResult<()> {
        if let Some(parent) = self.env.parent(self.scope) {
            if parent != self.env.root() {
                return Err(CompilerError::structural("declaration is only valid at file scope", span));
            }
        }
        let name = import.module_name;
        let module_scope = self.env.module(name).ok_or_else(|| CompilerError::UnresolvedIdentifier {
            message: format!("failed to get symbols for module `{}'", name),
            span,
        })?;
        if !self.env.mark_imported(self.scope, name) {
            trace!("[DECL_SCAN] module {} already imported", name);
            return Ok(());
        }
        let symbols: Vec<(InternedString, Symbol)> = self
            .env
            .scope(module_scope)
            .symbols
            .iter()
            .filter(|(_, symbol)| symbol.visibility == Visibility::Public)
            .map(|(n, s)| (*n, s.clone()))
            .collect();

        if import.into_global_namespace {
            let types: Vec<(InternedString, TypeRecord)> = self
                .env
                .scope(module_scope)
                .types
                .iter()
                .filter(|(_, record)| record.visibility == Visibility::Public)
                .map(|(n, r)| (*n, r.clone()))
                .collect();
            for (identifier, mut symbol) in symbols {
                if self.env.symbol_exists(self.scope, identifier, 0) {
                    return Err(CompilerError::redefinition(
                        format!("import of module `{}' redefines existing symbol: `{}'", name, identifier),
                        span,
                    ));
                }
                symbol.visibility = Visibility::Private;
                symbol.decl = Some(decl);
                self.env.bind_symbol(self.scope, identifier, symbol);
            }
            for (identifier, mut record) in types {
                if self.env.type_exists(self.scope, identifier, 0) {
                    return Err(CompilerError::redefinition(
                        format!("import of module `{}' redefines existing type: `{}'", name, identifier),
                        span,
                    ));
                }
                record.visibility = Visibility::Private;
                record.decl = Some(decl);
                self.env.bind_type(self.scope, identifier, record);
            }
            return Ok(());
        }

        if self.env.symbol_exists(self.scope, name, 0) {
            return Err(CompilerError::redefinition(
                format!("import of module `{}' redefines existing symbol: `{}'", name, name),
                span,
            ));
        }
        let namespace = nominal::reserve_struct(self.env, self.scope, name, false, None);
        let sref = namespace
            .as_struct()
            .ok_or_else(|| CompilerError::internal("module namespace is not a struct", span))?;
        self.env.types.struct_info_mut(sref.id).associated_module = Some(name);
        let fields = self.env.types.struct_info(sref.id).fields;
        for (identifier, symbol) in symbols {
            self.env.bind_symbol(fields, identifier, symbol);
        }
        let symbol = Symbol::new(namespace, Storage::Static(None)).with_decl(decl).initialized();
        self.env.bind_symbol(self.scope, name, symbol);
        Ok(())
    }

    fn reserve_struct(&mut self, decl: &StructDeclaration, id: NodeId, span: Option<Span>) -> CompilerResult<()> {
        self.check_redefinition(self.scope, decl.identifier, id, "struct declaration", span)?;
        if decl.is_generic() {
            let g = self.env.types.register_generic_struct(GenericStructInfo {
                name: decl.identifier,
                template: decl.clone(),
                scope: self.scope,
                instantiations: Default::default(),
            });
            self.bind_type(decl.identifier, Type::GenericStruct(g), decl.visibility, id);
            return Ok(());
        }
        let associated_trait = self.associated_trait(decl);
        let ty = nominal::reserve_struct(self.env, self.scope, decl.identifier, decl.is_const, associated_trait);
        self.bind_type(decl.identifier, ty, decl.visibility, id);
        Ok(())
    }

    /// The trait a synthesized vtable or trait-object struct belongs to. Once
    /// the trait declaration has been erased the earlier association stands.
    fn associated_trait(&self, decl: &StructDeclaration) -> Option<Type> {
        let name = decl.associated_trait?;
        match self.env.lookup_type(self.scope, name) {
            Some(ty @ Type::Trait(_)) => Some(ty.clone()),
            _ => {
                let id = self.env.types.struct_key(self.scope, decl.identifier)?;
                self.env.types.struct_info(id).associated_trait.clone()
            }
        }
    }

    fn bind_type(&mut self, name: InternedString, ty: Type, visibility: Visibility, decl: NodeId) {
        self.env.bind_type(
            self.scope,
            name,
            TypeRecord {
                ty,
                visibility,
                decl: Some(decl),
            },
        );
    }

    fn layout_struct(&mut self, decl: &StructDeclaration, span: Option<Span>) -> CompilerResult<()> {
        let ty = self.env.resolve_type(self.scope, decl.identifier, span)?;
        let sref = ty
            .as_struct()
            .ok_or_else(|| CompilerError::internal(format!("`{}' is not a struct", decl.identifier), span))?;
        let mut members = Vec::with_capacity(decl.members.len());
        for member in &decl.members {
            members.push((member.name, self.resolve(&member.member_type)?));
        }
        nominal::layout_struct_fields(self.env, sref, &members, span)
    }

    fn scan_generic_trait(&mut self, decl: &TraitDeclaration, id: NodeId, span: Option<Span>) -> CompilerResult<()> {
        self.check_redefinition(self.scope, decl.identifier, id, "trait declaration", span)?;
        let g = self.env.types.register_generic_trait(GenericTraitInfo {
            name: decl.identifier,
            template: decl.clone(),
            scope: self.scope,
            instantiations: Default::default(),
        });
        self.bind_type(decl.identifier, Type::GenericTrait(g), decl.visibility, id);
        Ok(())
    }

    fn reserve_trait(&mut self, decl: &TraitDeclaration, id: NodeId, span: Option<Span>) -> CompilerResult<()> {
        self.check_redefinition(self.scope, decl.identifier, id, "trait declaration", span)?;
        let mangled = self.env.mangle_name(self.scope, decl.identifier);
        let ty = nominal::reserve_trait(self.env, self.scope, decl.identifier, mangled);
        self.bind_type(decl.identifier, ty, decl.visibility, id);
        Ok(())
    }

    fn scan_trait_members(&mut self, decl: &TraitDeclaration, id: NodeId, span: Option<Span>) -> CompilerResult<()> {
        let tref = self
            .env
            .resolve_type(self.scope, decl.identifier, span)?
            .as_trait()
            .ok_or_else(|| CompilerError::internal(format!("`{}' is not a trait", decl.identifier), span))?;
        let mut members = Vec::with_capacity(decl.members.len());
        for member in &decl.members {
            members.push((member.name, self.resolve(&member.member_type)?));
        }
        nominal::bind_trait_members(self.env, tref, &members);
        nominal::declare_trait_support_types(self.env, self.scope, tref, decl.visibility, Some(id), span)?;
        let thunks = thunk_impl(self.env, self.scope, tref, decl, span)?;
        if let NodeKind::Impl(imp) = &thunks.kind {
            self.scan_impl(imp, span)?;
        }
        trace!("[DECL_SCAN] trait {} with {} members", decl.identifier, members.len());
        Ok(())
    }

    fn scan_typealias(&mut self, alias: &Typealias, id: NodeId, span: Option<Span>) -> CompilerResult<()> {
        self.check_redefinition(self.scope, alias.identifier, id, "typealias", span)?;
        let ty = self.resolve(&alias.expression)?;
        self.bind_type(alias.identifier, ty, alias.visibility, id);
        Ok(())
    }

    /// Bind a function in `bind_scope`, named as if declared in `mangle_scope`
    pub fn scan_function(
        &mut self,
        bind_scope: ScopeId,
        mangle_scope: ScopeId,
        id: NodeId,
        func: &FunctionDeclaration,
        span: Option<Span>,
    ) -> CompilerResult<Type> {
        self.check_redefinition(bind_scope, func.identifier, id, "function", span)?;
        if func.is_generic() {
            let g = self.env.types.register_generic_function(GenericFunctionInfo {
                name: func.identifier,
                template: func.clone(),
                scope: bind_scope,
                instantiations: Default::default(),
            });
            let ty = Type::GenericFunction(g);
            let symbol = Symbol::new(ty.clone(), Storage::Static(None))
                .with_decl(id)
                .with_visibility(func.visibility)
                .initialized();
            self.env.bind_symbol(bind_scope, func.identifier, symbol);
            return Ok(ty);
        }

        let function_scope = func
            .scope()
            .ok_or_else(|| CompilerError::internal("function body is not a block", span))?;
        let signature_scope = self.env.parent(function_scope).unwrap_or(bind_scope);
        let mut signature = match self.type_checker_in(signature_scope).check_type_expr(&func.function_type)? {
            Type::Function(f) => f,
            other => {
                return Err(CompilerError::type_mismatch(
                    format!("expected a function type, got `{}'", other),
                    span,
                ))
            }
        };
        if signature.arguments.len() != func.argument_names.len() {
            return Err(CompilerError::structural(
                format!(
                    "function `{}' names {} arguments but its type has {}",
                    func.identifier,
                    func.argument_names.len(),
                    signature.arguments.len()
                ),
                span,
            ));
        }
        signature.name = Some(func.identifier);
        signature.mangled_name = Some(self.env.mangle_name(mangle_scope, func.identifier));
        signature.decl = Some(id);
        self.env.set_breadcrumb(function_scope, Breadcrumb::Function(signature.clone()));
        self.bind_arguments(function_scope, id, func, &signature);

        let ty = Type::Function(signature);
        let symbol = Symbol::new(ty.clone(), Storage::Static(None))
            .with_decl(id)
            .with_visibility(func.visibility)
            .initialized();
        self.env.bind_symbol(bind_scope, func.identifier, symbol);
        Ok(ty)
    }

    /// Arguments sit below the save area in reverse order, the return slot
    /// below the arguments
    fn bind_arguments(&mut self, scope: ScopeId, id: NodeId, func: &FunctionDeclaration, signature: &FunctionType) {
        let mut offset = self.env.layout().sizeof_save_area();
        for (name, ty) in func.argument_names.iter().zip(&signature.arguments).rev() {
            offset += self.env.sizeof(ty);
            let symbol = Symbol::new(ty.corresponding_const_type(), Storage::Automatic(Some(-(offset as i64))))
                .with_decl(id)
                .initialized();
            self.env.bind_symbol(scope, *name, symbol);
        }
        if *signature.return_type != Type::Void {
            offset += self.env.sizeof(&signature.return_type);
            let symbol = Symbol::new((*signature.return_type).clone(), Storage::Automatic(Some(-(offset as i64))))
                .with_decl(id);
            self.env.bind_symbol(scope, RETURN_VALUE.into(), symbol);
        }
    }

    fn impl_struct_type(&mut self, struct_type: &Expr, span: Option<Span>) -> CompilerResult<Type> {
        let ty = self.resolve(struct_type)?;
        match ty {
            Type::Struct(_) | Type::ConstStruct(_) => Ok(ty),
            other => Err(CompilerError::type_mismatch(
                format!("impl requires a struct type, got `{}'", other),
                struct_type.span.or(span),
            )),
        }
    }

    /// Methods are bound in the struct's member scope and mangle as `S_m`
    pub fn scan_impl(&mut self, imp: &Impl, span: Option<Span>) -> CompilerResult<()> {
        let ty = self.impl_struct_type(&imp.struct_type, span)?;
        self.bind_methods(&ty, &imp.children, span)
    }

    fn bind_methods(&mut self, ty: &Type, children: &[Node], span: Option<Span>) -> CompilerResult<()> {
        let sref = ty
            .as_struct()
            .ok_or_else(|| CompilerError::internal("impl target is not a struct", span))?;
        let fields = self.env.types.struct_info(sref.id).fields;
        for child in children {
            let func = child.as_function().ok_or_else(|| {
                CompilerError::structural("impl blocks may only contain function declarations", child.span.or(span))
            })?;
            self.scan_function(fields, fields, child.id, func, child.span.or(span))?;
        }
        Ok(())
    }

    pub fn scan_impl_for(&mut self, imp: &ImplFor, id: NodeId, span: Option<Span>) -> CompilerResult<()> {
        let trait_type = self.resolve(&imp.trait_type)?;
        let tref = trait_type.as_trait().ok_or_else(|| {
            CompilerError::type_mismatch(
                format!("impl-for requires a trait type, got `{}'", trait_type),
                imp.trait_type.span.or(span),
            )
        })?;
        let struct_type = self.impl_struct_type(&imp.struct_type, span)?;
        self.bind_methods(&struct_type, &imp.children, span)?;
        self.check_conformance(tref, &struct_type, span)?;

        let sref = struct_type
            .as_struct()
            .ok_or_else(|| CompilerError::internal("impl target is not a struct", span))?;
        let info = self.env.types.trait_info(tref.id).clone();
        let vtable_type = self.env.resolve_type(self.scope, info.vtable_type_name, span)?;
        let visibility = self
            .env
            .lookup_type_record(self.scope, tref.name)
            .map(|record| record.visibility)
            .unwrap_or_default();
        let instance = mangler::vtable_instance_name(tref.name, sref.name);
        let symbol = Symbol::new(vtable_type, Storage::Static(None))
            .with_decl(id)
            .with_visibility(visibility)
            .initialized();
        self.env.bind_symbol(self.scope, instance, symbol);
        trace!("[DECL_SCAN] {} implements {}", sref.name, tref.name);
        Ok(())
    }

    /// Vtable instances are referenced by trait-object initializers anywhere
    /// in their scope, so they are bound ahead of their declaration
    fn declare_vtable_instance(&mut self, decl: &VarDeclaration, id: NodeId, span: Option<Span>) -> CompilerResult<()> {
        let Some(explicit) = &decl.explicit_type else {
            return Ok(());
        };
        self.check_redefinition(self.scope, decl.identifier, id, "constant", span)?;
        let ty = self.resolve(explicit)?.corresponding_const_type();
        let offset = self.env.allocate_static(self.env.sizeof(&ty));
        let symbol = Symbol::new(ty, Storage::Static(Some(offset)))
            .with_decl(id)
            .with_visibility(decl.visibility)
            .initialized();
        self.env.bind_symbol(self.scope, decl.identifier, symbol);
        Ok(())
    }

    fn check_conformance(&mut self, tref: TraitRef, struct_type: &Type, span: Option<Span>) -> CompilerResult<()> {
        let sref = struct_type
            .as_struct()
            .ok_or_else(|| CompilerError::internal("impl target is not a struct", span))?;
        let trait_self = Type::pointer(Type::Trait(tref));
        let struct_self = Type::pointer(Type::Struct(sref));
        for (method, required) in nominal::sorted_trait_members(self.env, tref) {
            let actual = nominal::struct_member(self.env, sref, method)
                .and_then(|symbol| symbol.ty.as_function().cloned())
                .ok_or_else(|| {
                    CompilerError::type_mismatch(
                        format!(
                            "`{}' does not implement all trait methods; missing `{}'.",
                            sref.name, method
                        ),
                        span,
                    )
                })?;
            let expected = required
                .as_pointee()
                .and_then(Type::as_function)
                .cloned()
                .ok_or_else(|| CompilerError::internal(format!("trait member `{}' is not a function pointer", method), span))?;
            let incompatible = |what: String| {
                CompilerError::type_mismatch(
                    format!(
                        "`{}' method `{}' has incompatible type for trait `{}'; {}",
                        sref.name, method, tref.name, what
                    ),
                    span,
                )
            };
            if actual.arguments.len() != expected.arguments.len() {
                return Err(CompilerError::type_mismatch(
                    format!(
                        "`{}' method `{}' has {} parameter but the declaration in the `{}' trait has {}.",
                        sref.name,
                        method,
                        actual.arguments.len(),
                        tref.name,
                        expected.arguments.len()
                    ),
                    span,
                ));
            }
            for (index, (got, want)) in actual.arguments.iter().zip(&expected.arguments).enumerate() {
                if got == want {
                    continue;
                }
                let want = if index == 0 && *want == trait_self {
                    &struct_self
                } else {
                    want
                };
                if got != want {
                    return Err(incompatible(format!("expected `{}' argument, got `{}' instead", want, got)));
                }
            }
            if actual.return_type != expected.return_type {
                return Err(incompatible(format!(
                    "expected `{}' return value, got `{}' instead",
                    expected.return_type, actual.return_type
                )));
            }
        }
        Ok(())
    }
}

fn is_vtable_instance(decl: &VarDeclaration) -> bool {
    decl.storage == StorageClass::Static
        && decl.identifier.starts_with("__")
        && decl.identifier.as_string().ends_with("_vtable_instance")
}

/// Bind a variable as its declaration is visited
pub fn bind_variable(env: &mut Environment, scope: ScopeId, anchor: Anchor, decl: &VarDeclaration) -> CompilerResult<()> {
    let declared_ahead = env
        .lookup_symbol_max_depth(scope, decl.identifier, 0)
        .map_or(false, |symbol| symbol.decl == Some(anchor.id));
    if declared_ahead {
        return Ok(());
    }
    let what = if decl.is_mutable { "variable" } else { "constant" };
    DeclScanner::new(env, scope).check_redefinition(scope, decl.identifier, anchor.id, what, anchor.span)?;

    let mut tc = TypeChecker::new(env, scope);
    let explicit = decl.explicit_type.as_ref().map(|t| tc.check_type_expr(t)).transpose()?;
    let initial = decl.expression.as_ref().map(|e| tc.check(e)).transpose()?;
    let ty = match (explicit, initial) {
        (Some(explicit), Some(initial)) => {
            tc.check_convertibility(&initial, &explicit, false)
                .into_result()
                .map_err(|e| e.or_span(decl.expression.as_ref().and_then(|e| e.span).or(anchor.span)))?;
            explicit
        }
        (Some(explicit), None) => explicit,
        (None, Some(initial)) => initial.corresponding_mutable_type(),
        (None, None) => {
            return Err(CompilerError::structural(
                format!("unable to deduce type of {} `{}'", what, decl.identifier),
                anchor.span,
            ))
        }
    };
    let ty = if decl.is_mutable { ty } else { ty.corresponding_const_type() };

    let size = env.sizeof(&ty);
    let storage = match decl.storage {
        StorageClass::Automatic if env.is_inside_function(scope) => Storage::Automatic(Some(env.allocate(scope, size))),
        _ => Storage::Static(Some(env.allocate_static(size))),
    };
    let mut symbol = Symbol::new(ty, storage)
        .with_decl(anchor.id)
        .with_visibility(decl.visibility);
    if decl.expression.is_some() {
        symbol = symbol.initialized();
    }
    trace!("[DECL_SCAN] bind {} {} : {}", what, decl.identifier, symbol.ty);
    env.bind_symbol(scope, decl.identifier, symbol);
    Ok(())
}

/// Bind the element variable of a for-in loop in the loop body's scope
pub fn bind_loop_variable(
    env: &mut Environment,
    scope: ScopeId,
    body_scope: ScopeId,
    body: NodeId,
    identifier: InternedString,
    sequence: &Expr,
) -> CompilerResult<()> {
    let sequence_type = TypeChecker::new(env, scope).check(sequence)?;
    let container = match sequence_type.as_pointee() {
        Some(pointee) if pointee.as_element().is_some() => pointee.clone(),
        _ => sequence_type.clone(),
    };
    let element = container.as_element().cloned().ok_or_else(|| {
        CompilerError::type_mismatch(
            format!("for-in loop requires an iterable sequence, got `{}'", sequence_type),
            sequence.span,
        )
    })?;
    let element = element.corresponding_mutable_type();
    let storage = if env.is_inside_function(body_scope) {
        Storage::Automatic(Some(env.allocate(body_scope, env.sizeof(&element))))
    } else {
        Storage::Static(Some(env.allocate_static(env.sizeof(&element))))
    };
    env.bind_symbol(body_scope, identifier, Symbol::new(element, storage).with_decl(body));
    Ok(())
}

/// Bind the narrowed value of a match clause in the clause's block
pub fn bind_clause_value(
    env: &mut Environment,
    scope: ScopeId,
    block_scope: ScopeId,
    block: NodeId,
    identifier: InternedString,
    value_type: &Expr,
) -> CompilerResult<()> {
    let ty = TypeChecker::new(env, scope).check_type_expr(value_type)?;
    let size = env.sizeof(&ty);
    let storage = if env.is_inside_function(block_scope) {
        Storage::Automatic(Some(env.allocate(block_scope, size)))
    } else {
        Storage::Static(Some(env.allocate_static(size)))
    };
    env.bind_symbol(block_scope, identifier, Symbol::new(ty, storage).with_decl(block).initialized());
    Ok(())
}

fn receives_trait(argument: &Expr, trait_name: InternedString) -> Option<bool> {
    let ExprKind::PointerType(pointee) = &argument.kind else {
        return None;
    };
    match &pointee.kind {
        ExprKind::Identifier(name) if *name == trait_name => Some(false),
        ExprKind::ConstType(inner) if inner.as_identifier() == Some(trait_name) => Some(true),
        ExprKind::GenericTypeApplication { identifier, .. } if *identifier == trait_name => Some(false),
        _ => None,
    }
}

/// `impl __T_object { func m(self: *__T_object, ..) { self.vtable.m(self.object, ..) } }`
pub fn thunk_impl(
    env: &mut Environment,
    scope: ScopeId,
    tref: TraitRef,
    decl: &TraitDeclaration,
    span: Option<Span>,
) -> CompilerResult<Node> {
    let object_name = env.types.trait_info(tref.id).trait_object_type_name;
    let mut thunks = Vec::with_capacity(decl.members.len());
    for member in &decl.members {
        let (return_type, mut arguments) = match &member.member_type.kind {
            ExprKind::PointerType(inner) => match &inner.kind {
                ExprKind::FunctionType {
                    return_type, arguments, ..
                } => ((**return_type).clone(), arguments.clone()),
                _ => return Err(not_a_method(member.name, span)),
            },
            _ => return Err(not_a_method(member.name, span)),
        };
        if let Some(first) = arguments.first_mut() {
            match receives_trait(first, decl.identifier) {
                Some(false) => *first = Expr::pointer_type(Expr::identifier(object_name)),
                Some(true) => *first = Expr::pointer_type(Expr::const_type(Expr::identifier(object_name))),
                None => {}
            }
        }
        let argument_names: Vec<InternedString> = (0..arguments.len())
            .map(|i| if i == 0 { "self".into() } else { format!("arg{}", i).into() })
            .collect();
        let callee = Expr::get(Expr::get(Expr::identifier("self"), TRAIT_VTABLE_FIELD), member.name);
        let call_arguments = std::iter::once(Expr::get(Expr::identifier("self"), TRAIT_OBJECT_FIELD))
            .chain(argument_names.iter().skip(1).map(|n| Expr::identifier(*n)))
            .collect();
        let call = Expr::call(callee, call_arguments);
        let returns_value = TypeChecker::new(env, scope).check_type_expr(&return_type)? != Type::Void;
        let statement = if returns_value { Node::ret(Some(call)) } else { Node::expr(call) };

        let function_scope = env.new_scope_with_frame(Some(scope), Environment::function_frame());
        let function_type = Expr::new(ExprKind::FunctionType {
            name: Some(member.name),
            return_type: Box::new(return_type),
            arguments,
        });
        thunks.push(
            Node::new(NodeKind::FunctionDeclaration(FunctionDeclaration {
                identifier: member.name,
                function_type,
                argument_names,
                type_arguments: vec![],
                body: Box::new(Node::block(function_scope, vec![statement])),
                visibility: decl.visibility,
            }))
            .with_span(span),
        );
    }
    Ok(Node::new(NodeKind::Impl(Impl {
        struct_type: Expr::identifier(object_name),
        children: thunks,
    }))
    .with_span(span))
}

fn not_a_method(name: InternedString, span: Option<Span>) -> CompilerError {
    CompilerError::structural(format!("trait member `{}' must be a function pointer", name), span)
}

/// The static vtable instance for `struct_expr` implementing `tref`: each
/// slot, in member-name order, holds `&S.m` cast to the slot's pointer type
pub fn vtable_instance_declaration(
    env: &Environment,
    tref: TraitRef,
    struct_name: InternedString,
    struct_expr: &Expr,
    visibility: Visibility,
    span: Option<Span>,
) -> Node {
    let vtable_name = env.types.trait_info(tref.id).vtable_type_name;
    let slots = nominal::vtable_fields(env, tref)
        .into_iter()
        .map(|(method, slot)| {
            let target = Expr::address_of(Expr::get(struct_expr.clone(), method));
            (method, Expr::bitcast(target, Expr::primitive_type(slot)))
        })
        .collect();
    Node::new(NodeKind::VarDeclaration(VarDeclaration {
        identifier: mangler::vtable_instance_name(tref.name, struct_name),
        explicit_type: Some(Expr::identifier(vtable_name)),
        expression: Some(Expr::struct_initializer(Expr::identifier(vtable_name), slots)),
        storage: StorageClass::Static,
        is_mutable: false,
        visibility,
    }))
    .with_span(span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use snap_typed_ast::typed_builder::function_type;
    use snap_typed_ast::TypedASTBuilder;

    fn scan(env: &mut Environment, scope: ScopeId, nodes: &[Node]) -> CompilerResult<()> {
        let refs: Vec<&Node> = nodes.iter().collect();
        DeclScanner::new(env, scope).scan(&refs)
    }

    #[test]
    fn test_function_arguments_below_save_area() {
        let mut env = Environment::new();
        let mut b = TypedASTBuilder::new(&mut env);
        let block = b.begin_block();
        let fscope = b.begin_function();
        let f = b.end_function(
            "f",
            Expr::identifier("u8"),
            vec![("a", Expr::identifier("u8")), ("b", Expr::identifier("u16"))],
            vec![],
        );
        b.end_block(vec![]);
        scan(&mut env, block, &[f]).unwrap();

        let b_sym = env.lookup_symbol(fscope, "b".into()).unwrap();
        assert_eq!(b_sym.storage, Storage::Automatic(Some(-3)));
        assert_eq!(b_sym.ty, Type::U16.corresponding_const_type());
        let a_sym = env.lookup_symbol(fscope, "a".into()).unwrap();
        assert_eq!(a_sym.storage, Storage::Automatic(Some(-4)));
        let ret = env.lookup_symbol(fscope, RETURN_VALUE.into()).unwrap();
        assert_eq!(ret.storage, Storage::Automatic(Some(-5)));
        assert_eq!(env.enclosing_function_type(fscope).and_then(|f| f.mangled_name), Some("f".into()));
    }

    #[test]
    fn test_forward_reference_between_structs() {
        let mut env = Environment::new();
        let mut b = TypedASTBuilder::new(&mut env);
        let block = b.begin_block();
        let a = b.struct_decl("A", vec![("next", Expr::pointer_type(Expr::identifier("B")))]);
        let bb = b.struct_decl("B", vec![("value", Expr::identifier("u16")), ("a", Expr::pointer_type(Expr::identifier("A")))]);
        b.end_block(vec![]);
        scan(&mut env, block, &[a, bb]).unwrap();
        let b_type = env.lookup_type(block, "B".into()).cloned().unwrap();
        assert_eq!(env.sizeof(&b_type), 2);
    }

    #[test]
    fn test_duplicate_function_is_a_redefinition() {
        let mut env = Environment::new();
        let mut b = TypedASTBuilder::new(&mut env);
        let block = b.begin_block();
        b.begin_function();
        let f1 = b.end_function("f", Expr::identifier("void"), vec![], vec![]);
        b.begin_function();
        let f2 = b.end_function("f", Expr::identifier("void"), vec![], vec![]);
        b.end_block(vec![]);
        let err = scan(&mut env, block, &[f1, f2]).unwrap_err();
        assert_eq!(err.message(), "function redefines existing symbol: `f'");
    }

    #[test]
    fn test_rescan_of_same_declaration_is_allowed() {
        let mut env = Environment::new();
        let mut b = TypedASTBuilder::new(&mut env);
        let block = b.begin_block();
        b.begin_function();
        let f = b.end_function("f", Expr::identifier("void"), vec![], vec![]);
        b.end_block(vec![]);
        scan(&mut env, block, std::slice::from_ref(&f)).unwrap();
        scan(&mut env, block, std::slice::from_ref(&f)).unwrap();
    }

    #[test]
    fn test_impl_methods_mangle_with_struct_name() {
        let mut env = Environment::new();
        let mut b = TypedASTBuilder::new(&mut env);
        let block = b.begin_block();
        let s = b.struct_decl("Circle", vec![("r", Expr::identifier("u16"))]);
        b.begin_function();
        let area = b.end_function(
            "area",
            Expr::identifier("u16"),
            vec![("self", Expr::pointer_type(Expr::identifier("Circle")))],
            vec![],
        );
        let imp = b.impl_block("Circle", vec![area]);
        b.end_block(vec![]);
        scan(&mut env, block, &[s, imp]).unwrap();

        let sref = env.lookup_type(block, "Circle".into()).and_then(Type::as_struct).unwrap();
        let method = nominal::struct_member(&env, sref, "area".into()).unwrap();
        assert_eq!(method.ty.as_function().and_then(|f| f.mangled_name), Some("Circle_area".into()));
        // methods do not count towards the layout
        assert_eq!(env.sizeof(&Type::Struct(sref)), 1);
    }

    #[test]
    fn test_variable_binding_and_deduction() {
        let mut env = Environment::new();
        let scope = env.new_scope(Some(env.root()));
        let decl = VarDeclaration {
            identifier: "a".into(),
            explicit_type: None,
            expression: Some(Expr::literal_int(300)),
            storage: StorageClass::Static,
            is_mutable: false,
            visibility: Visibility::Private,
        };
        let anchor = Anchor {
            id: NodeId::fresh(),
            span: None,
        };
        bind_variable(&mut env, scope, anchor, &decl).unwrap();
        let symbol = env.lookup_symbol(scope, "a".into()).unwrap();
        assert_eq!(symbol.ty, Type::U16.corresponding_const_type());
        assert_eq!(symbol.storage, Storage::Static(Some(0)));

        let err = bind_variable(
            &mut env,
            scope,
            Anchor {
                id: NodeId::fresh(),
                span: None,
            },
            &decl,
        )
        .unwrap_err();
        assert_eq!(err.message(), "constant redefines existing symbol: `a'");
    }

    #[test]
    fn test_vtable_instance_slots_are_sorted() {
        let mut env = Environment::new();
        let mut b = TypedASTBuilder::new(&mut env);
        let block = b.begin_block();
        let self_ptr = || Expr::pointer_type(Expr::identifier("Shape"));
        let shape = b.trait_decl(
            "Shape",
            vec![
                ("perimeter", function_type(None, Expr::identifier("u16"), vec![self_ptr()])),
                ("area", function_type(None, Expr::identifier("u16"), vec![self_ptr()])),
            ],
        );
        b.end_block(vec![]);
        scan(&mut env, block, &[shape]).unwrap();

        let tref = env.lookup_type(block, "Shape".into()).and_then(Type::as_trait).unwrap();
        let node = vtable_instance_declaration(
            &env,
            tref,
            "Circle".into(),
            &Expr::identifier("Circle"),
            Visibility::Private,
            None,
        );
        let decl = node.as_var_declaration().unwrap();
        assert_eq!(decl.identifier, "__Shape_Circle_vtable_instance");
        let Some(ExprKind::StructInitializer { arguments, .. }) = decl.expression.as_ref().map(|e| &e.kind) else {
            panic!("expected a struct initializer");
        };
        let names: Vec<String> = arguments.iter().map(|a| a.name.as_string()).collect();
        assert_eq!(names, vec!["area", "perimeter"]);
    }
}
