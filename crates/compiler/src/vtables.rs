//! # Trait Erasure
//!
//! Lowers traits to plain structs so no later stage needs to know about
//! dynamic dispatch.
//!
//! ## Architecture
//!
//! ### Trait declarations
//! Each trait declaration is replaced by three declarations and then
//! disappears from the tree:
//! - the vtable struct `__T_vtable`, const, one function-pointer slot per
//!   member with the receiver erased to `*void`
//! - the trait-object struct `__T_object { object: *void, vtable: *const __T_vtable }`
//! - `impl __T_object { .. }`, one forwarding thunk per member calling
//!   `self.vtable.m(self.object, ..)`
//!
//! ### Implementations
//! `impl T for S { .. }` becomes `impl S { .. }` plus a static vtable
//! instance `__T_S_vtable_instance` whose slots, sorted by member name, hold
//! `&S.m` cast to the slot type.
//!
//! ### Trait values
//! Type names that resolve to a trait are renamed to its trait-object
//! struct. A struct (or pointer to a struct) stored into a trait-typed
//! declaration, assignment or cast becomes a trait-object initializer:
//! `__T_object { object: bitcast(&s, *void), vtable: &__T_S_vtable_instance }`.

use log::trace;
use snap_typed_ast::mangler;
use snap_typed_ast::nominal::{self, TRAIT_OBJECT_FIELD, TRAIT_VTABLE_FIELD};
use snap_typed_ast::{
    CompilerError, CompilerResult, Environment, Expr, ExprKind, Impl, ImplFor, Node, NodeKind, Seq, Span,
    StructDeclaration, StructMember, TraitDeclaration, TraitRef, Type, VarDeclaration,
};

use crate::decl_scan;
use crate::pass::{bind_var_declaration, visit_var_declaration_children, walk_expr, Anchor, CompilerPass, PassState};

pub struct VtablesPass<'e> {
    env: &'e mut Environment,
    state: PassState,
}

impl<'e> VtablesPass<'e> {
    pub fn new(env: &'e mut Environment) -> Self {
        Self {
            env,
            state: PassState::new(),
        }
    }

    /// The trait a resolved type erases to, if any
    fn trait_of(ty: &Type) -> Option<TraitRef> {
        match ty {
            Type::Trait(t) | Type::ConstTrait(t) => Some(*t),
            _ => None,
        }
    }

    /// Trait and value type when storing a `value_type` into `target_type`
    /// builds a trait object
    fn trait_conversion(&self, target_type: &Type, value_type: Type) -> Option<(TraitRef, Type)> {
        let tref = Self::trait_of(target_type)?;
        if Self::trait_of(&value_type).is_some() {
            return None;
        }
        Some((tref, value_type))
    }

    fn trait_object_initializer(
        &mut self,
        tref: TraitRef,
        value_type: &Type,
        value: Expr,
        span: Option<Span>,
    ) -> CompilerResult<Expr> {
        let (sref, object) = match value_type {
            Type::Struct(s) | Type::ConstStruct(s) => (*s, Expr::address_of(value)),
            Type::Pointer(p) | Type::ConstPointer(p) => match p.as_struct() {
                Some(s) => (s, value),
                None => return Err(not_a_trait_value(value_type, tref, span)),
            },
            _ => return Err(not_a_trait_value(value_type, tref, span)),
        };
        let object_name = self.env.types.trait_info(tref.id).trait_object_type_name;
        let instance = mangler::vtable_instance_name(tref.name, sref.name);
        trace!("[VTABLES] {} as trait object of {}", sref.name, tref.name);
        Ok(Expr::struct_initializer(
            Expr::identifier(object_name),
            vec![
                (
                    TRAIT_OBJECT_FIELD.into(),
                    Expr::bitcast(object, Expr::primitive_type(Type::pointer(Type::Void))),
                ),
                (TRAIT_VTABLE_FIELD.into(), Expr::address_of(Expr::identifier(instance))),
            ],
        )
        .with_span(span))
    }

    /// A type name that denotes a trait refers to the trait-object struct
    fn rename_trait(&self, expr: Expr) -> Expr {
        let Some(name) = expr.as_identifier() else {
            return expr;
        };
        let scope = self.current_scope();
        if self.env.lookup_symbol(scope, name).is_some() {
            return expr;
        }
        match self.env.lookup_type(scope, name).and_then(Self::trait_of) {
            Some(tref) => {
                let object_name = self.env.types.trait_info(tref.id).trait_object_type_name;
                expr.with_kind(ExprKind::Identifier(object_name))
            }
            None => expr,
        }
    }

    fn rewrite_store(&mut self, expr: Expr) -> CompilerResult<Expr> {
        let conversion = match &expr.kind {
            ExprKind::Assignment { lexpr, rexpr } | ExprKind::InitialAssignment { lexpr, rexpr } => {
                match self.check_lvalue(lexpr)? {
                    Some(target) => {
                        let value_type = self.check(rexpr)?;
                        self.trait_conversion(&target, value_type)
                    }
                    None => None,
                }
            }
            _ => None,
        };
        let span = expr.span;
        let rebuilt = walk_expr(self, expr)?;
        let Some((tref, value_type)) = conversion else {
            return Ok(rebuilt);
        };
        let anchor = Anchor::of_expr(&rebuilt);
        Ok(match rebuilt.kind {
            ExprKind::Assignment { lexpr, rexpr } => anchor.expr(ExprKind::Assignment {
                lexpr,
                rexpr: Box::new(self.trait_object_initializer(tref, &value_type, *rexpr, span)?),
            }),
            ExprKind::InitialAssignment { lexpr, rexpr } => anchor.expr(ExprKind::InitialAssignment {
                lexpr,
                rexpr: Box::new(self.trait_object_initializer(tref, &value_type, *rexpr, span)?),
            }),
            kind => anchor.expr(kind),
        })
    }

    fn rewrite_cast(&mut self, expr: Expr) -> CompilerResult<Expr> {
        let conversion = match &expr.kind {
            ExprKind::As { expr: inner, target_type } => {
                let target = self.check_type_expr(target_type)?;
                let value_type = self.check(inner)?;
                self.trait_conversion(&target, value_type)
            }
            _ => None,
        };
        let span = expr.span;
        let rebuilt = walk_expr(self, expr)?;
        let anchor = Anchor::of_expr(&rebuilt);
        match (conversion, rebuilt.kind) {
            (Some((tref, value_type)), ExprKind::As { expr: inner, .. }) => {
                self.trait_object_initializer(tref, &value_type, *inner, span)
            }
            (_, kind) => Ok(anchor.expr(kind)),
        }
    }

    fn vtable_declaration(&self, tref: TraitRef, decl: &TraitDeclaration, span: Option<Span>) -> Node {
        let vtable_name = self.env.types.trait_info(tref.id).vtable_type_name;
        let members = nominal::vtable_fields(self.env, tref)
            .into_iter()
            .map(|(name, slot)| StructMember {
                name,
                member_type: Expr::primitive_type(slot),
            })
            .collect();
        Node::new(NodeKind::StructDeclaration(StructDeclaration {
            identifier: vtable_name,
            type_arguments: vec![],
            members,
            visibility: decl.visibility,
            is_const: true,
            associated_trait: Some(decl.identifier),
        }))
        .with_span(span)
    }

    fn trait_object_declaration(&self, tref: TraitRef, decl: &TraitDeclaration, span: Option<Span>) -> Node {
        let info = self.env.types.trait_info(tref.id);
        let members = vec![
            StructMember {
                name: TRAIT_OBJECT_FIELD.into(),
                member_type: Expr::pointer_type(Expr::primitive_type(Type::Void)),
            },
            StructMember {
                name: TRAIT_VTABLE_FIELD.into(),
                member_type: Expr::pointer_type(Expr::const_type(Expr::identifier(info.vtable_type_name))),
            },
        ];
        Node::new(NodeKind::StructDeclaration(StructDeclaration {
            identifier: info.trait_object_type_name,
            type_arguments: vec![],
            members,
            visibility: decl.visibility,
            is_const: false,
            associated_trait: Some(decl.identifier),
        }))
        .with_span(span)
    }
}

fn not_a_trait_value(ty: &Type, tref: TraitRef, span: Option<Span>) -> CompilerError {
    CompilerError::type_mismatch(
        format!("cannot convert value of type `{}' to trait `{}'", ty, tref.name),
        span,
    )
}

impl CompilerPass for VtablesPass<'_> {
    const DECL_SCAN: bool = true;

    fn name(&self) -> &'static str {
        "VTABLES"
    }

    fn env(&mut self) -> &mut Environment {
        self.env
    }

    fn env_ref(&self) -> &Environment {
        self.env
    }

    fn state(&mut self) -> &mut PassState {
        &mut self.state
    }

    fn state_ref(&self) -> &PassState {
        &self.state
    }

    fn visit_trait_declaration(&mut self, anchor: Anchor, node: TraitDeclaration) -> CompilerResult<Option<Node>> {
        if node.is_generic() {
            return Ok(Some(anchor.node(NodeKind::TraitDeclaration(node))));
        }
        let scope = self.current_scope();
        let tref = self
            .env
            .resolve_type(scope, node.identifier, anchor.span)?
            .as_trait()
            .ok_or_else(|| CompilerError::internal(format!("`{}' is not a trait", node.identifier), anchor.span))?;
        let vtable = self.vtable_declaration(tref, &node, anchor.span);
        let object = self.trait_object_declaration(tref, &node, anchor.span);
        let thunks = decl_scan::thunk_impl(self.env, scope, tref, &node, anchor.span)?;
        trace!("[VTABLES] erased trait {}", node.identifier);
        Ok(Some(anchor.node(NodeKind::Seq(Seq {
            children: vec![vtable, object, thunks],
        }))))
    }

    fn visit_impl_for(&mut self, anchor: Anchor, node: ImplFor) -> CompilerResult<Option<Node>> {
        let trait_type = self.check_type_expr(&node.trait_type)?;
        let tref = Self::trait_of(&trait_type).ok_or_else(|| {
            CompilerError::type_mismatch(
                format!("impl-for requires a trait type, got `{}'", trait_type),
                node.trait_type.span.or(anchor.span),
            )
        })?;
        let sref = self
            .check_type_expr(&node.struct_type)?
            .as_struct()
            .ok_or_else(|| CompilerError::internal("impl-for target is not a struct", anchor.span))?;
        let visibility = self
            .env
            .lookup_type_record(self.current_scope(), tref.name)
            .map(|record| record.visibility)
            .unwrap_or_default();

        let struct_type = self.visit_required(node.struct_type)?;
        let children = self.visit_children(node.children)?;
        let instance =
            decl_scan::vtable_instance_declaration(self.env, tref, sref.name, &struct_type, visibility, anchor.span);
        let imp = Node::new(NodeKind::Impl(Impl { struct_type, children })).with_span(anchor.span);
        trace!("[VTABLES] impl {} for {}", tref.name, sref.name);
        Ok(Some(anchor.node(NodeKind::Seq(Seq {
            children: vec![imp, instance],
        }))))
    }

    fn visit_var_declaration(&mut self, anchor: Anchor, node: VarDeclaration) -> CompilerResult<Option<Node>> {
        let conversion = match (&node.explicit_type, &node.expression) {
            (Some(explicit), Some(expression)) => {
                let target = self.check_type_expr(explicit)?;
                let value_type = self.check(expression)?;
                self.trait_conversion(&target, value_type)
            }
            _ => None,
        };
        let mut decl = visit_var_declaration_children(self, node.clone())?;
        if let Some((tref, value_type)) = conversion {
            decl.expression = match decl.expression {
                Some(value) => Some(self.trait_object_initializer(tref, &value_type, value, anchor.span)?),
                None => None,
            };
        }
        bind_var_declaration(self, anchor, &node)?;
        Ok(Some(anchor.node(NodeKind::VarDeclaration(decl))))
    }

    fn visit_expr(&mut self, expr: Expr) -> CompilerResult<Option<Expr>> {
        let rewritten = match &expr.kind {
            ExprKind::Identifier(_) => self.rename_trait(expr),
            ExprKind::Assignment { .. } | ExprKind::InitialAssignment { .. } => self.rewrite_store(expr)?,
            ExprKind::As { .. } => self.rewrite_cast(expr)?,
            _ => walk_expr(self, expr)?,
        };
        Ok(Some(rewritten))
    }
}

/// Erase traits from `node`
pub fn vtables(env: &mut Environment, node: Node) -> CompilerResult<Node> {
    VtablesPass::new(env).lower(node)
}
