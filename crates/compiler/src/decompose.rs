//! # Expression Decomposition
//!
//! Rewrites compound expressions so every intermediate value lives in a
//! named compiler temporary. After this pass each operator, call, cast and
//! store applies to atoms only; the statements that compute those atoms
//! ride along in an `Eseq` attached to the enclosing statement.
//!
//! ## Architecture
//!
//! Decomposition is driven by a [`Context`] passed down explicitly:
//!
//! - [`Context::Concrete`] asks for the value itself, copied out of memory
//!   if necessary
//! - [`Context::Transient`] asks for the address of the value where it is
//!   addressable, so an outer member access or store can chain off it
//!   without copying
//! - [`Context::Type`] marks a type expression, which is never decomposed
//!
//! Preface statements are accumulated left to right into a buffer owned by
//! the enclosing statement. Every temporary is a `let` bound in the current
//! scope as soon as it is emitted, so later type queries can see it.
//!
//! A temporary is recognized by the `__temp` prefix together with a
//! primitive type. Such temporaries, literals, type expressions and names
//! of functions or types are atoms and are never extracted again, which
//! makes the pass idempotent.
//!
//! ## Example
//!
//! `a[f()] = g()` becomes
//!
//! ```text
//! let __temp0 = g()
//! let __temp1 = f()
//! let __temp2 = &a[__temp1]
//! __temp2.pointee = __temp0
//! ```

use log::trace;
use snap_typed_ast::{
    ArithmeticType, Assert, BooleanType, CompilerError, CompilerResult, Environment, Expr, ExprKind, ForIn,
    GotoIfFalse, If, InternedString, Match, Node, NodeKind, Return, Span, StorageClass, StructInitializerArgument, Type,
    UnaryOp, VarDeclaration, Visibility, While, COUNT, POINTEE, TEMP_PREFIX,
};

use crate::decl_scan;
use crate::pass::{
    walk_assert, walk_for_in, walk_goto_if_false, walk_if, walk_match, walk_return, walk_var_declaration,
    walk_while, Anchor, CompilerPass, PassState,
};

/// What the consumer of a decomposed expression needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    Concrete,
    Transient,
    Type,
}

/// A decomposed expression; `address` means `expr` is a temporary holding
/// a pointer to the value rather than the value itself
#[derive(Debug)]
struct Decomposed {
    expr: Expr,
    address: bool,
}

impl Decomposed {
    fn value(expr: Expr) -> Self {
        Self { expr, address: false }
    }

    fn address(expr: Expr) -> Self {
        Self { expr, address: true }
    }

    fn into_value(self) -> Expr {
        if self.address {
            Expr::pointee(self.expr)
        } else {
            self.expr
        }
    }
}

pub fn is_temporary(name: InternedString) -> bool {
    name.starts_with(TEMP_PREFIX)
}

fn is_type_expression(kind: &ExprKind) -> bool {
    matches!(
        kind,
        ExprKind::PrimitiveType(_)
            | ExprKind::PointerType(_)
            | ExprKind::ConstType(_)
            | ExprKind::MutableType(_)
            | ExprKind::ArrayType { .. }
            | ExprKind::DynamicArrayType(_)
            | ExprKind::FunctionType { .. }
            | ExprKind::GenericFunctionType(_)
            | ExprKind::GenericTypeApplication { .. }
            | ExprKind::UnionType(_)
    )
}

/// Prefix `value` with `preface`, if there is one
fn with_preface(preface: Vec<Node>, value: Expr) -> Expr {
    if preface.is_empty() {
        return value;
    }
    let span = value.span;
    Expr::eseq(preface, value).with_span(span)
}

pub struct DecomposePass<'e> {
    env: &'e mut Environment,
    state: PassState,
}

impl<'e> DecomposePass<'e> {
    pub fn new(env: &'e mut Environment) -> Self {
        Self {
            env,
            state: PassState::new(),
        }
    }

    fn is_temporary_atom(&self, name: InternedString) -> bool {
        is_temporary(name)
            && self
                .env
                .lookup_symbol(self.current_scope(), name)
                .map_or(false, |symbol| symbol.ty.is_primitive())
    }

    /// Expressions that are already irreducible
    fn is_atom(&mut self, expr: &Expr) -> CompilerResult<bool> {
        let scope = self.current_scope();
        Ok(match &expr.kind {
            ExprKind::LiteralInt(_) | ExprKind::LiteralBool(_) => true,
            ExprKind::Identifier(name) => match self.env.lookup_symbol(scope, *name) {
                None => true,
                Some(symbol) => {
                    symbol.ty.is_function()
                        || symbol.ty == Type::Label
                        || (is_temporary(*name) && symbol.ty.is_primitive())
                }
            },
            ExprKind::Get { expr: object, .. } => {
                let static_access = matches!(
                    &object.kind,
                    ExprKind::Identifier(name) if self.env.lookup_symbol(scope, *name).is_none()
                );
                let through_temporary = matches!(
                    &object.kind,
                    ExprKind::Identifier(name) if self.is_temporary_atom(*name)
                );
                if static_access {
                    true
                } else {
                    let ty = self.check(expr)?;
                    ty.is_function() || (through_temporary && !ty.is_primitive())
                }
            }
            kind => is_type_expression(kind),
        })
    }

    /// Emit `let __tempN = value` and return the temporary's name
    fn temporary(&mut self, value: Expr, preface: &mut Vec<Node>) -> CompilerResult<InternedString> {
        let name = self.env.next_temp_name();
        let span = value.span;
        let decl = VarDeclaration {
            identifier: name,
            explicit_type: None,
            expression: Some(value),
            storage: StorageClass::Automatic,
            is_mutable: false,
            visibility: Visibility::Private,
        };
        self.declare(decl, span, preface)?;
        Ok(name)
    }

    fn declare(
        &mut self,
        decl: VarDeclaration,
        span: Option<Span>,
        preface: &mut Vec<Node>,
    ) -> CompilerResult<()> {
        let node = Node::new(NodeKind::VarDeclaration(decl.clone())).with_span(span);
        let scope = self.current_scope();
        decl_scan::bind_variable(self.env, scope, Anchor::of_node(&node), &decl)?;
        trace!("[DECOMPOSE] temporary {}", decl.identifier);
        preface.push(node);
        Ok(())
    }

    /// Materialize `expr` as an atom
    fn extract(&mut self, expr: Expr, preface: &mut Vec<Node>) -> CompilerResult<Expr> {
        if self.is_atom(&expr)? {
            return Ok(expr);
        }
        let span = expr.span;
        let ty = self.check(&expr)?;
        if ty.is_primitive() {
            let temp = self.temporary(expr, preface)?;
            return Ok(Expr::identifier(temp).with_span(span));
        }
        let address = if self.check_lvalue(&expr)?.is_some() {
            Expr::address_of(expr)
        } else {
            let value = self.temporary(expr, preface)?;
            Expr::address_of(Expr::identifier(value))
        };
        let pointer = self.temporary(address, preface)?;
        Ok(Expr::pointee(Expr::identifier(pointer)).with_span(span))
    }

    /// The value of `expr` as an atom
    fn operand(&mut self, expr: Expr, preface: &mut Vec<Node>) -> CompilerResult<Expr> {
        let value = self.decompose(expr, Context::Concrete, preface)?.into_value();
        self.extract(value, preface)
    }

    /// A temporary pointing at the value of `expr`, copying rvalues into
    /// storage first
    fn address_of_value(&mut self, expr: Expr, preface: &mut Vec<Node>) -> CompilerResult<Expr> {
        if let ExprKind::Get { expr: object, member } = &expr.kind {
            if member.as_identifier().map_or(false, |m| m == POINTEE) {
                if let Some(name) = object.as_identifier() {
                    if self.is_temporary_atom(name) {
                        return Ok(Expr::identifier(name).with_span(object.span));
                    }
                }
            }
        }
        let decomposed = self.decompose(expr, Context::Transient, preface)?;
        if decomposed.address {
            return Ok(decomposed.expr);
        }
        let value = decomposed.expr;
        let pointer = if self.check_lvalue(&value)?.is_some() {
            self.temporary(Expr::address_of(value), preface)?
        } else {
            let copy = self.temporary(value, preface)?;
            self.temporary(Expr::address_of(Expr::identifier(copy)), preface)?
        };
        Ok(Expr::identifier(pointer))
    }

    /// The pointer a member access goes through
    fn object_pointer(&mut self, object: Expr, object_type: &Type, preface: &mut Vec<Node>) -> CompilerResult<Expr> {
        if object_type.is_pointer() {
            self.operand(object, preface)
        } else {
            self.address_of_value(object, preface)
        }
    }

    /// Base of a subscript: a bare variable as written, anything else
    /// through a pointer temporary
    fn subscript_base(&mut self, subscriptable: Expr, preface: &mut Vec<Node>) -> CompilerResult<Expr> {
        if let Some(name) = subscriptable.as_identifier() {
            if !is_temporary(name) {
                return Ok(subscriptable);
            }
        }
        let pointer = self.address_of_value(subscriptable, preface)?;
        Ok(Expr::pointee(pointer))
    }

    fn decompose(&mut self, expr: Expr, context: Context, preface: &mut Vec<Node>) -> CompilerResult<Decomposed> {
        if context == Context::Type || self.is_atom(&expr)? {
            return Ok(Decomposed::value(expr));
        }
        if matches!(expr.kind, ExprKind::Is { .. } | ExprKind::SizeOf(_) | ExprKind::TypeOf(_)) {
            return self.fold(expr).map(Decomposed::value);
        }
        let anchor = Anchor::of_expr(&expr);
        let span = expr.span;
        match expr.kind {
            ExprKind::Identifier(name) => {
                let pointer = self.temporary(Expr::address_of(Expr::identifier(name).with_span(span)), preface)?;
                if context == Context::Transient {
                    return Ok(Decomposed::address(Expr::identifier(pointer)));
                }
                let value = Expr::pointee(Expr::identifier(pointer)).with_span(span);
                if self.check(&value)?.is_primitive() {
                    let copy = self.temporary(value, preface)?;
                    Ok(Decomposed::value(Expr::identifier(copy).with_span(span)))
                } else {
                    Ok(Decomposed::value(value))
                }
            }
            ExprKind::Unary {
                op: UnaryOp::Ampersand,
                child,
            } => Ok(Decomposed::value(self.address_of(anchor, *child, preface)?)),
            ExprKind::Unary { op, child } => {
                let child = Box::new(self.operand(*child, preface)?);
                Ok(Decomposed::value(anchor.expr(ExprKind::Unary { op, child })))
            }
            ExprKind::Binary { op, left, right } => {
                let left = Box::new(self.operand(*left, preface)?);
                let right = Box::new(self.operand(*right, preface)?);
                Ok(Decomposed::value(anchor.expr(ExprKind::Binary { op, left, right })))
            }
            ExprKind::Assignment { lexpr, rexpr } => {
                let (lexpr, rexpr) = self.store(*lexpr, *rexpr, preface)?;
                Ok(Decomposed::value(anchor.expr(ExprKind::Assignment { lexpr, rexpr })))
            }
            ExprKind::InitialAssignment { lexpr, rexpr } => {
                let (lexpr, rexpr) = self.store(*lexpr, *rexpr, preface)?;
                Ok(Decomposed::value(anchor.expr(ExprKind::InitialAssignment { lexpr, rexpr })))
            }
            ExprKind::Call { callee, arguments } => {
                let callee = if self.is_atom(&callee)? {
                    callee
                } else {
                    Box::new(self.operand(*callee, preface)?)
                };
                let mut operands = Vec::with_capacity(arguments.len());
                for argument in arguments {
                    operands.push(self.operand(argument, preface)?);
                }
                Ok(Decomposed::value(anchor.expr(ExprKind::Call {
                    callee,
                    arguments: operands,
                })))
            }
            ExprKind::As { expr: inner, target_type } => {
                let inner = Box::new(self.operand(*inner, preface)?);
                let target_type = Box::new(self.decompose(*target_type, Context::Type, preface)?.expr);
                Ok(Decomposed::value(anchor.expr(ExprKind::As {
                    expr: inner,
                    target_type,
                })))
            }
            ExprKind::Bitcast { expr: inner, target_type } => {
                let inner = Box::new(self.operand(*inner, preface)?);
                let target_type = Box::new(self.decompose(*target_type, Context::Type, preface)?.expr);
                Ok(Decomposed::value(anchor.expr(ExprKind::Bitcast {
                    expr: inner,
                    target_type,
                })))
            }
            ExprKind::Subscript { subscriptable, argument } => {
                let argument = Box::new(self.operand(*argument, preface)?);
                let subscriptable = Box::new(self.subscript_base(*subscriptable, preface)?);
                let element = anchor.expr(ExprKind::Subscript { subscriptable, argument });
                let pointer = Expr::identifier(self.temporary(Expr::address_of(element), preface)?);
                Ok(match context {
                    Context::Transient => Decomposed::address(pointer),
                    _ => Decomposed::value(Expr::pointee(pointer).with_span(span)),
                })
            }
            ExprKind::Get { expr: object, member } => self.member_access(anchor, *object, *member, context, preface),
            ExprKind::StructInitializer { struct_type, arguments } => {
                self.struct_initializer(*struct_type, arguments, context, span, preface)
            }
            ExprKind::LiteralArray { array_type, elements } => {
                let mut operands = Vec::with_capacity(elements.len());
                for element in elements {
                    operands.push(self.operand(element, preface)?);
                }
                Ok(Decomposed::value(anchor.expr(ExprKind::LiteralArray {
                    array_type,
                    elements: operands,
                })))
            }
            ExprKind::Eseq { seq, expr: inner } => {
                for node in seq {
                    if let Some(node) = self.visit(node)? {
                        preface.push(node);
                    }
                }
                self.decompose(*inner, context, preface)
            }
            kind => Ok(Decomposed::value(anchor.expr(kind))),
        }
    }

    /// `&expr`; only the object of a member access or subscript is
    /// decomposed, the access itself stays under the `&`
    fn address_of(&mut self, anchor: Anchor, child: Expr, preface: &mut Vec<Node>) -> CompilerResult<Expr> {
        if child.as_identifier().is_some() || self.is_atom(&child)? {
            return Ok(anchor.expr(ExprKind::Unary {
                op: UnaryOp::Ampersand,
                child: Box::new(child),
            }));
        }
        let child_anchor = Anchor::of_expr(&child);
        let child = match child.kind {
            ExprKind::Get { expr: object, member } => {
                let object_type = self.check(&object)?;
                let pointer = self.object_pointer(*object, &object_type, preface)?;
                child_anchor.expr(ExprKind::Get {
                    expr: Box::new(pointer),
                    member,
                })
            }
            ExprKind::Subscript { subscriptable, argument } => {
                let argument = Box::new(self.operand(*argument, preface)?);
                let subscriptable = Box::new(self.subscript_base(*subscriptable, preface)?);
                child_anchor.expr(ExprKind::Subscript { subscriptable, argument })
            }
            kind => {
                let decomposed = self.decompose(child_anchor.expr(kind), Context::Transient, preface)?;
                if decomposed.address {
                    return Ok(decomposed.expr);
                }
                decomposed.expr
            }
        };
        Ok(anchor.expr(ExprKind::Unary {
            op: UnaryOp::Ampersand,
            child: Box::new(child),
        }))
    }

    fn member_access(
        &mut self,
        anchor: Anchor,
        object: Expr,
        member: Expr,
        context: Context,
        preface: &mut Vec<Node>,
    ) -> CompilerResult<Decomposed> {
        let member_name = member.as_identifier();
        let object_type = self.check(&object)?;
        let pointer = self.object_pointer(object, &object_type, preface)?;
        if object_type.is_pointer() && member_name.map_or(false, |m| m == POINTEE) {
            return Ok(match context {
                Context::Transient => Decomposed::address(pointer),
                _ => Decomposed::value(anchor.expr(ExprKind::Get {
                    expr: Box::new(pointer),
                    member: Box::new(member),
                })),
            });
        }
        let aggregate = object_type.as_pointee().cloned().unwrap_or(object_type);
        let is_count = member_name.map_or(false, |m| m == COUNT)
            && matches!(
                aggregate,
                Type::Array { .. } | Type::DynamicArray(_) | Type::ConstDynamicArray(_)
            );
        let access = anchor.expr(ExprKind::Get {
            expr: Box::new(pointer),
            member: Box::new(member),
        });
        match context {
            Context::Transient if !is_count => {
                let address = self.temporary(Expr::address_of(access), preface)?;
                Ok(Decomposed::address(Expr::identifier(address)))
            }
            _ => Ok(Decomposed::value(access)),
        }
    }

    /// Stores decompose the right-hand side first, then the target
    fn store(&mut self, lexpr: Expr, rexpr: Expr, preface: &mut Vec<Node>) -> CompilerResult<(Box<Expr>, Box<Expr>)> {
        let value = self.operand(rexpr, preface)?;
        let target = self.store_target(lexpr, preface)?;
        Ok((Box::new(target), Box::new(value)))
    }

    fn store_target(&mut self, lexpr: Expr, preface: &mut Vec<Node>) -> CompilerResult<Expr> {
        let anchor = Anchor::of_expr(&lexpr);
        match lexpr.kind {
            ExprKind::Get { expr: object, member } if member.as_identifier().map_or(true, |m| m != POINTEE) => {
                let object_type = self.check(&object)?;
                let pointer = self.object_pointer(*object, &object_type, preface)?;
                Ok(anchor.expr(ExprKind::Get {
                    expr: Box::new(pointer),
                    member,
                }))
            }
            kind => Ok(self
                .decompose(anchor.expr(kind), Context::Transient, preface)?
                .into_value()),
        }
    }

    /// A struct value is built in a backing temporary, one member store
    /// at a time
    fn struct_initializer(
        &mut self,
        struct_type: Expr,
        arguments: Vec<StructInitializerArgument>,
        context: Context,
        span: Option<Span>,
        preface: &mut Vec<Node>,
    ) -> CompilerResult<Decomposed> {
        let struct_type = self.decompose(struct_type, Context::Type, preface)?.expr;
        let backing = self.env.next_temp_name();
        self.declare(
            VarDeclaration {
                identifier: backing,
                explicit_type: Some(struct_type),
                expression: None,
                storage: StorageClass::Automatic,
                is_mutable: true,
                visibility: Visibility::Private,
            },
            span,
            preface,
        )?;
        let pointer = self.temporary(Expr::address_of(Expr::identifier(backing)), preface)?;
        for argument in arguments {
            let store = Expr::initial_assignment(Expr::get(Expr::identifier(pointer), argument.name), argument.expr)
                .with_span(span);
            let store = self.decompose(store, Context::Concrete, preface)?.into_value();
            preface.push(Node::expr(store));
        }
        Ok(match context {
            Context::Transient => Decomposed::address(Expr::identifier(pointer)),
            _ => Decomposed::value(Expr::pointee(Expr::identifier(pointer)).with_span(span)),
        })
    }

    /// Compile-time queries become literals
    fn fold(&mut self, expr: Expr) -> CompilerResult<Expr> {
        let span = expr.span;
        let anchor = Anchor::of_expr(&expr);
        let folded = match &expr.kind {
            ExprKind::TypeOf(inner) => ExprKind::PrimitiveType(self.check(inner)?),
            _ => match self.check(&expr)? {
                Type::Bool(BooleanType::CompTimeBool(value)) => ExprKind::LiteralBool(value),
                Type::Arithmetic(ArithmeticType::CompTimeInt(value)) => ExprKind::LiteralInt(value),
                other => {
                    return Err(CompilerError::internal(
                        format!("expected `{}' to evaluate at compile time, got `{}'", expr, other),
                        span,
                    ))
                }
            },
        };
        Ok(anchor.expr(folded))
    }

    /// A statement's expression, decomposed to a value in place
    fn statement_value(&mut self, expr: Expr) -> CompilerResult<Expr> {
        let mut preface = Vec::new();
        let value = self.decompose(expr, Context::Concrete, &mut preface)?.into_value();
        Ok(with_preface(preface, value))
    }

    /// A statement's expression, reduced to an atom
    fn statement_operand(&mut self, expr: Expr) -> CompilerResult<Expr> {
        let mut preface = Vec::new();
        let value = self.operand(expr, &mut preface)?;
        Ok(with_preface(preface, value))
    }
}

impl CompilerPass for DecomposePass<'_> {
    const DECL_SCAN: bool = true;

    fn name(&self) -> &'static str {
        "DECOMPOSE"
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

    /// Static initializers are laid down as data and stay intact
    fn visit_var_declaration(&mut self, anchor: Anchor, node: VarDeclaration) -> CompilerResult<Option<Node>> {
        if node.storage == StorageClass::Static {
            return walk_var_declaration(self, anchor, node);
        }
        let expression = node.expression.map(|e| self.statement_value(e)).transpose()?;
        walk_var_declaration(self, anchor, VarDeclaration { expression, ..node })
    }

    fn visit_expr_statement(&mut self, anchor: Anchor, expr: Expr) -> CompilerResult<Option<Node>> {
        Ok(Some(anchor.node(NodeKind::Expr(self.statement_value(expr)?))))
    }

    fn visit_if(&mut self, anchor: Anchor, node: If) -> CompilerResult<Option<Node>> {
        let condition = self.statement_operand(node.condition)?;
        walk_if(self, anchor, If { condition, ..node })
    }

    fn visit_while(&mut self, anchor: Anchor, node: While) -> CompilerResult<Option<Node>> {
        let condition = self.statement_operand(node.condition)?;
        walk_while(self, anchor, While { condition, ..node })
    }

    fn visit_for_in(&mut self, anchor: Anchor, node: ForIn) -> CompilerResult<Option<Node>> {
        let sequence = self.statement_operand(node.sequence)?;
        walk_for_in(self, anchor, ForIn { sequence, ..node })
    }

    fn visit_return(&mut self, anchor: Anchor, node: Return) -> CompilerResult<Option<Node>> {
        let expression = node.expression.map(|e| self.statement_operand(e)).transpose()?;
        walk_return(self, anchor, Return { expression })
    }

    fn visit_match(&mut self, anchor: Anchor, node: Match) -> CompilerResult<Option<Node>> {
        let expr = self.statement_operand(node.expr)?;
        walk_match(self, anchor, Match { expr, ..node })
    }

    fn visit_assert(&mut self, anchor: Anchor, node: Assert) -> CompilerResult<Option<Node>> {
        let condition = self.statement_operand(node.condition)?;
        walk_assert(self, anchor, Assert { condition, ..node })
    }

    fn visit_goto_if_false(&mut self, anchor: Anchor, node: GotoIfFalse) -> CompilerResult<Option<Node>> {
        let condition = self.statement_operand(node.condition)?;
        walk_goto_if_false(self, anchor, GotoIfFalse { condition, ..node })
    }

    /// Expressions reached outside a statement's value position are types
    fn visit_expr(&mut self, expr: Expr) -> CompilerResult<Option<Expr>> {
        Ok(Some(expr))
    }
}

/// Decompose every expression in `node` into temporaries
pub fn decompose(env: &mut Environment, node: Node) -> CompilerResult<Node> {
    DecomposePass::new(env).lower(node)
}
