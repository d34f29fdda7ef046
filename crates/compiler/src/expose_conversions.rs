//! # Implicit Conversion Exposure
//!
//! Makes every implicit conversion the type checker accepts visible in the
//! tree, so later passes only ever see values whose type matches the slot
//! they flow into.
//!
//! ## Architecture
//!
//! A conversion site pairs a value with the type of its destination:
//! - a var declaration initializer with an explicit type
//! - the right-hand side of an assignment
//! - a return value and the enclosing function's return type
//! - a call argument and the matching parameter type
//! - a struct-initializer argument and the member type
//! - the operands of an arithmetic binary and their common type
//!
//! At each site the value is rewritten by [`ExposeConversionsPass::convert`]:
//! identity conversions are untouched, a value implicitly taken by address
//! gets an explicit `&`, a struct becoming a trait object is cast from its
//! address, and anything else is wrapped in an `As` to the destination type.
//! Stores into a union keep the bare value because union erasure lowers
//! those without a temporary.

use log::trace;
use snap_typed_ast::nominal;
use snap_typed_ast::{
    ArithmeticType, BooleanType, CompilerError, CompilerResult, Environment, Expr, ExprKind, FunctionType, Node,
    NodeKind, Return, StructInitializerArgument, Type, VarDeclaration,
};

use crate::pass::{bind_var_declaration, visit_var_declaration_children, walk_expr, Anchor, CompilerPass, PassState};

/// Where a converted value ends up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Site {
    /// Stored into a declared binding or an lvalue
    Store,
    /// Passed along as a value: argument, return value, operand
    Value,
}

pub struct ExposeConversionsPass<'e> {
    env: &'e mut Environment,
    state: PassState,
}

impl<'e> ExposeConversionsPass<'e> {
    pub fn new(env: &'e mut Environment) -> Self {
        Self {
            env,
            state: PassState::new(),
        }
    }

    /// Rewrite `expr`, of type `from`, into a value of type `to`
    fn convert(&mut self, expr: Expr, from: &Type, to: &Type, site: Site) -> CompilerResult<Expr> {
        if from == to || from.same_modulo_const(to) || from.is_function() || to.is_function() {
            return Ok(expr);
        }
        let span = expr.span;
        match to {
            Type::Union(_) if site == Site::Store => Ok(expr),
            Type::Union(_) => {
                trace!("[EXPOSE_CONVERSIONS] {} into union `{}'", expr, to);
                Ok(Expr::as_cast(expr, Expr::primitive_type(to.corresponding_mutable_type())).with_span(span))
            }
            Type::Trait(_) | Type::ConstTrait(_) => {
                let object = match from {
                    Type::Struct(_) | Type::ConstStruct(_) if self.check_lvalue(&expr)?.is_some() => {
                        Expr::address_of(expr)
                    }
                    _ => expr,
                };
                trace!("[EXPOSE_CONVERSIONS] {} as trait `{}'", object, to);
                Ok(Expr::as_cast(object, Expr::primitive_type(to.corresponding_mutable_type())).with_span(span))
            }
            Type::Pointer(pointee) | Type::ConstPointer(pointee) if !from.is_pointer() => {
                if from.same_modulo_const(pointee) && self.check_lvalue(&expr)?.is_some() {
                    trace!("[EXPOSE_CONVERSIONS] implicit address of {}", expr);
                    Ok(Expr::address_of(expr).with_span(span))
                } else {
                    Ok(expr)
                }
            }
            _ if is_comp_time(from) => Ok(expr),
            _ => {
                if !self.type_checker().check_convertibility(from, to, false).is_acceptable() {
                    return Ok(expr);
                }
                trace!("[EXPOSE_CONVERSIONS] {} from `{}' to `{}'", expr, from, to);
                Ok(Expr::as_cast(expr, Expr::primitive_type(to.corresponding_mutable_type())).with_span(span))
            }
        }
    }

    fn rewrite_store(&mut self, expr: Expr) -> CompilerResult<Expr> {
        let types = match &expr.kind {
            ExprKind::Assignment { lexpr, rexpr } | ExprKind::InitialAssignment { lexpr, rexpr } => {
                match self.check_lvalue(lexpr)? {
                    Some(target) => Some((self.check(rexpr)?, target)),
                    None => None,
                }
            }
            _ => None,
        };
        let rebuilt = walk_expr(self, expr)?;
        let Some((from, to)) = types else {
            return Ok(rebuilt);
        };
        let anchor = Anchor::of_expr(&rebuilt);
        Ok(match rebuilt.kind {
            ExprKind::Assignment { lexpr, rexpr } => anchor.expr(ExprKind::Assignment {
                lexpr,
                rexpr: Box::new(self.convert(*rexpr, &from, &to, Site::Store)?),
            }),
            ExprKind::InitialAssignment { lexpr, rexpr } => anchor.expr(ExprKind::InitialAssignment {
                lexpr,
                rexpr: Box::new(self.convert(*rexpr, &from, &to, Site::Store)?),
            }),
            kind => anchor.expr(kind),
        })
    }

    fn rewrite_call(&mut self, expr: Expr) -> CompilerResult<Expr> {
        let mut conversions = Vec::new();
        if let ExprKind::Call { callee, arguments } = &expr.kind {
            let callee_type = self.check(callee)?;
            let function = match &callee_type {
                Type::Function(f) => Some(f.clone()),
                Type::Pointer(p) | Type::ConstPointer(p) => p.as_function().cloned(),
                _ => None,
            };
            if let Some(function) = function.filter(|f| f.arguments.len() == arguments.len()) {
                for (argument, expected) in arguments.iter().zip(function.arguments) {
                    conversions.push((self.check(argument)?, expected));
                }
            }
        }
        let rebuilt = walk_expr(self, expr)?;
        if conversions.is_empty() {
            return Ok(rebuilt);
        }
        let anchor = Anchor::of_expr(&rebuilt);
        Ok(match rebuilt.kind {
            ExprKind::Call { callee, arguments } => {
                let arguments = arguments
                    .into_iter()
                    .zip(conversions)
                    .map(|(argument, (from, to))| self.convert(argument, &from, &to, Site::Value))
                    .collect::<CompilerResult<Vec<_>>>()?;
                anchor.expr(ExprKind::Call { callee, arguments })
            }
            kind => anchor.expr(kind),
        })
    }

    fn rewrite_struct_initializer(&mut self, expr: Expr) -> CompilerResult<Expr> {
        let mut conversions = Vec::new();
        if let ExprKind::StructInitializer { struct_type, arguments } = &expr.kind {
            if let Some(sref) = self.check_type_expr(struct_type)?.as_struct() {
                for argument in arguments {
                    let member = nominal::struct_member(self.env, sref, argument.name).map(|s| s.ty.clone());
                    let value = self.check(&argument.expr)?;
                    conversions.push(member.map(|to| (value, to)));
                }
            }
        }
        let rebuilt = walk_expr(self, expr)?;
        if conversions.is_empty() {
            return Ok(rebuilt);
        }
        let anchor = Anchor::of_expr(&rebuilt);
        Ok(match rebuilt.kind {
            ExprKind::StructInitializer { struct_type, arguments } => {
                let arguments = arguments
                    .into_iter()
                    .zip(conversions)
                    .map(|(argument, conversion)| {
                        let expr = match conversion {
                            // A struct member is stored into, not passed
                            Some((from, to)) => {
                                self.convert(argument.expr, &from, &to.corresponding_mutable_type(), Site::Store)?
                            }
                            None => argument.expr,
                        };
                        Ok(StructInitializerArgument { expr, ..argument })
                    })
                    .collect::<CompilerResult<Vec<_>>>()?;
                anchor.expr(ExprKind::StructInitializer { struct_type, arguments })
            }
            kind => anchor.expr(kind),
        })
    }

    fn rewrite_binary(&mut self, expr: Expr) -> CompilerResult<Expr> {
        let operand_types = match &expr.kind {
            ExprKind::Binary { left, right, .. } => {
                let lt = self.check(left)?;
                let rt = self.check(right)?;
                let common = if lt == rt || is_comp_time(&lt) || is_comp_time(&rt) {
                    None
                } else {
                    self.type_checker().binary_operand_type(&lt, &rt)
                };
                common.map(|common| (lt, rt, common))
            }
            _ => None,
        };
        let rebuilt = walk_expr(self, expr)?;
        let Some((lt, rt, common)) = operand_types else {
            return Ok(rebuilt);
        };
        let anchor = Anchor::of_expr(&rebuilt);
        Ok(match rebuilt.kind {
            ExprKind::Binary { op, left, right } => anchor.expr(ExprKind::Binary {
                op,
                left: Box::new(self.convert(*left, &lt, &common, Site::Value)?),
                right: Box::new(self.convert(*right, &rt, &common, Site::Value)?),
            }),
            kind => anchor.expr(kind),
        })
    }

    fn return_type(&self, anchor: Anchor) -> CompilerResult<FunctionType> {
        self.env
            .enclosing_function_type(self.current_scope())
            .ok_or_else(|| CompilerError::structural("return is invalid outside of a function", anchor.span))
    }
}

fn is_comp_time(ty: &Type) -> bool {
    matches!(
        ty,
        Type::Arithmetic(ArithmeticType::CompTimeInt(_)) | Type::Bool(BooleanType::CompTimeBool(_))
    )
}

impl CompilerPass for ExposeConversionsPass<'_> {
    const DECL_SCAN: bool = true;

    fn name(&self) -> &'static str {
        "EXPOSE_CONVERSIONS"
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

    fn visit_var_declaration(&mut self, anchor: Anchor, node: VarDeclaration) -> CompilerResult<Option<Node>> {
        let types = match (&node.explicit_type, &node.expression) {
            (Some(explicit), Some(expression)) => {
                let to = self.check_type_expr(explicit)?;
                Some((self.check(expression)?, to))
            }
            _ => None,
        };
        let mut decl = visit_var_declaration_children(self, node.clone())?;
        if let (Some((from, to)), Some(value)) = (types, decl.expression.take()) {
            decl.expression = Some(self.convert(value, &from, &to, Site::Store)?);
        }
        bind_var_declaration(self, anchor, &node)?;
        Ok(Some(anchor.node(NodeKind::VarDeclaration(decl))))
    }

    fn visit_return(&mut self, anchor: Anchor, node: Return) -> CompilerResult<Option<Node>> {
        let function = self.return_type(anchor)?;
        let expected = *function.return_type;
        let Some(value) = node.expression else {
            if expected != Type::Void {
                return Err(CompilerError::type_mismatch(
                    "non-void function should return a value",
                    anchor.span,
                ));
            }
            return Ok(Some(anchor.node(NodeKind::Return(Return { expression: None }))));
        };
        let from = self.check(&value)?;
        if expected == Type::Void {
            if from == Type::Void {
                let expression = Some(self.visit_required(value)?);
                return Ok(Some(anchor.node(NodeKind::Return(Return { expression }))));
            }
            return Err(CompilerError::type_mismatch(
                "unexpected non-void return value in void function",
                value.span.or(anchor.span),
            ));
        }
        if !self.type_checker().check_convertibility(&from, &expected, false).is_acceptable() {
            return Err(CompilerError::type_mismatch(
                format!(
                    "cannot convert return expression of type `{}' to return type `{}'",
                    from, expected
                ),
                value.span.or(anchor.span),
            ));
        }
        let value = self.visit_required(value)?;
        let expression = Some(self.convert(value, &from, &expected, Site::Value)?);
        Ok(Some(anchor.node(NodeKind::Return(Return { expression }))))
    }

    fn visit_expr(&mut self, expr: Expr) -> CompilerResult<Option<Expr>> {
        let rewritten = match &expr.kind {
            ExprKind::Assignment { .. } | ExprKind::InitialAssignment { .. } => self.rewrite_store(expr)?,
            ExprKind::Call { .. } => self.rewrite_call(expr)?,
            ExprKind::StructInitializer { .. } => self.rewrite_struct_initializer(expr)?,
            ExprKind::Binary { .. } => self.rewrite_binary(expr)?,
            _ => walk_expr(self, expr)?,
        };
        Ok(Some(rewritten))
    }
}

/// Make the implicit conversions in `node` explicit
pub fn expose_conversions(env: &mut Environment, node: Node) -> CompilerResult<Node> {
    ExposeConversionsPass::new(env).lower(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use snap_typed_ast::typed_builder::union_type;
    use snap_typed_ast::{BinaryOp, TypedASTBuilder};

    fn init_logging() {
        let _ = env_logger::builder()
            .is_test(true)
            .filter_level(log::LevelFilter::Trace)
            .try_init();
    }

    #[test]
    fn test_widening_store_gets_an_explicit_cast() {
        init_logging();
        let mut env = Environment::new();
        let mut b = TypedASTBuilder::new(&mut env);
        b.begin_block();
        let a = b.var("a", Some(Expr::identifier("u8")), Some(Expr::literal_int(1)));
        let w = b.var("w", Some(Expr::identifier("u16")), Some(Expr::identifier("a")));
        let store = Node::expr(Expr::assignment(Expr::identifier("w"), Expr::identifier("a")));
        let tree = b.end_block(vec![a, w, store]);

        let out = expose_conversions(&mut env, tree).unwrap();
        let block = out.as_block().unwrap();
        let a = block.children[0].as_var_declaration().unwrap();
        assert_eq!(a.expression.as_ref().unwrap().to_string(), "1");
        let w = block.children[1].as_var_declaration().unwrap();
        assert_eq!(w.expression.as_ref().unwrap().to_string(), "(a as u16)");
        assert_eq!(block.children[2].as_expr().unwrap().to_string(), "w = (a as u16)");
    }

    #[test]
    fn test_call_arguments_and_return_value_are_converted() {
        init_logging();
        let mut env = Environment::new();
        let mut b = TypedASTBuilder::new(&mut env);
        b.begin_block();
        b.begin_function();
        let widen = b.end_function(
            "widen",
            Expr::identifier("u16"),
            vec![("x", Expr::identifier("u8"))],
            vec![Node::ret(Some(Expr::identifier("x")))],
        );
        let a = b.var("a", Some(Expr::identifier("u8")), Some(Expr::literal_int(2)));
        b.begin_function();
        let sink = b.end_function("sink", Expr::identifier("void"), vec![("y", Expr::identifier("u16"))], vec![]);
        let call = Node::expr(Expr::call(Expr::identifier("sink"), vec![Expr::identifier("a")]));
        let tree = b.end_block(vec![widen, a, sink, call]);

        let out = expose_conversions(&mut env, tree).unwrap();
        let block = out.as_block().unwrap();
        let body = block.children[0].as_function().unwrap().body.as_block().unwrap();
        let NodeKind::Return(ret) = &body.children[0].kind else {
            panic!("expected a return");
        };
        assert_eq!(ret.expression.as_ref().unwrap().to_string(), "(x as u16)");
        assert_eq!(block.children[3].as_expr().unwrap().to_string(), "sink((a as u16))");
    }

    #[test]
    fn test_mixed_width_binary_operands() {
        init_logging();
        let mut env = Environment::new();
        let mut b = TypedASTBuilder::new(&mut env);
        b.begin_block();
        let a = b.var("a", Some(Expr::identifier("u8")), Some(Expr::literal_int(1)));
        let w = b.var("w", Some(Expr::identifier("u16")), Some(Expr::literal_int(300)));
        let sum = Node::expr(Expr::binary(BinaryOp::Add, Expr::identifier("a"), Expr::identifier("w")));
        let inc = Node::expr(Expr::binary(BinaryOp::Add, Expr::identifier("a"), Expr::literal_int(1)));
        let tree = b.end_block(vec![a, w, sum, inc]);

        let out = expose_conversions(&mut env, tree).unwrap();
        let block = out.as_block().unwrap();
        assert_eq!(block.children[2].as_expr().unwrap().to_string(), "((a as u16) + w)");
        assert_eq!(block.children[3].as_expr().unwrap().to_string(), "(a + 1)");
    }

    #[test]
    fn test_union_argument_is_cast_but_union_store_is_not() {
        init_logging();
        let mut env = Environment::new();
        let mut b = TypedASTBuilder::new(&mut env);
        b.begin_block();
        let union = || union_type(vec![Expr::identifier("u8"), Expr::identifier("bool")]);
        b.begin_function();
        let take = b.end_function("take", Expr::identifier("void"), vec![("v", union())], vec![]);
        let u = b.var("u", Some(union()), Some(Expr::literal_bool(true)));
        let call = Node::expr(Expr::call(Expr::identifier("take"), vec![Expr::literal_int(7)]));
        let tree = b.end_block(vec![take, u, call]);

        let out = expose_conversions(&mut env, tree).unwrap();
        let block = out.as_block().unwrap();
        let u = block.children[1].as_var_declaration().unwrap();
        assert_eq!(u.expression.as_ref().unwrap().to_string(), "true");
        assert_eq!(block.children[2].as_expr().unwrap().to_string(), "take((7 as u8 | bool))");
    }

    #[test]
    fn test_return_rules() {
        init_logging();
        let mut env = Environment::new();
        let mut b = TypedASTBuilder::new(&mut env);
        b.begin_block();
        b.begin_function();
        let f = b.end_function("f", Expr::identifier("u8"), vec![], vec![Node::ret(None)]);
        let tree = b.end_block(vec![f]);
        let err = expose_conversions(&mut env, tree).unwrap_err();
        assert_eq!(err.message(), "non-void function should return a value");

        let mut env = Environment::new();
        let mut b = TypedASTBuilder::new(&mut env);
        b.begin_block();
        b.begin_function();
        let g = b.end_function(
            "g",
            Expr::identifier("void"),
            vec![],
            vec![Node::ret(Some(Expr::literal_int(1)))],
        );
        let tree = b.end_block(vec![g]);
        let err = expose_conversions(&mut env, tree).unwrap_err();
        assert_eq!(err.message(), "unexpected non-void return value in void function");

        let mut env = Environment::new();
        let tree = Node::block(env.root(), vec![Node::ret(None)]);
        let err = expose_conversions(&mut env, tree).unwrap_err();
        assert_eq!(err.message(), "return is invalid outside of a function");
    }

    #[test]
    fn test_identity_conversions_are_untouched() {
        init_logging();
        let mut env = Environment::new();
        let mut b = TypedASTBuilder::new(&mut env);
        b.begin_block();
        let a = b.var("a", Some(Expr::identifier("u8")), Some(Expr::literal_int(1)));
        let c = b.let_("c", Some(Expr::identifier("u8")), Some(Expr::identifier("a")));
        let tree = b.end_block(vec![a, c]);
        let out = expose_conversions(&mut env, tree).unwrap();
        let block = out.as_block().unwrap();
        let c = block.children[1].as_var_declaration().unwrap();
        assert_eq!(c.expression.as_ref().unwrap().to_string(), "a");
    }
}
