//! # Eseq Erasure
//!
//! Removes every `Eseq` from the tree by hoisting its preface statements to
//! the nearest enclosing statement list.
//!
//! ## Architecture
//!
//! Expressions are rebuilt bottom-up. A parent whose children carry
//! prefaces concatenates them in child order into a single preface of its
//! own and becomes an `Eseq` around the rebuilt parent. At a statement the
//! collected preface is spliced in front of the rebuilt statement, as a
//! `Seq` that statement lists flatten into their parent.
//!
//! A `while` condition cannot be treated this way: its preface would have
//! to run on every iteration. Unless [`EraseEseqOptions`] says otherwise,
//! an `Eseq` that survives in a loop condition is an internal error.

use log::trace;
use serde::{Deserialize, Serialize};
use snap_typed_ast::{
    Assert, CompilerError, CompilerResult, Environment, Expr, ExprKind, ForIn, GotoIfFalse, If, Match, Node,
    NodeKind, Return, Seq, StructInitializerArgument, VarDeclaration, While,
};

use crate::pass::{visit_branch, walk_expr, walk_match, Anchor, CompilerPass, PassState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EraseEseqOptions {
    /// Leave an `Eseq` in a `while` condition in place instead of failing
    pub ignore_while_condition_eseq: bool,
}

pub struct EraseEseqPass<'e> {
    env: &'e mut Environment,
    state: PassState,
    options: EraseEseqOptions,
}

impl<'e> EraseEseqPass<'e> {
    pub fn new(env: &'e mut Environment, options: EraseEseqOptions) -> Self {
        Self {
            env,
            state: PassState::new(),
            options,
        }
    }

    /// Visit a statement's expression and separate its preface
    fn split(&mut self, expr: Expr) -> CompilerResult<(Vec<Node>, Expr)> {
        Ok(split(self.visit_required(expr)?))
    }
}

fn split(expr: Expr) -> (Vec<Node>, Expr) {
    match expr.kind {
        ExprKind::Eseq { seq, expr } => (seq, *expr),
        kind => (vec![], Expr { kind, ..expr }),
    }
}

/// Move the preface of `child` into `preface`
fn hoist(child: Box<Expr>, preface: &mut Vec<Node>) -> Box<Expr> {
    match child.kind {
        ExprKind::Eseq { seq, expr } => {
            preface.extend(seq);
            expr
        }
        _ => child,
    }
}

fn hoist_all(children: Vec<Expr>, preface: &mut Vec<Node>) -> Vec<Expr> {
    children.into_iter().map(|c| *hoist(Box::new(c), preface)).collect()
}

/// Lift the prefaces of the direct children of an already rebuilt
/// expression
fn hoist_children(expr: Expr) -> Expr {
    let anchor = Anchor::of_expr(&expr);
    let mut preface = Vec::new();
    let kind = match expr.kind {
        ExprKind::Eseq { mut seq, expr: inner } => {
            let (nested, inner) = split(*inner);
            seq.extend(nested);
            ExprKind::Eseq {
                seq,
                expr: Box::new(inner),
            }
        }
        ExprKind::LiteralArray { array_type, elements } => ExprKind::LiteralArray {
            array_type: hoist(array_type, &mut preface),
            elements: hoist_all(elements, &mut preface),
        },
        ExprKind::Unary { op, child } => ExprKind::Unary {
            op,
            child: hoist(child, &mut preface),
        },
        ExprKind::Binary { op, left, right } => ExprKind::Binary {
            op,
            left: hoist(left, &mut preface),
            right: hoist(right, &mut preface),
        },
        ExprKind::Assignment { lexpr, rexpr } => ExprKind::Assignment {
            lexpr: hoist(lexpr, &mut preface),
            rexpr: hoist(rexpr, &mut preface),
        },
        ExprKind::InitialAssignment { lexpr, rexpr } => ExprKind::InitialAssignment {
            lexpr: hoist(lexpr, &mut preface),
            rexpr: hoist(rexpr, &mut preface),
        },
        ExprKind::Call { callee, arguments } => ExprKind::Call {
            callee: hoist(callee, &mut preface),
            arguments: hoist_all(arguments, &mut preface),
        },
        ExprKind::As { expr, target_type } => ExprKind::As {
            expr: hoist(expr, &mut preface),
            target_type,
        },
        ExprKind::Bitcast { expr, target_type } => ExprKind::Bitcast {
            expr: hoist(expr, &mut preface),
            target_type,
        },
        ExprKind::Is { expr, test_type } => ExprKind::Is {
            expr: hoist(expr, &mut preface),
            test_type,
        },
        ExprKind::Subscript { subscriptable, argument } => ExprKind::Subscript {
            subscriptable: hoist(subscriptable, &mut preface),
            argument: hoist(argument, &mut preface),
        },
        ExprKind::Get { expr, member } => ExprKind::Get {
            expr: hoist(expr, &mut preface),
            member,
        },
        ExprKind::StructInitializer { struct_type, arguments } => ExprKind::StructInitializer {
            struct_type,
            arguments: arguments
                .into_iter()
                .map(|a| StructInitializerArgument {
                    name: a.name,
                    expr: *hoist(Box::new(a.expr), &mut preface),
                })
                .collect(),
        },
        ExprKind::UnionType(members) => ExprKind::UnionType(hoist_all(members, &mut preface)),
        kind => kind,
    };
    let rebuilt = anchor.expr(kind);
    if preface.is_empty() {
        return rebuilt;
    }
    let span = rebuilt.span;
    Expr::eseq(preface, rebuilt).with_span(span)
}

/// `preface` followed by `statement`, as one statement
fn splice(preface: Vec<Node>, statement: Node) -> Node {
    if preface.is_empty() {
        return statement;
    }
    let span = statement.span;
    let mut children = preface;
    children.push(statement);
    Node::new(NodeKind::Seq(Seq { children })).with_span(span)
}

impl CompilerPass for EraseEseqPass<'_> {
    fn name(&self) -> &'static str {
        "ERASE_ESEQ"
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

    /// Statement lists absorb the `Seq`s their children expand into
    fn visit_children(&mut self, children: Vec<Node>) -> CompilerResult<Vec<Node>> {
        let mut result = Vec::with_capacity(children.len());
        for child in children {
            match self.visit(child)? {
                Some(Node {
                    kind: NodeKind::Seq(seq),
                    ..
                }) => result.extend(seq.children),
                Some(node) => result.push(node),
                None => {}
            }
        }
        Ok(result)
    }

    fn visit_expr_statement(&mut self, anchor: Anchor, expr: Expr) -> CompilerResult<Option<Node>> {
        let (preface, expr) = self.split(expr)?;
        Ok(Some(splice(preface, anchor.node(NodeKind::Expr(expr)))))
    }

    fn visit_var_declaration(&mut self, anchor: Anchor, node: VarDeclaration) -> CompilerResult<Option<Node>> {
        let explicit_type = node.explicit_type.map(|t| self.visit_required(t)).transpose()?;
        let (preface, expression) = match node.expression {
            Some(expression) => {
                let (preface, expression) = self.split(expression)?;
                (preface, Some(expression))
            }
            None => (vec![], None),
        };
        let decl = VarDeclaration {
            explicit_type,
            expression,
            ..node
        };
        Ok(Some(splice(preface, anchor.node(NodeKind::VarDeclaration(decl)))))
    }

    fn visit_if(&mut self, anchor: Anchor, node: If) -> CompilerResult<Option<Node>> {
        let (preface, condition) = self.split(node.condition)?;
        let then_branch = Box::new(visit_branch(self, *node.then_branch)?);
        let else_branch = match node.else_branch {
            Some(branch) => Some(Box::new(visit_branch(self, *branch)?)),
            None => None,
        };
        let rebuilt = anchor.node(NodeKind::If(If {
            condition,
            then_branch,
            else_branch,
        }));
        Ok(Some(splice(preface, rebuilt)))
    }

    fn visit_while(&mut self, anchor: Anchor, node: While) -> CompilerResult<Option<Node>> {
        let condition = self.visit_required(node.condition)?;
        if matches!(condition.kind, ExprKind::Eseq { .. }) && !self.options.ignore_while_condition_eseq {
            return Err(CompilerError::internal(
                "unable to erase an Eseq when used as the condition of a while-loop",
                condition.span.or(anchor.span),
            ));
        }
        let body = Box::new(visit_branch(self, *node.body)?);
        Ok(Some(anchor.node(NodeKind::While(While { condition, body }))))
    }

    fn visit_for_in(&mut self, anchor: Anchor, node: ForIn) -> CompilerResult<Option<Node>> {
        let (preface, sequence) = self.split(node.sequence)?;
        let body = Box::new(visit_branch(self, *node.body)?);
        let rebuilt = anchor.node(NodeKind::ForIn(ForIn {
            identifier: node.identifier,
            sequence,
            body,
        }));
        Ok(Some(splice(preface, rebuilt)))
    }

    fn visit_return(&mut self, anchor: Anchor, node: Return) -> CompilerResult<Option<Node>> {
        let (preface, expression) = match node.expression {
            Some(expression) => {
                let (preface, expression) = self.split(expression)?;
                (preface, Some(expression))
            }
            None => (vec![], None),
        };
        Ok(Some(splice(preface, anchor.node(NodeKind::Return(Return { expression })))))
    }

    fn visit_match(&mut self, anchor: Anchor, node: Match) -> CompilerResult<Option<Node>> {
        let (preface, expr) = self.split(node.expr)?;
        let rebuilt = walk_match(self, anchor, Match { expr, ..node })?;
        Ok(rebuilt.map(|m| splice(preface, m)))
    }

    fn visit_assert(&mut self, anchor: Anchor, node: Assert) -> CompilerResult<Option<Node>> {
        let (preface, condition) = self.split(node.condition)?;
        let rebuilt = anchor.node(NodeKind::Assert(Assert { condition, ..node }));
        Ok(Some(splice(preface, rebuilt)))
    }

    fn visit_goto_if_false(&mut self, anchor: Anchor, node: GotoIfFalse) -> CompilerResult<Option<Node>> {
        let (preface, condition) = self.split(node.condition)?;
        let rebuilt = anchor.node(NodeKind::GotoIfFalse(GotoIfFalse {
            condition,
            target: node.target,
        }));
        Ok(Some(splice(preface, rebuilt)))
    }

    fn visit_expr(&mut self, expr: Expr) -> CompilerResult<Option<Expr>> {
        let rebuilt = hoist_children(walk_expr(self, expr)?);
        if let ExprKind::Eseq { seq, .. } = &rebuilt.kind {
            trace!("[ERASE_ESEQ] hoisting {} statements", seq.len());
        }
        Ok(Some(rebuilt))
    }
}

/// Hoist every `Eseq` preface in `node` to statement level
pub fn erase_eseq(env: &mut Environment, node: Node, options: EraseEseqOptions) -> CompilerResult<Node> {
    EraseEseqPass::new(env, options).lower(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use snap_typed_ast::{BinaryOp, StorageClass};

    fn temp(name: &str, value: Expr) -> Node {
        Node::var(name, None, Some(value), StorageClass::Automatic, false)
    }

    fn statements(node: &Node) -> Vec<String> {
        node.as_block()
            .unwrap()
            .children
            .iter()
            .map(|n| match &n.kind {
                NodeKind::VarDeclaration(d) => format!("let {} = {}", d.identifier, d.expression.as_ref().unwrap()),
                NodeKind::Expr(e) => e.to_string(),
                NodeKind::Return(r) => format!("return {}", r.expression.as_ref().unwrap()),
                other => format!("{:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_prefaces_are_hoisted_in_child_order() {
        let mut env = Environment::new();
        let scope = env.new_scope(Some(env.root()));
        let left = Expr::eseq(vec![temp("__temp0", Expr::literal_int(1))], Expr::identifier("__temp0"));
        let right = Expr::eseq(vec![temp("__temp1", Expr::literal_int(2))], Expr::identifier("__temp1"));
        let tree = Node::block(
            scope,
            vec![Node::expr(Expr::call(Expr::identifier("f"), vec![left, right]))],
        );

        let out = erase_eseq(&mut env, tree, EraseEseqOptions::default()).unwrap();
        assert_eq!(
            statements(&out),
            vec!["let __temp0 = 1", "let __temp1 = 2", "f(__temp0, __temp1)"]
        );
        assert!(!out.contains_eseq());
    }

    #[test]
    fn test_nested_eseqs_flatten_before_return() {
        let mut env = Environment::new();
        let scope = env.new_scope(Some(env.root()));
        let inner = Expr::eseq(vec![temp("__temp1", Expr::literal_int(2))], Expr::identifier("__temp1"));
        let outer = Expr::eseq(
            vec![temp("__temp0", Expr::literal_int(1))],
            Expr::binary(BinaryOp::Add, Expr::identifier("__temp0"), inner),
        );
        let tree = Node::block(scope, vec![Node::ret(Some(outer))]);

        let out = erase_eseq(&mut env, tree, EraseEseqOptions::default()).unwrap();
        assert_eq!(
            statements(&out),
            vec!["let __temp0 = 1", "let __temp1 = 2", "return (__temp0 + __temp1)"]
        );
    }

    #[test]
    fn test_while_condition_eseq_is_rejected_unless_ignored() {
        let mut env = Environment::new();
        let scope = env.new_scope(Some(env.root()));
        let body_scope = env.new_scope(Some(scope));
        let condition = Expr::eseq(vec![temp("__temp0", Expr::literal_bool(true))], Expr::identifier("__temp0"));
        let tree = Node::block(
            scope,
            vec![Node::new(NodeKind::While(While {
                condition,
                body: Box::new(Node::block(body_scope, vec![])),
            }))],
        );

        let err = erase_eseq(&mut env, tree.clone(), EraseEseqOptions::default()).unwrap_err();
        assert!(err.is_internal());
        assert!(err.to_string().contains("while-loop"));

        let options = EraseEseqOptions {
            ignore_while_condition_eseq: true,
        };
        let out = erase_eseq(&mut env, tree, options).unwrap();
        assert!(out.contains_eseq());
    }
}
