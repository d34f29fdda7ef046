//! # Union Erasure
//!
//! Replaces every union type with a tagged struct and every union operation
//! with explicit tag and payload manipulation.
//!
//! ## Architecture
//!
//! A union `A | B | ..` erases to a struct
//! `{ tag: u16, payload: [N]u8 }` where `N` is the size of the largest
//! member. The struct is synthesized once per member list and remembered in
//! the type registry, so every occurrence of the same union shares it.
//!
//! | Source                 | Lowered                                                          |
//! |------------------------|------------------------------------------------------------------|
//! | `var x: A \| B = v`    | `var x: U; x.tag := i; bitcast(&x.payload, *M).pointee := v`     |
//! | `x = v`                | `Eseq[x.tag = i](bitcast(&x.payload, *M).pointee = v)`           |
//! | `x is T`               | `x.tag == i`                                                     |
//! | `x as T`               | `Eseq[if !(x.tag == i) { __panic(..) }](bitcast(&x.payload, *M).pointee)` |
//! | `v as A \| B`          | a temporary of the tagged struct, initialized as above           |
//!
//! `i` is the index of the member `M` the value converts to. When the union
//! operand is not a plain access path such as `x` or `s.u`, it is evaluated
//! once into a temporary: a store goes through `__tempN = &lexpr` and
//! `__tempN.pointee`, and a cast out of a union reads a copy of its operand.
//!
//! All types are computed from the source expressions before they are
//! rewritten: once a union variable is accessed through its tag, the
//! rewritten expression no longer type-checks against the declared union.

use log::{debug, trace};
use snap_typed_ast::nominal;
use snap_typed_ast::{
    BinaryOp, CompilerError, CompilerResult, Environment, Expr, ExprKind, InternedString, Node, NodeKind,
    Span, StorageClass, StructRef, Type, UnaryOp, VarDeclaration, Visibility, PANIC_FUNCTION,
};

use crate::pass::{bind_var_declaration, visit_var_declaration_children, walk_expr, Anchor, CompilerPass, PassState};

pub const TAG_FIELD: &str = "tag";
pub const PAYLOAD_FIELD: &str = "payload";

const BAD_UNION_CAST: &str = "bad union cast";

pub struct EraseUnionsPass<'e> {
    env: &'e mut Environment,
    state: PassState,
}

impl<'e> EraseUnionsPass<'e> {
    pub fn new(env: &'e mut Environment) -> Self {
        Self {
            env,
            state: PassState::new(),
        }
    }

    /// The tagged struct standing in for a union of `members`
    fn tagged_type(&mut self, members: &[Type]) -> CompilerResult<Type> {
        let key: Vec<Type> = members.iter().map(Type::corresponding_mutable_type).collect();
        if let Some(id) = self.env.types.tagged_union(&key) {
            let name = self.env.types.struct_info(id).name;
            return Ok(Type::Struct(StructRef { id, name }));
        }
        let payload_size = key.iter().map(|m| self.env.sizeof(m)).max().unwrap_or(0);
        let root = self.env.root();
        let ty = nominal::reserve_struct(self.env, root, tagged_union_name(&key), false, None);
        let sref = ty
            .as_struct()
            .ok_or_else(|| CompilerError::internal("tagged union did not reserve a struct", None))?;
        nominal::layout_struct_fields(
            self.env,
            sref,
            &[
                (TAG_FIELD.into(), Type::U16),
                (PAYLOAD_FIELD.into(), Type::array(Some(payload_size), Type::U8)),
            ],
            None,
        )?;
        self.env.types.remember_tagged_union(key, sref.id);
        debug!("[ERASE_UNIONS] synthesized {} ({} byte payload)", sref.name, payload_size);
        Ok(ty)
    }

    fn tagged_type_expr(&mut self, members: &[Type]) -> CompilerResult<Expr> {
        Ok(Expr::primitive_type(self.tagged_type(members)?))
    }

    /// Index of the member a value of type `from` is stored as
    fn member_for_store(&mut self, from: &Type, members: &[Type], span: Option<Span>) -> CompilerResult<usize> {
        self.type_checker().union_member_for(from, members).ok_or_else(|| {
            CompilerError::type_mismatch(
                format!(
                    "expected the type of the right-hand expression to match one of the union types, but `{}' does not match any of {}",
                    from,
                    member_list(members)
                ),
                span,
            )
        })
    }

    /// `lexpr.tag = i` and the payload store of `value` as member `i`
    fn union_stores(
        &mut self,
        lexpr: &Expr,
        value: Expr,
        value_type: &Type,
        members: &[Type],
        initial: bool,
        span: Option<Span>,
    ) -> CompilerResult<(Expr, Expr)> {
        let index = self.member_for_store(value_type, members, span)?;
        let store = if initial {
            Expr::initial_assignment
        } else {
            Expr::assignment
        };
        let tag = store(tag_of(lexpr.clone()), Expr::literal_int(index as i64)).with_span(span);
        let payload = store(payload_as(lexpr.clone(), &members[index]), value).with_span(span);
        trace!("[ERASE_UNIONS] store {} as member {} ({})", value_type, index, members[index]);
        Ok((tag, payload))
    }

    /// An lvalue both union stores can name without evaluating `lexpr`
    /// twice. Anything other than a plain access path has its address
    /// bound to a temporary first.
    fn store_target(&mut self, lexpr: Expr, span: Option<Span>) -> (Option<Node>, Expr) {
        if is_access_path(&lexpr) {
            return (None, lexpr);
        }
        let temp = self.env.next_temp_name();
        trace!("[ERASE_UNIONS] address of {} bound to {}", lexpr, temp);
        let decl = temporary(temp, None, Expr::address_of(lexpr), span);
        (Some(decl), Expr::pointee(Expr::identifier(temp).with_span(span)))
    }

    /// A union value both the tag guard and the payload read can name
    /// without evaluating `value` twice
    fn cast_operand(
        &mut self,
        value: Expr,
        members: &[Type],
        span: Option<Span>,
    ) -> CompilerResult<(Option<Node>, Expr)> {
        if is_access_path(&value) {
            return Ok((None, value));
        }
        let temp = self.env.next_temp_name();
        trace!("[ERASE_UNIONS] union operand {} copied to {}", value, temp);
        let tagged = self.tagged_type_expr(members)?;
        let decl = temporary(temp, Some(tagged), value, span);
        Ok((Some(decl), Expr::identifier(temp).with_span(span)))
    }

    fn rewrite_var_declaration(&mut self, anchor: Anchor, node: VarDeclaration) -> CompilerResult<Option<Node>> {
        let declared = match (&node.explicit_type, &node.expression) {
            (Some(explicit), _) => Some(self.check_type_expr(explicit)?),
            (None, Some(expression)) => Some(self.check(expression)?),
            (None, None) => None,
        };
        let members = declared.as_ref().and_then(union_members);
        let value_type = match (&members, &node.expression) {
            (Some(_), Some(expression)) => Some(self.check(expression)?),
            _ => None,
        };
        let decl = visit_var_declaration_children(self, node.clone())?;
        bind_var_declaration(self, anchor, &node)?;

        let Some(members) = members else {
            return Ok(Some(anchor.node(NodeKind::VarDeclaration(decl))));
        };
        let tagged = VarDeclaration {
            explicit_type: Some(self.tagged_type_expr(&members)?),
            expression: None,
            ..decl.clone()
        };
        let mut children = vec![anchor.node(NodeKind::VarDeclaration(tagged))];
        if let (Some(value), Some(value_type)) = (decl.expression, value_type) {
            let target = Expr::identifier(node.identifier);
            if value_type.is_union() {
                children.push(Node::expr(Expr::initial_assignment(target, value).with_span(anchor.span)));
            } else {
                let (tag, payload) = self.union_stores(&target, value, &value_type, &members, true, anchor.span)?;
                children.push(Node::expr(tag));
                children.push(Node::expr(payload));
            }
        }
        trace!("[ERASE_UNIONS] var {} erased to its tagged struct", node.identifier);
        Ok(Some(Node::seq(children).with_span(anchor.span)))
    }

    fn rewrite_store(&mut self, expr: Expr) -> CompilerResult<Expr> {
        let (lexpr, rexpr, initial) = match &expr.kind {
            ExprKind::Assignment { lexpr, rexpr } => (lexpr, rexpr, false),
            ExprKind::InitialAssignment { lexpr, rexpr } => (lexpr, rexpr, true),
            _ => return walk_expr(self, expr),
        };
        let members = self.check_lvalue(lexpr)?.as_ref().and_then(union_members);
        let Some(members) = members else {
            return walk_expr(self, expr);
        };
        let value_type = self.check(rexpr)?;
        if value_type.is_union() {
            return walk_expr(self, expr);
        }
        let span = expr.span;
        let rebuilt = walk_expr(self, expr)?;
        let anchor = Anchor::of_expr(&rebuilt);
        match rebuilt.kind {
            ExprKind::Assignment { lexpr, rexpr } | ExprKind::InitialAssignment { lexpr, rexpr } => {
                let (bind, target) = self.store_target(*lexpr, span);
                let (tag, payload) = self.union_stores(&target, *rexpr, &value_type, &members, initial, span)?;
                let mut seq: Vec<Node> = bind.into_iter().collect();
                seq.push(Node::expr(tag));
                Ok(Expr::eseq(seq, payload).with_span(span))
            }
            kind => Ok(anchor.expr(kind)),
        }
    }

    fn rewrite_is(&mut self, expr: Expr) -> CompilerResult<Expr> {
        let ExprKind::Is { expr: inner, test_type } = &expr.kind else {
            return walk_expr(self, expr);
        };
        let Some(members) = union_members(&self.check(inner)?) else {
            return walk_expr(self, expr);
        };
        let test = self.check_type_expr(test_type)?;
        let index = members.iter().position(|m| m.same_modulo_const(&test)).ok_or_else(|| {
            CompilerError::type_mismatch(
                format!(
                    "expected the test type to match one of the union types, but `{}' does not match any of {}",
                    test,
                    member_list(&members)
                ),
                test_type.span.or(expr.span),
            )
        })?;
        let span = expr.span;
        let rebuilt = walk_expr(self, expr)?;
        let anchor = Anchor::of_expr(&rebuilt);
        match rebuilt.kind {
            ExprKind::Is { expr: inner, .. } => Ok(tag_test(*inner, index).with_span(span)),
            kind => Ok(anchor.expr(kind)),
        }
    }

    fn rewrite_cast(&mut self, expr: Expr) -> CompilerResult<Expr> {
        let ExprKind::As { expr: inner, target_type } = &expr.kind else {
            return walk_expr(self, expr);
        };
        let value_type = self.check(inner)?;
        let target = self.check_type_expr(target_type)?;
        match (union_members(&value_type), union_members(&target)) {
            (Some(members), None) => {
                self.check(&expr)?;
                self.cast_from_union(expr, &members, &target)
            }
            (None, Some(members)) => self.cast_into_union(expr, &value_type, &members),
            _ => walk_expr(self, expr),
        }
    }

    /// Checked extraction of one member from a union value
    fn cast_from_union(&mut self, expr: Expr, members: &[Type], target: &Type) -> CompilerResult<Expr> {
        let exact = members.iter().position(|m| m.same_modulo_const(target));
        let index = match exact {
            Some(index) => index,
            None => {
                let tc = self.type_checker();
                members
                    .iter()
                    .position(|m| tc.check_convertibility(m, target, true).is_acceptable())
                    .ok_or_else(|| {
                        CompilerError::internal(format!("no union member converts to `{}'", target), expr.span)
                    })?
            }
        };
        let span = expr.span;
        let ExprKind::As { expr: inner, target_type } = walk_expr(self, expr)?.kind else {
            return Err(CompilerError::internal("cast changed kind while erasing unions", span));
        };
        let (bind, operand) = self.cast_operand(*inner, members, span)?;
        let mut extracted = Expr::pointee(payload_pointer(operand.clone(), &members[index]));
        if exact.is_none() {
            extracted = Expr::as_cast(extracted, *target_type);
        }
        let scope = self.current_scope();
        let panic_scope = self.env.new_scope(Some(scope));
        let panic = Node::block(
            panic_scope,
            vec![Node::expr(Expr::call(
                Expr::identifier(PANIC_FUNCTION),
                vec![Expr::new(ExprKind::LiteralString(BAD_UNION_CAST.to_string()))],
            ))],
        );
        let guard = Node::if_then(Expr::unary(UnaryOp::Bang, tag_test(operand, index)), panic, None).with_span(span);
        trace!("[ERASE_UNIONS] checked cast to member {} ({})", index, members[index]);
        let mut seq: Vec<Node> = bind.into_iter().collect();
        seq.push(guard);
        Ok(Expr::eseq(seq, extracted).with_span(span))
    }

    /// A temporary tagged struct holding `value`
    fn cast_into_union(&mut self, expr: Expr, value_type: &Type, members: &[Type]) -> CompilerResult<Expr> {
        let span = expr.span;
        let ExprKind::As { expr: value, .. } = walk_expr(self, expr)?.kind else {
            return Err(CompilerError::internal("cast changed kind while erasing unions", span));
        };
        let temp = self.env.next_temp_name();
        let decl = Node::new(NodeKind::VarDeclaration(VarDeclaration {
            identifier: temp,
            explicit_type: Some(self.tagged_type_expr(members)?),
            expression: None,
            storage: StorageClass::Automatic,
            is_mutable: true,
            visibility: Visibility::Private,
        }))
        .with_span(span);
        let target = Expr::identifier(temp);
        let (tag, payload) = self.union_stores(&target, *value, value_type, members, true, span)?;
        Ok(Expr::eseq(vec![decl, Node::expr(tag), Node::expr(payload)], target).with_span(span))
    }

    fn rewrite_union_type(&mut self, expr: Expr) -> CompilerResult<Expr> {
        let ty = self.check_type_expr(&expr)?;
        match union_members(&ty) {
            Some(members) => Ok(self.tagged_type_expr(&members)?.with_span(expr.span)),
            None => walk_expr(self, expr),
        }
    }
}

fn union_members(ty: &Type) -> Option<Vec<Type>> {
    ty.as_union_members()
        .map(|members| members.iter().map(Type::corresponding_mutable_type).collect())
}

fn tagged_union_name(members: &[Type]) -> InternedString {
    let parts: Vec<String> = members.iter().map(|m| m.to_string()).collect();
    InternedString::from(format!("__union[{}]", parts.join(", ")))
}

fn member_list(members: &[Type]) -> String {
    let parts: Vec<String> = members.iter().map(|m| format!("`{}'", m)).collect();
    format!("{{{}}}", parts.join(", "))
}

/// Identifiers and member accesses on them: naming one twice has no
/// side effects
fn is_access_path(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Identifier(_) => true,
        ExprKind::Get { expr, .. } => is_access_path(expr),
        _ => false,
    }
}

fn temporary(identifier: InternedString, explicit_type: Option<Expr>, value: Expr, span: Option<Span>) -> Node {
    Node::new(NodeKind::VarDeclaration(VarDeclaration {
        identifier,
        explicit_type,
        expression: Some(value),
        storage: StorageClass::Automatic,
        is_mutable: true,
        visibility: Visibility::Private,
    }))
    .with_span(span)
}

fn tag_of(union: Expr) -> Expr {
    Expr::get(union, TAG_FIELD)
}

fn tag_test(union: Expr, index: usize) -> Expr {
    Expr::binary(BinaryOp::Eq, tag_of(union), Expr::literal_int(index as i64))
}

/// `bitcast(&union.payload, *member)`
fn payload_pointer(union: Expr, member: &Type) -> Expr {
    Expr::bitcast(
        Expr::address_of(Expr::get(union, PAYLOAD_FIELD)),
        Expr::primitive_type(Type::pointer(member.clone())),
    )
}

fn payload_as(union: Expr, member: &Type) -> Expr {
    Expr::pointee(payload_pointer(union, member))
}

impl CompilerPass for EraseUnionsPass<'_> {
    const DECL_SCAN: bool = true;

    fn name(&self) -> &'static str {
        "ERASE_UNIONS"
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
        self.rewrite_var_declaration(anchor, node)
    }

    fn visit_expr(&mut self, expr: Expr) -> CompilerResult<Option<Expr>> {
        let rewritten = match &expr.kind {
            ExprKind::Assignment { .. } | ExprKind::InitialAssignment { .. } => self.rewrite_store(expr)?,
            ExprKind::Is { .. } => self.rewrite_is(expr)?,
            ExprKind::As { .. } => self.rewrite_cast(expr)?,
            ExprKind::UnionType(_) => self.rewrite_union_type(expr)?,
            _ => walk_expr(self, expr)?,
        };
        Ok(Some(rewritten))
    }
}

/// Erase union types and operations from `node`
pub fn erase_unions(env: &mut Environment, node: Node) -> CompilerResult<Node> {
    EraseUnionsPass::new(env).lower(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use snap_typed_ast::typed_builder::union_type;
    use snap_typed_ast::TypedASTBuilder;

    fn u8_or_bool() -> Expr {
        union_type(vec![Expr::identifier("u8"), Expr::identifier("bool")])
    }

    fn erased_block(env: &mut Environment, children: impl FnOnce(&TypedASTBuilder) -> Vec<Node>) -> Vec<Node> {
        let mut b = TypedASTBuilder::new(env);
        b.begin_block();
        let children = children(&b);
        let tree = b.end_block(children);
        let out = erase_unions(env, tree).unwrap();
        out.as_block().unwrap().children.clone()
    }

    #[test]
    fn test_union_variable_is_stored_through_tag_and_payload() {
        let mut env = Environment::new();
        let children = erased_block(&mut env, |b| vec![b.var("x", Some(u8_or_bool()), Some(Expr::literal_int(5)))]);
        let NodeKind::Seq(seq) = &children[0].kind else {
            panic!("expected the declaration to expand into a Seq");
        };
        assert_eq!(seq.children.len(), 3);
        let decl = seq.children[0].as_var_declaration().unwrap();
        assert!(decl.expression.is_none());
        assert_eq!(decl.explicit_type.as_ref().unwrap().to_string(), "__union[u8, bool]");
        assert_eq!(seq.children[1].as_expr().unwrap().to_string(), "x.tag := 0");
        assert_eq!(
            seq.children[2].as_expr().unwrap().to_string(),
            "bitcast(&x.payload, *u8).pointee := 5"
        );
    }

    #[test]
    fn test_is_becomes_tag_comparison_and_as_is_checked() {
        let mut env = Environment::new();
        let children = erased_block(&mut env, |b| {
            vec![
                b.var("x", Some(u8_or_bool()), Some(Expr::literal_int(5))),
                b.var("y", None, Some(Expr::is_test(Expr::identifier("x"), Expr::identifier("bool")))),
                b.var("z", None, Some(Expr::as_cast(Expr::identifier("x"), Expr::identifier("u8")))),
            ]
        });
        let y = children[1].as_var_declaration().unwrap();
        assert_eq!(y.expression.as_ref().unwrap().to_string(), "(x.tag == 1)");

        let z = children[2].as_var_declaration().unwrap();
        let ExprKind::Eseq { seq, expr } = &z.expression.as_ref().unwrap().kind else {
            panic!("expected a checked extraction");
        };
        assert_eq!(expr.to_string(), "bitcast(&x.payload, *u8).pointee");
        let NodeKind::If(guard) = &seq[0].kind else {
            panic!("expected a tag guard");
        };
        assert_eq!(guard.condition.to_string(), "!(x.tag == 0)");
    }

    #[test]
    fn test_identical_unions_share_one_tagged_struct() {
        let mut env = Environment::new();
        let children = erased_block(&mut env, |b| {
            vec![
                b.var("a", Some(u8_or_bool()), Some(Expr::literal_bool(true))),
                b.let_("b", Some(u8_or_bool()), Some(Expr::literal_int(1))),
            ]
        });
        let types: Vec<String> = children
            .iter()
            .map(|child| {
                let NodeKind::Seq(seq) = &child.kind else {
                    panic!("expected a Seq");
                };
                seq.children[0].as_var_declaration().unwrap().explicit_type.as_ref().unwrap().to_string()
            })
            .collect();
        assert_eq!(types[0], types[1]);
        assert!(env.types.tagged_union(&[Type::U8, Type::BOOL]).is_some());
    }

    #[test]
    fn test_store_of_unrelated_type_is_rejected() {
        let mut env = Environment::new();
        let mut b = TypedASTBuilder::new(&mut env);
        b.begin_block();
        let s = b.struct_decl("S", vec![]);
        let v = b.var(
            "v",
            None,
            Some(Expr::struct_initializer(Expr::identifier("S"), vec![])),
        );
        let x = b.var("x", Some(u8_or_bool()), Some(Expr::literal_bool(false)));
        let store = Node::expr(Expr::assignment(Expr::identifier("x"), Expr::identifier("v")));
        let tree = b.end_block(vec![s, v, x, store]);
        let err = erase_unions(&mut env, tree).unwrap_err();
        assert!(err.message().contains("{`u8', `bool'}"), "{}", err.message());
    }
}
