//! # Pass Framework
//!
//! Every lowering pass is a tree-to-tree rewrite built on [`CompilerPass`].
//!
//! ## Architecture
//!
//! [`CompilerPass::visit`] dispatches on the node kind to a per-kind
//! `visit_*` hook. Each hook defaults to the matching `walk_*` function,
//! which visits the children and rebuilds a node of the same kind around
//! them. A pass overrides only the hooks it cares about; an override is
//! solely responsible for producing the replacement and calls the `walk_*`
//! function itself when it wants structural recursion first.
//!
//! Returning `None` for a statement removes it from its parent's child list.
//! Returning `None` for an expression in a position that requires one is an
//! internal compiler error.
//!
//! Entering a block pushes the block's scope onto the pass's scope stack;
//! leaving it pops the scope. Type queries always resolve through the top
//! of that stack.
//!
//! Passes that set [`CompilerPass::DECL_SCAN`] additionally clear stale
//! declaration bindings from every scope of the tree before the run, and
//! scan the direct children of each block for declarations before visiting
//! them (see [`crate::decl_scan`]).

use indexmap::IndexMap;
use log::{debug, trace};
use snap_typed_ast::{
    Assert, Block, CompilerError, CompilerResult, Environment, Expr, ExprKind, ForIn, FunctionDeclaration, Goto,
    GotoIfFalse, If, Impl, ImplFor, Import, InternedString, LabelDeclaration, Match, MatchClause, Module, Node,
    NodeId, NodeKind, Return, ScopeId, Seq, Span, StructDeclaration, StructInitializerArgument, TestDeclaration,
    TraitDeclaration, Type, TypeChecker, Typealias, VarDeclaration, While, Asm,
};

use crate::decl_scan;

/// Identity and source anchor of a node whose kind has been taken apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub id: NodeId,
    pub span: Option<Span>,
}

impl Anchor {
    pub fn of_node(node: &Node) -> Self {
        Self {
            id: node.id,
            span: node.span,
        }
    }

    pub fn of_expr(expr: &Expr) -> Self {
        Self {
            id: expr.id,
            span: expr.span,
        }
    }

    pub fn node(self, kind: NodeKind) -> Node {
        Node {
            id: self.id,
            span: self.span,
            kind,
        }
    }

    pub fn expr(self, kind: ExprKind) -> Expr {
        Expr {
            id: self.id,
            span: self.span,
            kind,
        }
    }
}

/// Traversal state owned by a pass
#[derive(Debug, Default)]
pub struct PassState {
    scopes: Vec<ScopeId>,
    /// Modules already visited while scanning their enclosing block
    pub(crate) scanned_modules: IndexMap<InternedString, Node>,
}

impl PassState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `scope` active, for analyzing expressions outside a full program
    pub fn with_scope(scope: ScopeId) -> Self {
        Self {
            scopes: vec![scope],
            scanned_modules: IndexMap::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }
}

pub trait CompilerPass: Sized {
    /// Scan declarations of each block before visiting its statements
    const DECL_SCAN: bool = false;

    /// Tag used in log lines
    fn name(&self) -> &'static str;

    fn env(&mut self) -> &mut Environment;
    fn env_ref(&self) -> &Environment;
    fn state(&mut self) -> &mut PassState;
    fn state_ref(&self) -> &PassState;

    /// Innermost active scope, or the environment root
    fn current_scope(&self) -> ScopeId {
        self.state_ref()
            .scopes
            .last()
            .copied()
            .unwrap_or_else(|| self.env_ref().root())
    }

    /// Run `f` with `scope` pushed on the scope stack
    fn with_scope<T>(&mut self, scope: ScopeId, f: impl FnOnce(&mut Self) -> CompilerResult<T>) -> CompilerResult<T> {
        self.state().scopes.push(scope);
        let result = f(self);
        self.state().scopes.pop();
        result
    }

    fn type_checker(&mut self) -> TypeChecker<'_> {
        let scope = self.current_scope();
        TypeChecker::new(self.env(), scope)
    }

    fn check(&mut self, expr: &Expr) -> CompilerResult<Type> {
        self.type_checker().check(expr)
    }

    fn check_type_expr(&mut self, expr: &Expr) -> CompilerResult<Type> {
        self.type_checker().check_type_expr(expr)
    }

    fn check_lvalue(&mut self, expr: &Expr) -> CompilerResult<Option<Type>> {
        self.type_checker().check_lvalue(expr)
    }

    /// Rewrite a whole tree
    fn run(&mut self, node: Node) -> CompilerResult<Option<Node>> {
        debug!("[{}] begin", self.name());
        if Self::DECL_SCAN {
            decl_scan::prepare_tree(self.env(), &node);
        }
        let result = self.visit(node)?;
        debug!("[{}] end", self.name());
        Ok(result)
    }

    /// [`CompilerPass::run`], with a tree that rewrites to nothing becoming an empty `Seq`
    fn lower(&mut self, node: Node) -> CompilerResult<Node> {
        let anchor = Anchor::of_node(&node);
        Ok(self
            .run(node)?
            .unwrap_or_else(|| anchor.node(NodeKind::Seq(Seq { children: vec![] }))))
    }

    fn visit(&mut self, node: Node) -> CompilerResult<Option<Node>> {
        let anchor = Anchor::of_node(&node);
        match node.kind {
            NodeKind::Seq(n) => self.visit_seq(anchor, n),
            NodeKind::VarDeclaration(n) => self.visit_var_declaration(anchor, n),
            NodeKind::If(n) => self.visit_if(anchor, n),
            NodeKind::While(n) => self.visit_while(anchor, n),
            NodeKind::ForIn(n) => self.visit_for_in(anchor, n),
            NodeKind::Block(n) => self.visit_block(anchor, n),
            NodeKind::Return(n) => self.visit_return(anchor, n),
            NodeKind::FunctionDeclaration(n) => self.visit_function_declaration(anchor, n),
            NodeKind::StructDeclaration(n) => self.visit_struct_declaration(anchor, n),
            NodeKind::TraitDeclaration(n) => self.visit_trait_declaration(anchor, n),
            NodeKind::TestDeclaration(n) => self.visit_test_declaration(anchor, n),
            NodeKind::Impl(n) => self.visit_impl(anchor, n),
            NodeKind::ImplFor(n) => self.visit_impl_for(anchor, n),
            NodeKind::Match(n) => self.visit_match(anchor, n),
            NodeKind::Assert(n) => self.visit_assert(anchor, n),
            NodeKind::Typealias(n) => self.visit_typealias(anchor, n),
            NodeKind::Import(n) => self.visit_import(anchor, n),
            NodeKind::Module(n) => self.visit_module(anchor, n),
            NodeKind::Goto(n) => self.visit_goto(anchor, n),
            NodeKind::GotoIfFalse(n) => self.visit_goto_if_false(anchor, n),
            NodeKind::LabelDeclaration(n) => self.visit_label_declaration(anchor, n),
            NodeKind::Asm(n) => self.visit_asm(anchor, n),
            NodeKind::Expr(e) => self.visit_expr_statement(anchor, e),
        }
    }

    /// Visit a statement list, dropping removed statements
    fn visit_children(&mut self, children: Vec<Node>) -> CompilerResult<Vec<Node>> {
        let mut result = Vec::with_capacity(children.len());
        for child in children {
            if let Some(node) = self.visit(child)? {
                result.push(node);
            }
        }
        Ok(result)
    }

    fn visit_seq(&mut self, anchor: Anchor, node: Seq) -> CompilerResult<Option<Node>> {
        walk_seq(self, anchor, node)
    }

    fn visit_var_declaration(&mut self, anchor: Anchor, node: VarDeclaration) -> CompilerResult<Option<Node>> {
        walk_var_declaration(self, anchor, node)
    }

    fn visit_if(&mut self, anchor: Anchor, node: If) -> CompilerResult<Option<Node>> {
        walk_if(self, anchor, node)
    }

    fn visit_while(&mut self, anchor: Anchor, node: While) -> CompilerResult<Option<Node>> {
        walk_while(self, anchor, node)
    }

    fn visit_for_in(&mut self, anchor: Anchor, node: ForIn) -> CompilerResult<Option<Node>> {
        walk_for_in(self, anchor, node)
    }

    fn visit_block(&mut self, anchor: Anchor, node: Block) -> CompilerResult<Option<Node>> {
        walk_block(self, anchor, node)
    }

    fn visit_return(&mut self, anchor: Anchor, node: Return) -> CompilerResult<Option<Node>> {
        walk_return(self, anchor, node)
    }

    fn visit_function_declaration(&mut self, anchor: Anchor, node: FunctionDeclaration) -> CompilerResult<Option<Node>> {
        walk_function_declaration(self, anchor, node)
    }

    fn visit_struct_declaration(&mut self, anchor: Anchor, node: StructDeclaration) -> CompilerResult<Option<Node>> {
        walk_struct_declaration(self, anchor, node)
    }

    fn visit_trait_declaration(&mut self, anchor: Anchor, node: TraitDeclaration) -> CompilerResult<Option<Node>> {
        walk_trait_declaration(self, anchor, node)
    }

    fn visit_test_declaration(&mut self, anchor: Anchor, node: TestDeclaration) -> CompilerResult<Option<Node>> {
        walk_test_declaration(self, anchor, node)
    }

    fn visit_impl(&mut self, anchor: Anchor, node: Impl) -> CompilerResult<Option<Node>> {
        walk_impl(self, anchor, node)
    }

    fn visit_impl_for(&mut self, anchor: Anchor, node: ImplFor) -> CompilerResult<Option<Node>> {
        walk_impl_for(self, anchor, node)
    }

    fn visit_match(&mut self, anchor: Anchor, node: Match) -> CompilerResult<Option<Node>> {
        walk_match(self, anchor, node)
    }

    fn visit_assert(&mut self, anchor: Anchor, node: Assert) -> CompilerResult<Option<Node>> {
        walk_assert(self, anchor, node)
    }

    fn visit_typealias(&mut self, anchor: Anchor, node: Typealias) -> CompilerResult<Option<Node>> {
        walk_typealias(self, anchor, node)
    }

    fn visit_import(&mut self, anchor: Anchor, node: Import) -> CompilerResult<Option<Node>> {
        Ok(Some(anchor.node(NodeKind::Import(node))))
    }

    fn visit_module(&mut self, anchor: Anchor, node: Module) -> CompilerResult<Option<Node>> {
        walk_module(self, anchor, node)
    }

    fn visit_goto(&mut self, anchor: Anchor, node: Goto) -> CompilerResult<Option<Node>> {
        Ok(Some(anchor.node(NodeKind::Goto(node))))
    }

    fn visit_goto_if_false(&mut self, anchor: Anchor, node: GotoIfFalse) -> CompilerResult<Option<Node>> {
        walk_goto_if_false(self, anchor, node)
    }

    fn visit_label_declaration(&mut self, anchor: Anchor, node: LabelDeclaration) -> CompilerResult<Option<Node>> {
        Ok(Some(anchor.node(NodeKind::LabelDeclaration(node))))
    }

    fn visit_asm(&mut self, anchor: Anchor, node: Asm) -> CompilerResult<Option<Node>> {
        Ok(Some(anchor.node(NodeKind::Asm(node))))
    }

    fn visit_expr_statement(&mut self, anchor: Anchor, expr: Expr) -> CompilerResult<Option<Node>> {
        Ok(self.visit_expr(expr)?.map(|e| anchor.node(NodeKind::Expr(e))))
    }

    fn visit_expr(&mut self, expr: Expr) -> CompilerResult<Option<Expr>> {
        walk_expr(self, expr).map(Some)
    }

    /// Visit an expression in a position that cannot be empty
    fn visit_required(&mut self, expr: Expr) -> CompilerResult<Expr> {
        let span = expr.span;
        self.visit_expr(expr)?
            .ok_or_else(|| CompilerError::internal("expression was removed where one is required", span))
    }
}

fn visit_optional<P: CompilerPass>(pass: &mut P, expr: Option<Expr>) -> CompilerResult<Option<Expr>> {
    expr.map(|e| pass.visit_required(e)).transpose()
}

fn visit_boxed<P: CompilerPass>(pass: &mut P, expr: Box<Expr>) -> CompilerResult<Box<Expr>> {
    pass.visit_required(*expr).map(Box::new)
}

fn visit_all<P: CompilerPass>(pass: &mut P, exprs: Vec<Expr>) -> CompilerResult<Vec<Expr>> {
    exprs.into_iter().map(|e| pass.visit_required(e)).collect()
}

/// Visit a nested statement; a removed statement becomes an empty `Seq`
pub fn visit_branch<P: CompilerPass>(pass: &mut P, node: Node) -> CompilerResult<Node> {
    let anchor = Anchor::of_node(&node);
    Ok(pass
        .visit(node)?
        .unwrap_or_else(|| anchor.node(NodeKind::Seq(Seq { children: vec![] }))))
}

pub fn walk_seq<P: CompilerPass>(pass: &mut P, anchor: Anchor, node: Seq) -> CompilerResult<Option<Node>> {
    let children = pass.visit_children(node.children)?;
    Ok(Some(anchor.node(NodeKind::Seq(Seq { children }))))
}

pub fn walk_var_declaration<P: CompilerPass>(
    pass: &mut P,
    anchor: Anchor,
    node: VarDeclaration,
) -> CompilerResult<Option<Node>> {
    let decl = visit_var_declaration_children(pass, node)?;
    bind_var_declaration(pass, anchor, &decl)?;
    Ok(Some(anchor.node(NodeKind::VarDeclaration(decl))))
}

pub fn visit_var_declaration_children<P: CompilerPass>(
    pass: &mut P,
    node: VarDeclaration,
) -> CompilerResult<VarDeclaration> {
    Ok(VarDeclaration {
        explicit_type: visit_optional(pass, node.explicit_type)?,
        expression: visit_optional(pass, node.expression)?,
        ..node
    })
}

/// Bind the declared name in the current scope, for scanning passes
pub fn bind_var_declaration<P: CompilerPass>(pass: &mut P, anchor: Anchor, decl: &VarDeclaration) -> CompilerResult<()> {
    if P::DECL_SCAN {
        let scope = pass.current_scope();
        decl_scan::bind_variable(pass.env(), scope, anchor, decl)?;
    }
    Ok(())
}

pub fn walk_if<P: CompilerPass>(pass: &mut P, anchor: Anchor, node: If) -> CompilerResult<Option<Node>> {
    let condition = pass.visit_required(node.condition)?;
    let then_branch = Box::new(visit_branch(pass, *node.then_branch)?);
    let else_branch = match node.else_branch {
        Some(branch) => Some(Box::new(visit_branch(pass, *branch)?)),
        None => None,
    };
    Ok(Some(anchor.node(NodeKind::If(If {
        condition,
        then_branch,
        else_branch,
    }))))
}

pub fn walk_while<P: CompilerPass>(pass: &mut P, anchor: Anchor, node: While) -> CompilerResult<Option<Node>> {
    let condition = pass.visit_required(node.condition)?;
    let body = Box::new(visit_branch(pass, *node.body)?);
    Ok(Some(anchor.node(NodeKind::While(While { condition, body }))))
}

pub fn walk_for_in<P: CompilerPass>(pass: &mut P, anchor: Anchor, node: ForIn) -> CompilerResult<Option<Node>> {
    let sequence = pass.visit_required(node.sequence)?;
    if P::DECL_SCAN {
        if let NodeKind::Block(block) = &node.body.kind {
            let scope = pass.current_scope();
            decl_scan::bind_loop_variable(pass.env(), scope, block.scope, node.body.id, node.identifier, &sequence)?;
        }
    }
    let body = Box::new(visit_branch(pass, *node.body)?);
    Ok(Some(anchor.node(NodeKind::ForIn(ForIn {
        identifier: node.identifier,
        sequence,
        body,
    }))))
}

pub fn walk_block<P: CompilerPass>(pass: &mut P, anchor: Anchor, node: Block) -> CompilerResult<Option<Node>> {
    let scope = node.scope;
    trace!("[{}] enter scope {}", pass.name(), scope.0);
    pass.with_scope(scope, |pass| {
        if P::DECL_SCAN {
            decl_scan::scan_block(pass, &node.children)?;
        }
        let children = pass.visit_children(node.children)?;
        Ok(Some(anchor.node(NodeKind::Block(Block { scope, children }))))
    })
}

pub fn walk_return<P: CompilerPass>(pass: &mut P, anchor: Anchor, node: Return) -> CompilerResult<Option<Node>> {
    let expression = visit_optional(pass, node.expression)?;
    Ok(Some(anchor.node(NodeKind::Return(Return { expression }))))
}

/// Generic templates are left as written; only instantiations are lowered
pub fn walk_function_declaration<P: CompilerPass>(
    pass: &mut P,
    anchor: Anchor,
    node: FunctionDeclaration,
) -> CompilerResult<Option<Node>> {
    if node.is_generic() {
        return Ok(Some(anchor.node(NodeKind::FunctionDeclaration(node))));
    }
    let function_type = pass.visit_required(node.function_type)?;
    let body = Box::new(visit_branch(pass, *node.body)?);
    Ok(Some(anchor.node(NodeKind::FunctionDeclaration(FunctionDeclaration {
        function_type,
        body,
        ..node
    }))))
}

pub fn walk_struct_declaration<P: CompilerPass>(
    pass: &mut P,
    anchor: Anchor,
    node: StructDeclaration,
) -> CompilerResult<Option<Node>> {
    if node.is_generic() {
        return Ok(Some(anchor.node(NodeKind::StructDeclaration(node))));
    }
    let mut members = Vec::with_capacity(node.members.len());
    for mut member in node.members {
        member.member_type = pass.visit_required(member.member_type)?;
        members.push(member);
    }
    Ok(Some(anchor.node(NodeKind::StructDeclaration(StructDeclaration { members, ..node }))))
}

pub fn walk_trait_declaration<P: CompilerPass>(
    pass: &mut P,
    anchor: Anchor,
    node: TraitDeclaration,
) -> CompilerResult<Option<Node>> {
    if node.is_generic() {
        return Ok(Some(anchor.node(NodeKind::TraitDeclaration(node))));
    }
    let mut members = Vec::with_capacity(node.members.len());
    for mut member in node.members {
        member.member_type = pass.visit_required(member.member_type)?;
        members.push(member);
    }
    Ok(Some(anchor.node(NodeKind::TraitDeclaration(TraitDeclaration { members, ..node }))))
}

pub fn walk_test_declaration<P: CompilerPass>(
    pass: &mut P,
    anchor: Anchor,
    node: TestDeclaration,
) -> CompilerResult<Option<Node>> {
    let body = Box::new(visit_branch(pass, *node.body)?);
    Ok(Some(anchor.node(NodeKind::TestDeclaration(TestDeclaration { body, ..node }))))
}

pub fn walk_impl<P: CompilerPass>(pass: &mut P, anchor: Anchor, node: Impl) -> CompilerResult<Option<Node>> {
    let struct_type = pass.visit_required(node.struct_type)?;
    let children = pass.visit_children(node.children)?;
    Ok(Some(anchor.node(NodeKind::Impl(Impl { struct_type, children }))))
}

pub fn walk_impl_for<P: CompilerPass>(pass: &mut P, anchor: Anchor, node: ImplFor) -> CompilerResult<Option<Node>> {
    let trait_type = pass.visit_required(node.trait_type)?;
    let struct_type = pass.visit_required(node.struct_type)?;
    let children = pass.visit_children(node.children)?;
    Ok(Some(anchor.node(NodeKind::ImplFor(ImplFor {
        trait_type,
        struct_type,
        children,
    }))))
}

pub fn walk_match<P: CompilerPass>(pass: &mut P, anchor: Anchor, node: Match) -> CompilerResult<Option<Node>> {
    let expr = pass.visit_required(node.expr)?;
    let mut clauses = Vec::with_capacity(node.clauses.len());
    for clause in node.clauses {
        if P::DECL_SCAN {
            if let NodeKind::Block(block) = &clause.block.kind {
                let scope = pass.current_scope();
                decl_scan::bind_clause_value(
                    pass.env(),
                    scope,
                    block.scope,
                    clause.block.id,
                    clause.value_identifier,
                    &clause.value_type,
                )?;
            }
        }
        let value_type = pass.visit_required(clause.value_type)?;
        let block = Box::new(visit_branch(pass, *clause.block)?);
        clauses.push(MatchClause {
            value_identifier: clause.value_identifier,
            value_type,
            block,
        });
    }
    let else_clause = match node.else_clause {
        Some(clause) => Some(Box::new(visit_branch(pass, *clause)?)),
        None => None,
    };
    Ok(Some(anchor.node(NodeKind::Match(Match {
        expr,
        clauses,
        else_clause,
    }))))
}

pub fn walk_assert<P: CompilerPass>(pass: &mut P, anchor: Anchor, node: Assert) -> CompilerResult<Option<Node>> {
    let condition = pass.visit_required(node.condition)?;
    Ok(Some(anchor.node(NodeKind::Assert(Assert { condition, ..node }))))
}

pub fn walk_typealias<P: CompilerPass>(pass: &mut P, anchor: Anchor, node: Typealias) -> CompilerResult<Option<Node>> {
    let expression = pass.visit_required(node.expression)?;
    Ok(Some(anchor.node(NodeKind::Typealias(Typealias { expression, ..node }))))
}

/// A module already rewritten while scanning its enclosing block is
/// returned as stored
pub fn walk_module<P: CompilerPass>(pass: &mut P, anchor: Anchor, node: Module) -> CompilerResult<Option<Node>> {
    if let Some(scanned) = pass.state().scanned_modules.shift_remove(&node.name) {
        return Ok(Some(scanned));
    }
    let block = Box::new(visit_branch(pass, *node.block)?);
    Ok(Some(anchor.node(NodeKind::Module(Module { name: node.name, block }))))
}

pub fn walk_goto_if_false<P: CompilerPass>(
    pass: &mut P,
    anchor: Anchor,
    node: GotoIfFalse,
) -> CompilerResult<Option<Node>> {
    let condition = pass.visit_required(node.condition)?;
    Ok(Some(anchor.node(NodeKind::GotoIfFalse(GotoIfFalse {
        condition,
        target: node.target,
    }))))
}

/// Rebuild an expression around its visited children
pub fn walk_expr<P: CompilerPass>(pass: &mut P, expr: Expr) -> CompilerResult<Expr> {
    let anchor = Anchor::of_expr(&expr);
    let kind = match expr.kind {
        kind @ (ExprKind::LiteralInt(_)
        | ExprKind::LiteralBool(_)
        | ExprKind::LiteralString(_)
        | ExprKind::Identifier(_)
        | ExprKind::PrimitiveType(_)
        | ExprKind::GenericFunctionType(_)) => kind,
        ExprKind::LiteralArray { array_type, elements } => ExprKind::LiteralArray {
            array_type: visit_boxed(pass, array_type)?,
            elements: visit_all(pass, elements)?,
        },
        ExprKind::Unary { op, child } => ExprKind::Unary {
            op,
            child: visit_boxed(pass, child)?,
        },
        ExprKind::Binary { op, left, right } => ExprKind::Binary {
            op,
            left: visit_boxed(pass, left)?,
            right: visit_boxed(pass, right)?,
        },
        ExprKind::Assignment { lexpr, rexpr } => ExprKind::Assignment {
            lexpr: visit_boxed(pass, lexpr)?,
            rexpr: visit_boxed(pass, rexpr)?,
        },
        ExprKind::InitialAssignment { lexpr, rexpr } => ExprKind::InitialAssignment {
            lexpr: visit_boxed(pass, lexpr)?,
            rexpr: visit_boxed(pass, rexpr)?,
        },
        ExprKind::Call { callee, arguments } => ExprKind::Call {
            callee: visit_boxed(pass, callee)?,
            arguments: visit_all(pass, arguments)?,
        },
        ExprKind::As { expr, target_type } => ExprKind::As {
            expr: visit_boxed(pass, expr)?,
            target_type: visit_boxed(pass, target_type)?,
        },
        ExprKind::Bitcast { expr, target_type } => ExprKind::Bitcast {
            expr: visit_boxed(pass, expr)?,
            target_type: visit_boxed(pass, target_type)?,
        },
        ExprKind::Is { expr, test_type } => ExprKind::Is {
            expr: visit_boxed(pass, expr)?,
            test_type: visit_boxed(pass, test_type)?,
        },
        ExprKind::Subscript { subscriptable, argument } => ExprKind::Subscript {
            subscriptable: visit_boxed(pass, subscriptable)?,
            argument: visit_boxed(pass, argument)?,
        },
        ExprKind::Get { expr, member } => ExprKind::Get {
            expr: visit_boxed(pass, expr)?,
            member: Box::new(walk_member(pass, *member)?),
        },
        ExprKind::StructInitializer { struct_type, arguments } => {
            let struct_type = visit_boxed(pass, struct_type)?;
            let mut rebuilt = Vec::with_capacity(arguments.len());
            for argument in arguments {
                rebuilt.push(StructInitializerArgument {
                    name: argument.name,
                    expr: pass.visit_required(argument.expr)?,
                });
            }
            ExprKind::StructInitializer {
                struct_type,
                arguments: rebuilt,
            }
        }
        ExprKind::TypeOf(e) => ExprKind::TypeOf(visit_boxed(pass, e)?),
        ExprKind::SizeOf(e) => ExprKind::SizeOf(visit_boxed(pass, e)?),
        ExprKind::PointerType(e) => ExprKind::PointerType(visit_boxed(pass, e)?),
        ExprKind::ConstType(e) => ExprKind::ConstType(visit_boxed(pass, e)?),
        ExprKind::MutableType(e) => ExprKind::MutableType(visit_boxed(pass, e)?),
        ExprKind::DynamicArrayType(e) => ExprKind::DynamicArrayType(visit_boxed(pass, e)?),
        ExprKind::ArrayType { count, element_type } => ExprKind::ArrayType {
            count: count.map(|c| visit_boxed(pass, c)).transpose()?,
            element_type: visit_boxed(pass, element_type)?,
        },
        ExprKind::FunctionType {
            name,
            return_type,
            arguments,
        } => ExprKind::FunctionType {
            name,
            return_type: visit_boxed(pass, return_type)?,
            arguments: visit_all(pass, arguments)?,
        },
        ExprKind::GenericTypeApplication { identifier, arguments } => ExprKind::GenericTypeApplication {
            identifier,
            arguments: visit_all(pass, arguments)?,
        },
        ExprKind::UnionType(members) => ExprKind::UnionType(visit_all(pass, members)?),
        ExprKind::Eseq { seq, expr } => ExprKind::Eseq {
            seq: pass.visit_children(seq)?,
            expr: visit_boxed(pass, expr)?,
        },
    };
    Ok(anchor.expr(kind))
}

/// Member names are not expressions; only the type arguments of a generic
/// member application are visited
fn walk_member<P: CompilerPass>(pass: &mut P, member: Expr) -> CompilerResult<Expr> {
    let anchor = Anchor::of_expr(&member);
    match member.kind {
        ExprKind::GenericTypeApplication { identifier, arguments } => {
            Ok(anchor.expr(ExprKind::GenericTypeApplication {
                identifier,
                arguments: visit_all(pass, arguments)?,
            }))
        }
        kind => Ok(anchor.expr(kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snap_typed_ast::{BinaryOp, StorageClass, TypedASTBuilder};

    /// Structural identity pass
    struct Identity<'a> {
        env: &'a mut Environment,
        state: PassState,
    }

    impl CompilerPass for Identity<'_> {
        fn name(&self) -> &'static str {
            "IDENTITY"
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
    }

    /// Drops every assert and renames identifier `a` to `b`
    struct DropAsserts<'a> {
        env: &'a mut Environment,
        state: PassState,
        seen_scopes: Vec<ScopeId>,
    }

    impl CompilerPass for DropAsserts<'_> {
        fn name(&self) -> &'static str {
            "DROP_ASSERTS"
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

        fn visit_assert(&mut self, _anchor: Anchor, _node: Assert) -> CompilerResult<Option<Node>> {
            Ok(None)
        }

        fn visit_expr(&mut self, expr: Expr) -> CompilerResult<Option<Expr>> {
            self.seen_scopes.push(self.current_scope());
            match expr.kind {
                ExprKind::Identifier(name) if name == "a" => Ok(Some(expr.with_kind(ExprKind::Identifier("b".into())))),
                _ => walk_expr(self, expr).map(Some),
            }
        }
    }

    fn program(env: &mut Environment) -> (Node, ScopeId) {
        let mut b = TypedASTBuilder::new(env);
        b.begin_block();
        let inner = b.begin_block();
        let assert = Node::new(NodeKind::Assert(Assert {
            condition: Expr::literal_bool(true),
            message: "ok".to_string(),
        }));
        let stmt = Node::expr(Expr::binary(BinaryOp::Add, Expr::identifier("a"), Expr::literal_int(1)));
        let block = b.end_block(vec![assert, stmt]);
        (b.end_block(vec![block]), inner)
    }

    #[test]
    fn test_identity_preserves_tree_and_ids() {
        let mut env = Environment::new();
        let (tree, _) = program(&mut env);
        let mut pass = Identity {
            env: &mut env,
            state: PassState::new(),
        };
        let out = pass.run(tree.clone()).unwrap().unwrap();
        assert_eq!(out, tree);
        assert_eq!(out.id, tree.id);
        assert_eq!(pass.state.depth(), 0);
    }

    #[test]
    fn test_removed_statements_and_live_scope_stack() {
        let mut env = Environment::new();
        let (tree, inner) = program(&mut env);
        let mut pass = DropAsserts {
            env: &mut env,
            state: PassState::new(),
            seen_scopes: vec![],
        };
        let out = pass.run(tree).unwrap().unwrap();
        let block = out.as_block().unwrap().children[0].as_block().unwrap();
        assert_eq!(block.children.len(), 1);
        assert_eq!(
            block.children[0].as_expr().unwrap().to_string(),
            "(b + 1)"
        );
        assert!(pass.seen_scopes.iter().all(|s| *s == inner));
    }

    #[test]
    fn test_required_expression_cannot_be_removed() {
        struct RemoveAll<'a> {
            env: &'a mut Environment,
            state: PassState,
        }
        impl CompilerPass for RemoveAll<'_> {
            fn name(&self) -> &'static str {
                "REMOVE_ALL"
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
            fn visit_expr(&mut self, _expr: Expr) -> CompilerResult<Option<Expr>> {
                Ok(None)
            }
        }

        let mut env = Environment::new();
        let node = Node::var("x", None, Some(Expr::literal_int(1)), StorageClass::Static, false);
        let mut pass = RemoveAll {
            env: &mut env,
            state: PassState::new(),
        };
        let err = pass.run(node).unwrap_err();
        assert!(err.is_internal());
    }
}
