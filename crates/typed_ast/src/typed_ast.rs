//! # Snap Syntax Tree
//!
//! The closed set of statement and expression kinds that flows between the
//! lowering passes.
//!
//! ## Design Principles
//! - Every node carries a stable [`NodeId`] and an optional source [`Span`]
//! - Rebuilding a node around new children (`with_kind`) keeps its id, so
//!   scope bindings recorded against the id stay valid across passes
//! - Equality is structural: ids and spans do not take part in it
//! - Blocks own a [`ScopeId`] into the environment's scope arena

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::arena::InternedString;
use crate::environment::ScopeId;
use crate::source::Span;
use crate::type_registry::{GenericRef, Type, Visibility};

static NEXT_NODE_ID: AtomicU32 = AtomicU32::new(1);

/// Stable identity of a tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn fresh() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A statement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub span: Option<Span>,
    pub kind: NodeKind,
}

/// An expression, including type-level expressions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expr {
    pub id: NodeId,
    pub span: Option<Span>,
    pub kind: ExprKind,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Seq(Seq),
    VarDeclaration(VarDeclaration),
    If(If),
    While(While),
    ForIn(ForIn),
    Block(Block),
    Return(Return),
    FunctionDeclaration(FunctionDeclaration),
    StructDeclaration(StructDeclaration),
    TraitDeclaration(TraitDeclaration),
    TestDeclaration(TestDeclaration),
    Impl(Impl),
    ImplFor(ImplFor),
    Match(Match),
    Assert(Assert),
    Typealias(Typealias),
    Import(Import),
    Module(Module),
    Goto(Goto),
    GotoIfFalse(GotoIfFalse),
    LabelDeclaration(LabelDeclaration),
    /// Raw target instructions passed through to the backend
    Asm(Asm),
    /// Expression evaluated for its effect
    Expr(Expr),
}

/// Statements spliced into the enclosing list without opening a scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seq {
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageClass {
    Static,
    Automatic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarDeclaration {
    pub identifier: InternedString,
    pub explicit_type: Option<Expr>,
    pub expression: Option<Expr>,
    pub storage: StorageClass,
    pub is_mutable: bool,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct If {
    pub condition: Expr,
    pub then_branch: Box<Node>,
    pub else_branch: Option<Box<Node>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct While {
    pub condition: Expr,
    pub body: Box<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForIn {
    pub identifier: InternedString,
    pub sequence: Expr,
    pub body: Box<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub scope: ScopeId,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Return {
    pub expression: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub identifier: InternedString,
    /// A `FunctionType` expression
    pub function_type: Expr,
    pub argument_names: Vec<InternedString>,
    pub type_arguments: Vec<InternedString>,
    /// Always a `Block`; its scope is the function scope
    pub body: Box<Node>,
    pub visibility: Visibility,
}

impl FunctionDeclaration {
    pub fn is_generic(&self) -> bool {
        !self.type_arguments.is_empty()
    }

    pub fn scope(&self) -> Option<ScopeId> {
        match &self.body.kind {
            NodeKind::Block(block) => Some(block.scope),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructMember {
    pub name: InternedString,
    pub member_type: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructDeclaration {
    pub identifier: InternedString,
    pub type_arguments: Vec<InternedString>,
    pub members: Vec<StructMember>,
    pub visibility: Visibility,
    pub is_const: bool,
    /// Trait whose vtable or trait object this struct is
    pub associated_trait: Option<InternedString>,
}

impl StructDeclaration {
    pub fn is_generic(&self) -> bool {
        !self.type_arguments.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitDeclaration {
    pub identifier: InternedString,
    pub type_arguments: Vec<InternedString>,
    /// Each member type is a pointer-to-function type expression
    pub members: Vec<StructMember>,
    pub visibility: Visibility,
}

impl TraitDeclaration {
    pub fn is_generic(&self) -> bool {
        !self.type_arguments.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDeclaration {
    pub name: String,
    pub body: Box<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Impl {
    pub struct_type: Expr,
    /// `FunctionDeclaration` nodes
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplFor {
    pub trait_type: Expr,
    pub struct_type: Expr,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchClause {
    pub value_identifier: InternedString,
    pub value_type: Expr,
    /// Always a `Block`
    pub block: Box<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub expr: Expr,
    pub clauses: Vec<MatchClause>,
    pub else_clause: Option<Box<Node>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assert {
    pub condition: Expr,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Typealias {
    pub identifier: InternedString,
    pub expression: Expr,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Import {
    pub module_name: InternedString,
    /// Spread the module's public bindings instead of binding a namespace
    pub into_global_namespace: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: InternedString,
    /// Always a `Block`; its scope has no parent
    pub block: Box<Node>,
}

impl Module {
    pub fn scope(&self) -> Option<ScopeId> {
        match &self.block.kind {
            NodeKind::Block(block) => Some(block.scope),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goto {
    pub target: InternedString,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GotoIfFalse {
    pub condition: Expr,
    pub target: InternedString,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelDeclaration {
    pub identifier: InternedString,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asm {
    pub assembly: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Minus,
    Bang,
    Tilde,
    /// Address-of
    Ampersand,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnaryOp::Minus => "-",
            UnaryOp::Bang => "!",
            UnaryOp::Tilde => "~",
            UnaryOp::Ampersand => "&",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    LeftShift,
    RightShift,
    LogicalAnd,
    LogicalOr,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(self, BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge)
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::LogicalAnd | BinaryOp::LogicalOr)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
            BinaryOp::LeftShift => "<<",
            BinaryOp::RightShift => ">>",
            BinaryOp::LogicalAnd => "&&",
            BinaryOp::LogicalOr => "||",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructInitializerArgument {
    pub name: InternedString,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    LiteralInt(i64),
    LiteralBool(bool),
    LiteralString(String),
    LiteralArray {
        array_type: Box<Expr>,
        elements: Vec<Expr>,
    },
    Identifier(InternedString),
    Unary {
        op: UnaryOp,
        child: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Assignment {
        lexpr: Box<Expr>,
        rexpr: Box<Expr>,
    },
    /// The single permitted store into an otherwise-const binding
    InitialAssignment {
        lexpr: Box<Expr>,
        rexpr: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        arguments: Vec<Expr>,
    },
    As {
        expr: Box<Expr>,
        target_type: Box<Expr>,
    },
    Bitcast {
        expr: Box<Expr>,
        target_type: Box<Expr>,
    },
    Is {
        expr: Box<Expr>,
        test_type: Box<Expr>,
    },
    Subscript {
        subscriptable: Box<Expr>,
        argument: Box<Expr>,
    },
    /// Member access; the member is an identifier or a generic application
    Get {
        expr: Box<Expr>,
        member: Box<Expr>,
    },
    StructInitializer {
        struct_type: Box<Expr>,
        arguments: Vec<StructInitializerArgument>,
    },
    TypeOf(Box<Expr>),
    SizeOf(Box<Expr>),
    /// A resolved type lifted back into the tree
    PrimitiveType(Type),
    PointerType(Box<Expr>),
    ConstType(Box<Expr>),
    MutableType(Box<Expr>),
    ArrayType {
        count: Option<Box<Expr>>,
        element_type: Box<Expr>,
    },
    DynamicArrayType(Box<Expr>),
    FunctionType {
        name: Option<InternedString>,
        return_type: Box<Expr>,
        arguments: Vec<Expr>,
    },
    GenericFunctionType(GenericRef),
    GenericTypeApplication {
        identifier: InternedString,
        arguments: Vec<Expr>,
    },
    UnionType(Vec<Expr>),
    /// Run `seq`, then the value is `expr`
    Eseq {
        seq: Vec<Node>,
        expr: Box<Expr>,
    },
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            id: NodeId::fresh(),
            span: None,
            kind,
        }
    }

    pub fn with_span(mut self, span: Option<Span>) -> Self {
        self.span = span;
        self
    }

    /// Same identity and anchor around a rebuilt kind
    pub fn with_kind(&self, kind: NodeKind) -> Node {
        Node {
            id: self.id,
            span: self.span,
            kind,
        }
    }

    pub fn seq(children: Vec<Node>) -> Node {
        Node::new(NodeKind::Seq(Seq { children }))
    }

    pub fn block(scope: ScopeId, children: Vec<Node>) -> Node {
        Node::new(NodeKind::Block(Block { scope, children }))
    }

    pub fn expr(expr: Expr) -> Node {
        let span = expr.span;
        Node::new(NodeKind::Expr(expr)).with_span(span)
    }

    pub fn var(
        identifier: impl Into<InternedString>,
        explicit_type: Option<Expr>,
        expression: Option<Expr>,
        storage: StorageClass,
        is_mutable: bool,
    ) -> Node {
        Node::new(NodeKind::VarDeclaration(VarDeclaration {
            identifier: identifier.into(),
            explicit_type,
            expression,
            storage,
            is_mutable,
            visibility: Visibility::Private,
        }))
    }

    pub fn ret(expression: Option<Expr>) -> Node {
        Node::new(NodeKind::Return(Return { expression }))
    }

    pub fn if_then(condition: Expr, then_branch: Node, else_branch: Option<Node>) -> Node {
        Node::new(NodeKind::If(If {
            condition,
            then_branch: Box::new(then_branch),
            else_branch: else_branch.map(Box::new),
        }))
    }

    pub fn as_block(&self) -> Option<&Block> {
        match &self.kind {
            NodeKind::Block(block) => Some(block),
            _ => None,
        }
    }

    pub fn as_var_declaration(&self) -> Option<&VarDeclaration> {
        match &self.kind {
            NodeKind::VarDeclaration(decl) => Some(decl),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionDeclaration> {
        match &self.kind {
            NodeKind::FunctionDeclaration(func) => Some(func),
            _ => None,
        }
    }

    pub fn as_expr(&self) -> Option<&Expr> {
        match &self.kind {
            NodeKind::Expr(expr) => Some(expr),
            _ => None,
        }
    }

    /// Direct statement children, for nodes that hold a statement list
    pub fn statement_children(&self) -> &[Node] {
        match &self.kind {
            NodeKind::Seq(seq) => &seq.children,
            NodeKind::Block(block) => &block.children,
            NodeKind::Impl(imp) => &imp.children,
            NodeKind::ImplFor(imp) => &imp.children,
            _ => &[],
        }
    }

    /// Pre-order walk over every statement in the tree
    pub fn walk_nodes<'a>(&'a self, f: &mut dyn FnMut(&'a Node)) {
        f(self);
        match &self.kind {
            NodeKind::Seq(Seq { children }) | NodeKind::Block(Block { children, .. }) => {
                for child in children {
                    child.walk_nodes(f);
                }
            }
            NodeKind::Impl(imp) => imp.children.iter().for_each(|c| c.walk_nodes(f)),
            NodeKind::ImplFor(imp) => imp.children.iter().for_each(|c| c.walk_nodes(f)),
            NodeKind::VarDeclaration(decl) => {
                if let Some(expr) = &decl.expression {
                    walk_eseq_statements(expr, f);
                }
            }
            NodeKind::If(node) => {
                walk_eseq_statements(&node.condition, f);
                node.then_branch.walk_nodes(f);
                if let Some(else_branch) = &node.else_branch {
                    else_branch.walk_nodes(f);
                }
            }
            NodeKind::While(node) => {
                walk_eseq_statements(&node.condition, f);
                node.body.walk_nodes(f);
            }
            NodeKind::ForIn(node) => {
                walk_eseq_statements(&node.sequence, f);
                node.body.walk_nodes(f);
            }
            NodeKind::Return(node) => {
                if let Some(expr) = &node.expression {
                    walk_eseq_statements(expr, f);
                }
            }
            NodeKind::FunctionDeclaration(func) => func.body.walk_nodes(f),
            NodeKind::TestDeclaration(test) => test.body.walk_nodes(f),
            NodeKind::Match(node) => {
                walk_eseq_statements(&node.expr, f);
                for clause in &node.clauses {
                    clause.block.walk_nodes(f);
                }
                if let Some(else_clause) = &node.else_clause {
                    else_clause.walk_nodes(f);
                }
            }
            NodeKind::Assert(node) => walk_eseq_statements(&node.condition, f),
            NodeKind::GotoIfFalse(node) => walk_eseq_statements(&node.condition, f),
            NodeKind::Module(module) => module.block.walk_nodes(f),
            NodeKind::Expr(expr) => walk_eseq_statements(expr, f),
            NodeKind::StructDeclaration(_)
            | NodeKind::TraitDeclaration(_)
            | NodeKind::Typealias(_)
            | NodeKind::Import(_)
            | NodeKind::Goto(_)
            | NodeKind::LabelDeclaration(_)
            | NodeKind::Asm(_) => {}
        }
    }

    /// Every value expression reachable from this tree, outermost first
    pub fn walk_exprs<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        self.walk_nodes(&mut |node| {
            let roots: Vec<&Expr> = match &node.kind {
                NodeKind::VarDeclaration(decl) => decl.expression.iter().collect(),
                NodeKind::If(n) => vec![&n.condition],
                NodeKind::While(n) => vec![&n.condition],
                NodeKind::ForIn(n) => vec![&n.sequence],
                NodeKind::Return(n) => n.expression.iter().collect(),
                NodeKind::Match(n) => vec![&n.expr],
                NodeKind::Assert(n) => vec![&n.condition],
                NodeKind::GotoIfFalse(n) => vec![&n.condition],
                NodeKind::Expr(e) => vec![e],
                _ => vec![],
            };
            for root in roots {
                // Statements nested in an Eseq are reached by walk_nodes itself.
                root.walk_shallow(&mut *f);
            }
        });
    }

    pub fn contains_eseq(&self) -> bool {
        let mut found = false;
        self.walk_exprs(&mut |e| found |= matches!(e.kind, ExprKind::Eseq { .. }));
        found
    }

    /// Pretty JSON dump for stage debugging
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn walk_eseq_statements<'a>(expr: &'a Expr, f: &mut dyn FnMut(&'a Node)) {
    expr.walk_shallow(&mut |e| {
        if let ExprKind::Eseq { seq, .. } = &e.kind {
            for node in seq {
                node.walk_nodes(&mut *f);
            }
        }
    });
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Self {
            id: NodeId::fresh(),
            span: None,
            kind,
        }
    }

    pub fn with_span(mut self, span: Option<Span>) -> Self {
        self.span = span;
        self
    }

    pub fn with_kind(&self, kind: ExprKind) -> Expr {
        Expr {
            id: self.id,
            span: self.span,
            kind,
        }
    }

    pub fn identifier(name: impl Into<InternedString>) -> Expr {
        Expr::new(ExprKind::Identifier(name.into()))
    }

    pub fn literal_int(value: i64) -> Expr {
        Expr::new(ExprKind::LiteralInt(value))
    }

    pub fn literal_bool(value: bool) -> Expr {
        Expr::new(ExprKind::LiteralBool(value))
    }

    pub fn primitive_type(ty: Type) -> Expr {
        Expr::new(ExprKind::PrimitiveType(ty))
    }

    pub fn address_of(child: Expr) -> Expr {
        let span = child.span;
        Expr::new(ExprKind::Unary {
            op: UnaryOp::Ampersand,
            child: Box::new(child),
        })
        .with_span(span)
    }

    pub fn unary(op: UnaryOp, child: Expr) -> Expr {
        let span = child.span;
        Expr::new(ExprKind::Unary {
            op,
            child: Box::new(child),
        })
        .with_span(span)
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        let span = Span::union(left.span, right.span);
        Expr::new(ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
        .with_span(span)
    }

    pub fn get(expr: Expr, member: impl Into<InternedString>) -> Expr {
        let span = expr.span;
        Expr::new(ExprKind::Get {
            expr: Box::new(expr),
            member: Box::new(Expr::identifier(member).with_span(span)),
        })
        .with_span(span)
    }

    /// `expr.pointee`
    pub fn pointee(expr: Expr) -> Expr {
        Expr::get(expr, "pointee")
    }

    pub fn assignment(lexpr: Expr, rexpr: Expr) -> Expr {
        let span = Span::union(lexpr.span, rexpr.span);
        Expr::new(ExprKind::Assignment {
            lexpr: Box::new(lexpr),
            rexpr: Box::new(rexpr),
        })
        .with_span(span)
    }

    pub fn initial_assignment(lexpr: Expr, rexpr: Expr) -> Expr {
        let span = Span::union(lexpr.span, rexpr.span);
        Expr::new(ExprKind::InitialAssignment {
            lexpr: Box::new(lexpr),
            rexpr: Box::new(rexpr),
        })
        .with_span(span)
    }

    pub fn call(callee: Expr, arguments: Vec<Expr>) -> Expr {
        let span = callee.span;
        Expr::new(ExprKind::Call {
            callee: Box::new(callee),
            arguments,
        })
        .with_span(span)
    }

    pub fn as_cast(expr: Expr, target_type: Expr) -> Expr {
        let span = expr.span;
        Expr::new(ExprKind::As {
            expr: Box::new(expr),
            target_type: Box::new(target_type),
        })
        .with_span(span)
    }

    pub fn bitcast(expr: Expr, target_type: Expr) -> Expr {
        let span = expr.span;
        Expr::new(ExprKind::Bitcast {
            expr: Box::new(expr),
            target_type: Box::new(target_type),
        })
        .with_span(span)
    }

    pub fn is_test(expr: Expr, test_type: Expr) -> Expr {
        let span = expr.span;
        Expr::new(ExprKind::Is {
            expr: Box::new(expr),
            test_type: Box::new(test_type),
        })
        .with_span(span)
    }

    pub fn subscript(subscriptable: Expr, argument: Expr) -> Expr {
        let span = Span::union(subscriptable.span, argument.span);
        Expr::new(ExprKind::Subscript {
            subscriptable: Box::new(subscriptable),
            argument: Box::new(argument),
        })
        .with_span(span)
    }

    pub fn struct_initializer(struct_type: Expr, arguments: Vec<(InternedString, Expr)>) -> Expr {
        let span = struct_type.span;
        Expr::new(ExprKind::StructInitializer {
            struct_type: Box::new(struct_type),
            arguments: arguments
                .into_iter()
                .map(|(name, expr)| StructInitializerArgument { name, expr })
                .collect(),
        })
        .with_span(span)
    }

    pub fn eseq(seq: Vec<Node>, expr: Expr) -> Expr {
        let span = expr.span;
        Expr::new(ExprKind::Eseq {
            seq,
            expr: Box::new(expr),
        })
        .with_span(span)
    }

    pub fn pointer_type(pointee: Expr) -> Expr {
        let span = pointee.span;
        Expr::new(ExprKind::PointerType(Box::new(pointee))).with_span(span)
    }

    pub fn const_type(ty: Expr) -> Expr {
        let span = ty.span;
        Expr::new(ExprKind::ConstType(Box::new(ty))).with_span(span)
    }

    pub fn as_identifier(&self) -> Option<InternedString> {
        match &self.kind {
            ExprKind::Identifier(name) => Some(*name),
            _ => None,
        }
    }

    /// Operand of `&`, if this is an address-of
    pub fn as_address_of(&self) -> Option<&Expr> {
        match &self.kind {
            ExprKind::Unary {
                op: UnaryOp::Ampersand,
                child,
            } => Some(child),
            _ => None,
        }
    }

    /// Pre-order walk, descending into statements held by an Eseq
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        self.walk_shallow(f);
        self.walk_shallow(&mut |e| {
            if let ExprKind::Eseq { seq, .. } = &e.kind {
                for node in seq {
                    node.walk_exprs(&mut *f);
                }
            }
        });
    }

    /// Pre-order walk that stops at Eseq statement prefaces
    pub fn walk_shallow<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        for child in self.children() {
            child.walk_shallow(f);
        }
    }

    /// Direct sub-expressions, in evaluation order
    pub fn children(&self) -> Vec<&Expr> {
        match &self.kind {
            ExprKind::LiteralInt(_)
            | ExprKind::LiteralBool(_)
            | ExprKind::LiteralString(_)
            | ExprKind::Identifier(_)
            | ExprKind::PrimitiveType(_)
            | ExprKind::GenericFunctionType(_) => vec![],
            ExprKind::LiteralArray { array_type, elements } => {
                std::iter::once(array_type.as_ref()).chain(elements.iter()).collect()
            }
            ExprKind::Unary { child, .. } => vec![child],
            ExprKind::Binary { left, right, .. } => vec![left, right],
            ExprKind::Assignment { lexpr, rexpr } | ExprKind::InitialAssignment { lexpr, rexpr } => {
                vec![lexpr, rexpr]
            }
            ExprKind::Call { callee, arguments } => std::iter::once(callee.as_ref()).chain(arguments.iter()).collect(),
            ExprKind::As { expr, target_type } | ExprKind::Bitcast { expr, target_type } => vec![expr, target_type],
            ExprKind::Is { expr, test_type } => vec![expr, test_type],
            ExprKind::Subscript { subscriptable, argument } => vec![subscriptable, argument],
            ExprKind::Get { expr, member } => vec![expr, member],
            ExprKind::StructInitializer { struct_type, arguments } => std::iter::once(struct_type.as_ref())
                .chain(arguments.iter().map(|a| &a.expr))
                .collect(),
            ExprKind::TypeOf(e)
            | ExprKind::SizeOf(e)
            | ExprKind::PointerType(e)
            | ExprKind::ConstType(e)
            | ExprKind::MutableType(e)
            | ExprKind::DynamicArrayType(e) => vec![e],
            ExprKind::ArrayType { count, element_type } => count
                .iter()
                .map(|c| c.as_ref())
                .chain(std::iter::once(element_type.as_ref()))
                .collect(),
            ExprKind::FunctionType { return_type, arguments, .. } => {
                std::iter::once(return_type.as_ref()).chain(arguments.iter()).collect()
            }
            ExprKind::GenericTypeApplication { arguments, .. } => arguments.iter().collect(),
            ExprKind::UnionType(members) => members.iter().collect(),
            ExprKind::Eseq { expr, .. } => vec![expr],
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::LiteralInt(v) => write!(f, "{}", v),
            ExprKind::LiteralBool(v) => write!(f, "{}", v),
            ExprKind::LiteralString(s) => write!(f, "{:?}", s),
            ExprKind::LiteralArray { array_type, elements } => {
                let parts: Vec<String> = elements.iter().map(|e| e.to_string()).collect();
                write!(f, "{}{{{}}}", array_type, parts.join(", "))
            }
            ExprKind::Identifier(name) => write!(f, "{}", name),
            ExprKind::Unary { op, child } => write!(f, "{}{}", op, child),
            ExprKind::Binary { op, left, right } => write!(f, "({} {} {})", left, op, right),
            ExprKind::Assignment { lexpr, rexpr } => write!(f, "{} = {}", lexpr, rexpr),
            ExprKind::InitialAssignment { lexpr, rexpr } => write!(f, "{} := {}", lexpr, rexpr),
            ExprKind::Call { callee, arguments } => {
                let parts: Vec<String> = arguments.iter().map(|e| e.to_string()).collect();
                write!(f, "{}({})", callee, parts.join(", "))
            }
            ExprKind::As { expr, target_type } => write!(f, "({} as {})", expr, target_type),
            ExprKind::Bitcast { expr, target_type } => write!(f, "bitcast({}, {})", expr, target_type),
            ExprKind::Is { expr, test_type } => write!(f, "({} is {})", expr, test_type),
            ExprKind::Subscript { subscriptable, argument } => write!(f, "{}[{}]", subscriptable, argument),
            ExprKind::Get { expr, member } => write!(f, "{}.{}", expr, member),
            ExprKind::StructInitializer { struct_type, arguments } => {
                let parts: Vec<String> = arguments.iter().map(|a| format!(".{} = {}", a.name, a.expr)).collect();
                write!(f, "{}{{{}}}", struct_type, parts.join(", "))
            }
            ExprKind::TypeOf(e) => write!(f, "typeof({})", e),
            ExprKind::SizeOf(e) => write!(f, "sizeof({})", e),
            ExprKind::PrimitiveType(ty) => write!(f, "{}", ty),
            ExprKind::PointerType(e) => write!(f, "*{}", e),
            ExprKind::ConstType(e) => write!(f, "const {}", e),
            ExprKind::MutableType(e) => write!(f, "mut {}", e),
            ExprKind::ArrayType { count: Some(c), element_type } => write!(f, "[{}]{}", c, element_type),
            ExprKind::ArrayType { count: None, element_type } => write!(f, "[_]{}", element_type),
            ExprKind::DynamicArrayType(e) => write!(f, "[]{}", e),
            ExprKind::FunctionType { return_type, arguments, .. } => {
                let parts: Vec<String> = arguments.iter().map(|e| e.to_string()).collect();
                write!(f, "func ({}) -> {}", parts.join(", "), return_type)
            }
            ExprKind::GenericFunctionType(g) => write!(f, "{}", g.name),
            ExprKind::GenericTypeApplication { identifier, arguments } => {
                let parts: Vec<String> = arguments.iter().map(|e| e.to_string()).collect();
                write!(f, "{}@({})", identifier, parts.join(", "))
            }
            ExprKind::UnionType(members) => {
                let parts: Vec<String> = members.iter().map(|e| e.to_string()).collect();
                write!(f, "{}", parts.join(" | "))
            }
            ExprKind::Eseq { seq, expr } => write!(f, "Eseq[{} stmts]({})", seq.len(), expr),
        }
    }
}
