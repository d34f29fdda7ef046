//! # Tree Builder
//!
//! Fluent construction of Snap trees with correctly nested scopes. Blocks,
//! function bodies and modules each need a scope in the environment arena
//! whose parent is the enclosing scope; the builder keeps a stack of open
//! scopes so callers only say where a block begins and ends.
//!
//! ```rust
//! use snap_typed_ast::{Environment, Expr, TypedASTBuilder};
//!
//! let mut env = Environment::new();
//! let mut b = TypedASTBuilder::new(&mut env);
//! b.begin_block();
//! let decl = b.var("a", Some(Expr::identifier("u8")), Some(Expr::literal_int(1)));
//! let program = b.end_block(vec![decl]);
//! assert!(program.as_block().is_some());
//! ```

use crate::arena::InternedString;
use crate::environment::{Environment, ScopeId};
use crate::source::Span;
use crate::type_registry::Visibility;
use crate::typed_ast::*;

pub struct TypedASTBuilder<'a> {
    env: &'a mut Environment,
    scopes: Vec<ScopeId>,
}

impl<'a> TypedASTBuilder<'a> {
    pub fn new(env: &'a mut Environment) -> Self {
        Self { env, scopes: Vec::new() }
    }

    pub fn env(&mut self) -> &mut Environment {
        self.env
    }

    /// Innermost open scope, or the environment root
    pub fn current_scope(&self) -> ScopeId {
        self.scopes.last().copied().unwrap_or_else(|| self.env.root())
    }

    pub fn span(&self, start: usize, end: usize) -> Option<Span> {
        Some(Span::new(start, end))
    }

    pub fn begin_block(&mut self) -> ScopeId {
        let parent = self.current_scope();
        let scope = self.env.new_scope(Some(parent));
        self.scopes.push(scope);
        scope
    }

    pub fn end_block(&mut self, children: Vec<Node>) -> Node {
        let scope = self.pop_scope();
        Node::block(scope, children)
    }

    fn pop_scope(&mut self) -> ScopeId {
        self.scopes.pop().unwrap_or_else(|| self.env.root())
    }

    /// Open a function body; it owns its own frame
    pub fn begin_function(&mut self) -> ScopeId {
        let parent = self.current_scope();
        let scope = self.env.new_scope_with_frame(Some(parent), Environment::function_frame());
        self.scopes.push(scope);
        scope
    }

    /// Close a function body. `arguments` pairs each name with its type expression.
    pub fn end_function(
        &mut self,
        name: &str,
        return_type: Expr,
        arguments: Vec<(&str, Expr)>,
        children: Vec<Node>,
    ) -> Node {
        self.end_generic_function(name, vec![], return_type, arguments, children)
    }

    pub fn end_generic_function(
        &mut self,
        name: &str,
        type_arguments: Vec<&str>,
        return_type: Expr,
        arguments: Vec<(&str, Expr)>,
        children: Vec<Node>,
    ) -> Node {
        let body = self.end_block(children);
        let (argument_names, argument_types): (Vec<InternedString>, Vec<Expr>) =
            arguments.into_iter().map(|(n, t)| (InternedString::from(n), t)).unzip();
        Node::new(NodeKind::FunctionDeclaration(FunctionDeclaration {
            identifier: name.into(),
            function_type: function_type(Some(name), return_type, argument_types),
            argument_names,
            type_arguments: type_arguments.into_iter().map(InternedString::from).collect(),
            body: Box::new(body),
            visibility: Visibility::Private,
        }))
    }

    /// Open a module; it sees the builtins of the root scope but nothing of
    /// the enclosing program
    pub fn begin_module(&mut self) -> ScopeId {
        let root = self.env.root();
        let scope = self.env.new_scope(Some(root));
        self.scopes.push(scope);
        scope
    }

    pub fn end_module(&mut self, name: &str, children: Vec<Node>) -> Node {
        let block = self.end_block(children);
        Node::new(NodeKind::Module(Module {
            name: name.into(),
            block: Box::new(block),
        }))
    }

    pub fn var(&self, name: &str, explicit_type: Option<Expr>, expression: Option<Expr>) -> Node {
        Node::var(name, explicit_type, expression, StorageClass::Automatic, true)
    }

    pub fn let_(&self, name: &str, explicit_type: Option<Expr>, expression: Option<Expr>) -> Node {
        Node::var(name, explicit_type, expression, StorageClass::Automatic, false)
    }

    pub fn static_var(&self, name: &str, explicit_type: Option<Expr>, expression: Option<Expr>) -> Node {
        Node::var(name, explicit_type, expression, StorageClass::Static, true)
    }

    pub fn struct_decl(&self, name: &str, members: Vec<(&str, Expr)>) -> Node {
        Node::new(NodeKind::StructDeclaration(StructDeclaration {
            identifier: name.into(),
            type_arguments: vec![],
            members: members
                .into_iter()
                .map(|(n, t)| StructMember {
                    name: n.into(),
                    member_type: t,
                })
                .collect(),
            visibility: Visibility::Private,
            is_const: false,
            associated_trait: None,
        }))
    }

    pub fn generic_struct_decl(&self, name: &str, type_arguments: Vec<&str>, members: Vec<(&str, Expr)>) -> Node {
        let mut node = self.struct_decl(name, members);
        if let NodeKind::StructDeclaration(decl) = &mut node.kind {
            decl.type_arguments = type_arguments.into_iter().map(InternedString::from).collect();
        }
        node
    }

    /// `members` pairs a method name with its function type expression
    pub fn trait_decl(&self, name: &str, members: Vec<(&str, Expr)>) -> Node {
        Node::new(NodeKind::TraitDeclaration(TraitDeclaration {
            identifier: name.into(),
            type_arguments: vec![],
            members: members
                .into_iter()
                .map(|(n, t)| StructMember {
                    name: n.into(),
                    member_type: Expr::pointer_type(t),
                })
                .collect(),
            visibility: Visibility::Private,
        }))
    }

    pub fn impl_block(&self, struct_name: &str, children: Vec<Node>) -> Node {
        Node::new(NodeKind::Impl(Impl {
            struct_type: Expr::identifier(struct_name),
            children,
        }))
    }

    pub fn impl_for(&self, trait_name: &str, struct_name: &str, children: Vec<Node>) -> Node {
        Node::new(NodeKind::ImplFor(ImplFor {
            trait_type: Expr::identifier(trait_name),
            struct_type: Expr::identifier(struct_name),
            children,
        }))
    }

    pub fn import(&self, module: &str, into_global_namespace: bool) -> Node {
        Node::new(NodeKind::Import(Import {
            module_name: module.into(),
            into_global_namespace,
        }))
    }

    pub fn while_loop(&self, condition: Expr, body: Node) -> Node {
        Node::new(NodeKind::While(While {
            condition,
            body: Box::new(body),
        }))
    }
}

/// `func name(args) -> ret` type expression
pub fn function_type(name: Option<&str>, return_type: Expr, arguments: Vec<Expr>) -> Expr {
    Expr::new(ExprKind::FunctionType {
        name: name.map(InternedString::from),
        return_type: Box::new(return_type),
        arguments,
    })
}

pub fn union_type(members: Vec<Expr>) -> Expr {
    Expr::new(ExprKind::UnionType(members))
}

pub fn type_name(name: &str) -> Expr {
    Expr::identifier(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_scopes_link_to_parents() {
        let mut env = Environment::new();
        let mut b = TypedASTBuilder::new(&mut env);
        let outer = b.begin_block();
        let func = b.begin_function();
        let f = b.end_function("f", type_name("void"), vec![("x", type_name("u8"))], vec![]);
        let program = b.end_block(vec![f]);

        assert_eq!(env.parent(func), Some(outer));
        assert_eq!(env.parent(outer), Some(env.root()));
        let block = program.as_block().unwrap();
        let decl = block.children[0].as_function().unwrap();
        assert_eq!(decl.scope(), Some(func));
        assert_eq!(decl.argument_names, vec![InternedString::from("x")]);
    }

    #[test]
    fn test_module_scope_hangs_off_root() {
        let mut env = Environment::new();
        let mut b = TypedASTBuilder::new(&mut env);
        b.begin_block();
        b.begin_block();
        let module_scope = b.begin_module();
        let module = b.end_module("m", vec![]);
        b.end_block(vec![module]);
        b.end_block(vec![]);
        assert_eq!(env.parent(module_scope), Some(env.root()));
    }
}
