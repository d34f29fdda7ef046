//! Integration tests for declaration scanning inside passes
//!
//! Every scanning pass binds a block's declarations before it visits the
//! block's statements; these tests drive that through real passes.

use snap_compiler::{decompose, expose_conversions};
use snap_typed_ast::{Environment, Expr, Node, NodeKind, TypedASTBuilder, Visibility};

fn public(mut node: Node) -> Node {
    if let NodeKind::FunctionDeclaration(func) = &mut node.kind {
        func.visibility = Visibility::Public;
    }
    node
}

#[test]
fn test_functions_and_structs_are_usable_before_their_declaration() {
    let mut env = Environment::new();
    let mut b = TypedASTBuilder::new(&mut env);
    b.begin_block();
    let p = b.var(
        "p",
        None,
        Some(Expr::struct_initializer(Expr::identifier("Point"), vec![("x".into(), Expr::literal_int(1))])),
    );
    let call = Node::expr(Expr::call(Expr::identifier("later"), vec![Expr::get(Expr::identifier("p"), "x")]));
    b.begin_function();
    let later = b.end_function("later", Expr::identifier("void"), vec![("v", Expr::identifier("u8"))], vec![]);
    let point = b.struct_decl("Point", vec![("x", Expr::identifier("u8"))]);
    let tree = b.end_block(vec![p, call, later, point]);

    let out = decompose(&mut env, tree).unwrap();
    assert_eq!(out.as_block().unwrap().children.len(), 4);
}

#[test]
fn test_import_binds_only_public_module_symbols() {
    let build = |env: &mut Environment, callee: &str| {
        let mut b = TypedASTBuilder::new(env);
        b.begin_block();
        b.begin_module();
        b.begin_function();
        let shown = public(b.end_function("shown", Expr::identifier("void"), vec![], vec![]));
        b.begin_function();
        let hidden = b.end_function("hidden", Expr::identifier("void"), vec![], vec![]);
        let module = b.end_module("util", vec![shown, hidden]);
        let import = b.import("util", true);
        let call = Node::expr(Expr::call(Expr::identifier(callee), vec![]));
        b.end_block(vec![module, import, call])
    };

    let mut env = Environment::new();
    let tree = build(&mut env, "shown");
    expose_conversions(&mut env, tree).unwrap();

    let mut env = Environment::new();
    let tree = build(&mut env, "hidden");
    let err = expose_conversions(&mut env, tree).unwrap_err();
    assert_eq!(err.message(), "use of unresolved identifier: `hidden'");
}

#[test]
fn test_import_of_unknown_module() {
    let mut env = Environment::new();
    let mut b = TypedASTBuilder::new(&mut env);
    b.begin_block();
    let import = b.import("nowhere", true);
    let tree = b.end_block(vec![import]);
    let err = expose_conversions(&mut env, tree).unwrap_err();
    assert_eq!(err.message(), "failed to get symbols for module `nowhere'");
}

#[test]
fn test_import_is_only_valid_at_file_scope() {
    let mut env = Environment::new();
    let mut b = TypedASTBuilder::new(&mut env);
    b.begin_block();
    b.begin_module();
    let module = b.end_module("util", vec![]);
    b.begin_block();
    let import = b.import("util", true);
    let nested = b.end_block(vec![import]);
    let tree = b.end_block(vec![module, nested]);
    let err = expose_conversions(&mut env, tree).unwrap_err();
    assert_eq!(err.message(), "declaration is only valid at file scope");
}

#[test]
fn test_redefinition_in_one_scope() {
    let mut env = Environment::new();
    let mut b = TypedASTBuilder::new(&mut env);
    b.begin_block();
    let s = b.struct_decl("Thing", vec![]);
    b.begin_function();
    let f = b.end_function("Thing", Expr::identifier("void"), vec![], vec![]);
    let tree = b.end_block(vec![s, f]);
    let err = expose_conversions(&mut env, tree).unwrap_err();
    assert_eq!(err.message(), "function redefines existing type: `Thing'");
}

/// A block holding module `util` (public `shown`), then `rest`
fn with_util_module(env: &mut Environment, rest: impl FnOnce(&mut TypedASTBuilder) -> Vec<Node>) -> Node {
    let mut b = TypedASTBuilder::new(env);
    b.begin_block();
    b.begin_module();
    b.begin_function();
    let shown = public(b.end_function("shown", Expr::identifier("void"), vec![], vec![]));
    let module = b.end_module("util", vec![shown]);
    let mut children = vec![module];
    children.extend(rest(&mut b));
    b.end_block(children)
}

#[test]
fn test_namespace_import_binds_module_as_value() {
    let mut env = Environment::new();
    let tree = with_util_module(&mut env, |b| {
        vec![
            b.import("util", false),
            Node::expr(Expr::call(Expr::get(Expr::identifier("util"), "shown"), vec![])),
        ]
    });
    expose_conversions(&mut env, tree).unwrap();

    let mut env = Environment::new();
    let tree = with_util_module(&mut env, |b| {
        vec![b.import("util", false), Node::expr(Expr::call(Expr::identifier("shown"), vec![]))]
    });
    let err = expose_conversions(&mut env, tree).unwrap_err();
    assert_eq!(err.message(), "use of unresolved identifier: `shown'");
}

#[test]
fn test_importing_a_module_twice_is_a_no_op() {
    let mut env = Environment::new();
    let tree = with_util_module(&mut env, |b| {
        vec![
            b.import("util", true),
            b.import("util", true),
            Node::expr(Expr::call(Expr::identifier("shown"), vec![])),
        ]
    });
    expose_conversions(&mut env, tree).unwrap();
}

#[test]
fn test_imported_name_collides_with_local_function() {
    let mut env = Environment::new();
    let tree = with_util_module(&mut env, |b| {
        let import = b.import("util", true);
        b.begin_function();
        let local = b.end_function("shown", Expr::identifier("void"), vec![], vec![]);
        vec![import, local]
    });
    let err = expose_conversions(&mut env, tree).unwrap_err();
    assert_eq!(err.message(), "function redefines existing symbol: `shown'");
}
