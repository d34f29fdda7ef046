//! Integration tests for the full lowering pipeline
//!
//! These tests verify that a type-checked tree run through every stage:
//! 1. Keeps the left-to-right evaluation order of side effects
//! 2. Has no `Eseq` left anywhere
//! 3. Has no trait or union constructs left for code generation

use snap_compiler::{LoweringConfig, LoweringPipeline};
use snap_typed_ast::typed_builder::{function_type, union_type};
use snap_typed_ast::{
    BinaryOp, Environment, Expr, ExprKind, LayoutKind, Node, NodeKind, Span, TypedASTBuilder,
};

fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Trace)
        .try_init();
}

fn test_span() -> Option<Span> {
    Some(Span::new(0, 10))
}

fn returning(b: &mut TypedASTBuilder, name: &str, value: i64) -> Node {
    b.begin_function();
    b.end_function(name, Expr::identifier("u8"), vec![], vec![Node::ret(Some(Expr::literal_int(value)))])
}

/// One line per statement of a block, in order
fn rendered(node: &Node) -> Vec<String> {
    node.as_block()
        .expect("expected a block")
        .children
        .iter()
        .map(|child| match &child.kind {
            NodeKind::VarDeclaration(decl) => match &decl.expression {
                Some(expr) => format!("{} = {}", decl.identifier, expr),
                None => decl.identifier.as_string(),
            },
            NodeKind::FunctionDeclaration(func) => format!("fn {}", func.identifier),
            NodeKind::Expr(expr) => expr.to_string(),
            NodeKind::Return(ret) => format!(
                "return {}",
                ret.expression.as_ref().map(|e| e.to_string()).unwrap_or_default()
            ),
            other => format!("{:?}", std::mem::discriminant(other)),
        })
        .collect()
}

fn lower(env: &mut Environment, tree: Node) -> Node {
    LoweringPipeline::new(LoweringConfig::default()).run(env, tree).unwrap()
}

#[test]
fn test_subscript_store_lowers_value_then_index_then_address() {
    init_logging();
    let mut env = Environment::new();
    let mut b = TypedASTBuilder::new(&mut env);
    b.begin_block();
    let f = returning(&mut b, "f", 1);
    let g = returning(&mut b, "g", 2);
    let array = Expr::new(ExprKind::ArrayType {
        count: Some(Box::new(Expr::literal_int(4))),
        element_type: Box::new(Expr::identifier("u8")),
    });
    let a = b.var("a", Some(array), None);
    let store = Node::expr(
        Expr::assignment(
            Expr::subscript(Expr::identifier("a"), Expr::call(Expr::identifier("f"), vec![])),
            Expr::call(Expr::identifier("g"), vec![]),
        )
        .with_span(test_span()),
    );
    let tree = b.end_block(vec![f, g, a, store]);

    let out = lower(&mut env, tree);
    assert!(!out.contains_eseq());
    assert_eq!(
        rendered(&out),
        vec![
            "fn f",
            "fn g",
            "a",
            "__temp0 = g()",
            "__temp1 = f()",
            "__temp2 = &a[__temp1]",
            "__temp2.pointee = __temp0",
        ]
    );
}

#[test]
fn test_call_arguments_keep_their_evaluation_order() {
    init_logging();
    let mut env = Environment::new();
    let mut b = TypedASTBuilder::new(&mut env);
    b.begin_block();
    let f = returning(&mut b, "f", 1);
    let g = returning(&mut b, "g", 2);
    b.begin_function();
    let h = b.end_function(
        "h",
        Expr::identifier("void"),
        vec![("x", Expr::identifier("u8")), ("y", Expr::identifier("u8"))],
        vec![],
    );
    let call = Node::expr(Expr::call(
        Expr::identifier("h"),
        vec![
            Expr::call(Expr::identifier("f"), vec![]),
            Expr::call(Expr::identifier("g"), vec![]),
        ],
    ));
    let tree = b.end_block(vec![f, g, h, call]);

    let out = lower(&mut env, tree);
    let lines = rendered(&out);
    assert_eq!(&lines[3..], &["__temp0 = f()", "__temp1 = g()", "h(__temp0, __temp1)"]);
}

#[test]
fn test_no_eseq_survives_nested_statements() {
    init_logging();
    let mut env = Environment::new();
    let mut b = TypedASTBuilder::new(&mut env);
    b.begin_block();
    let f = returning(&mut b, "f", 1);
    let g = returning(&mut b, "g", 2);
    let s = b.struct_decl("S", vec![("a", Expr::identifier("u8")), ("b", Expr::identifier("u8"))]);
    let v = b.var(
        "v",
        None,
        Some(Expr::struct_initializer(
            Expr::identifier("S"),
            vec![
                ("a".into(), Expr::call(Expr::identifier("f"), vec![])),
                ("b".into(), Expr::call(Expr::identifier("g"), vec![])),
            ],
        )),
    );
    b.begin_function();
    let sum = b.end_function(
        "sum",
        Expr::identifier("u8"),
        vec![],
        vec![Node::ret(Some(Expr::binary(
            BinaryOp::Add,
            Expr::call(Expr::identifier("f"), vec![]),
            Expr::call(Expr::identifier("g"), vec![]),
        )))],
    );
    b.begin_block();
    let then = b.end_block(vec![Node::expr(Expr::assignment(
        Expr::get(Expr::identifier("v"), "a"),
        Expr::call(Expr::identifier("g"), vec![]),
    ))]);
    let branch = Node::if_then(
        Expr::binary(BinaryOp::Eq, Expr::call(Expr::identifier("f"), vec![]), Expr::literal_int(1)),
        then,
        None,
    );
    let tree = b.end_block(vec![f, g, s, v, sum, branch]);

    let out = lower(&mut env, tree);
    assert!(!out.contains_eseq());
}

#[test]
fn test_while_condition_with_side_effects() {
    init_logging();
    let build = |env: &mut Environment| {
        let mut b = TypedASTBuilder::new(env);
        b.begin_block();
        b.begin_function();
        let more = b.end_function(
            "more",
            Expr::identifier("bool"),
            vec![],
            vec![Node::ret(Some(Expr::literal_bool(false)))],
        );
        b.begin_block();
        let body = b.end_block(vec![]);
        let lp = b.while_loop(Expr::call(Expr::identifier("more"), vec![]), body);
        b.end_block(vec![more, lp])
    };

    let mut env = Environment::new();
    let tree = build(&mut env);
    let err = LoweringPipeline::new(LoweringConfig::default())
        .run(&mut env, tree)
        .unwrap_err();
    assert!(err.is_internal());
    assert_eq!(
        err.to_string(),
        "internal compiler error: unable to erase an Eseq when used as the condition of a while-loop"
    );

    let mut env = Environment::new();
    let tree = build(&mut env);
    let config = LoweringConfig {
        ignore_while_condition_eseq: true,
        ..LoweringConfig::default()
    };
    let out = LoweringPipeline::new(config).run(&mut env, tree).unwrap();
    let mut conditions = Vec::new();
    out.walk_nodes(&mut |n| {
        if let NodeKind::While(w) = &n.kind {
            conditions.push(w.condition.clone());
        }
    });
    assert_eq!(conditions.len(), 1);
    assert!(matches!(conditions[0].kind, ExprKind::Eseq { .. }));
}

#[test]
fn test_unions_are_gone_after_lowering() {
    init_logging();
    let mut env = Environment::new();
    let mut b = TypedASTBuilder::new(&mut env);
    b.begin_block();
    let u = || union_type(vec![Expr::identifier("u8"), Expr::identifier("bool")]);
    let x = b.var("x", Some(u()), Some(Expr::literal_int(5)));
    let y = b.var("y", None, Some(Expr::as_cast(Expr::identifier("x"), Expr::identifier("u8"))));
    let z = b.var("z", None, Some(Expr::is_test(Expr::identifier("x"), Expr::identifier("bool"))));
    let tree = b.end_block(vec![x, y, z]);

    let out = lower(&mut env, tree);
    assert!(!out.contains_eseq());
    out.walk_nodes(&mut |n| {
        if let Some(decl) = n.as_var_declaration() {
            if let Some(explicit) = &decl.explicit_type {
                assert!(!explicit.to_string().contains(" | "), "union type left on `{}'", decl.identifier);
            }
        }
    });
    let mut union_exprs = 0;
    out.walk_exprs(&mut |e| {
        if matches!(&e.kind, ExprKind::UnionType(_)) {
            union_exprs += 1;
        }
        if let ExprKind::PrimitiveType(ty) = &e.kind {
            assert!(!ty.is_union(), "union type `{}' left in the tree", ty);
        }
    });
    assert_eq!(union_exprs, 0);
}

#[test]
fn test_trait_objects_lower_to_plain_structs() {
    init_logging();
    let mut env = Environment::new();
    let mut b = TypedASTBuilder::new(&mut env);
    b.begin_block();
    let shape = b.trait_decl(
        "Shape",
        vec![(
            "area",
            function_type(None, Expr::identifier("u16"), vec![Expr::pointer_type(Expr::identifier("Shape"))]),
        )],
    );
    let circle = b.struct_decl("Circle", vec![("r", Expr::identifier("u16"))]);
    b.begin_function();
    let area = b.end_function(
        "area",
        Expr::identifier("u16"),
        vec![("self", Expr::pointer_type(Expr::identifier("Circle")))],
        vec![Node::ret(Some(Expr::literal_int(3)))],
    );
    let imp = b.impl_for("Shape", "Circle", vec![area]);
    let c = b.var(
        "c",
        None,
        Some(Expr::struct_initializer(Expr::identifier("Circle"), vec![("r".into(), Expr::literal_int(1))])),
    );
    let s = b.var("s", Some(Expr::identifier("Shape")), Some(Expr::identifier("c")));
    let tree = b.end_block(vec![shape, circle, imp, c, s]);

    let config = LoweringConfig {
        expose_implicit_conversions: true,
        ..LoweringConfig::default()
    };
    let out = LoweringPipeline::new(config).run(&mut env, tree).unwrap();
    assert!(!out.contains_eseq());
    out.walk_nodes(&mut |n| {
        assert!(
            !matches!(n.kind, NodeKind::TraitDeclaration(_) | NodeKind::ImplFor(_)),
            "trait construct left in the tree"
        );
    });
    let s = out
        .as_block()
        .unwrap()
        .children
        .iter()
        .filter_map(Node::as_var_declaration)
        .find(|d| d.identifier == "s")
        .cloned()
        .unwrap();
    assert_eq!(s.explicit_type.unwrap().to_string(), "__Shape_object");
}

#[test]
fn test_pipeline_builds_environment_with_configured_layout() {
    let pipeline = LoweringPipeline::new(LoweringConfig::default());
    let env = pipeline.environment();
    assert_eq!(env.layout_kind(), LayoutKind::Turtle16);
    assert_eq!(pipeline.config().layout, env.layout_kind());
}
