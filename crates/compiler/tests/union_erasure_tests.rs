//! Integration tests for union erasure
//!
//! A union value is lowered to a tagged struct; the tag is the index of the
//! stored member in the union's member list.

use snap_compiler::{erase_unions, LoweringConfig, LoweringPipeline};
use snap_typed_ast::typed_builder::union_type;
use snap_typed_ast::{Environment, Expr, ExprKind, Node, NodeKind, Span, TypedASTBuilder};

fn test_span() -> Option<Span> {
    Some(Span::new(0, 10))
}

fn members(names: &[&str]) -> Expr {
    union_type(names.iter().map(|n| Expr::identifier(*n)).collect())
}

fn union_array(count: i64, names: &[&str]) -> Expr {
    Expr::new(ExprKind::ArrayType {
        count: Some(Box::new(Expr::literal_int(count))),
        element_type: Box::new(members(names)),
    })
}

/// How many times `name` is called anywhere in `node`
fn calls_to(node: &Node, name: &str) -> usize {
    let mut count = 0;
    node.walk_exprs(&mut |e| {
        if let ExprKind::Call { callee, .. } = &e.kind {
            if callee.to_string() == name {
                count += 1;
            }
        }
    });
    count
}

/// The trailing integer of a rendered tag store or tag comparison
fn tag_in(rendered: &str) -> i64 {
    rendered
        .trim_end_matches(')')
        .rsplit(' ')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or_else(|| panic!("no tag in `{}'", rendered))
}

/// The statements a union declaration expanded into
fn expansion(node: &Node) -> Vec<String> {
    let NodeKind::Seq(seq) = &node.kind else {
        panic!("expected the declaration to expand into a Seq");
    };
    seq.children[1..]
        .iter()
        .map(|n| n.as_expr().unwrap().to_string())
        .collect()
}

#[test]
fn test_integer_stored_in_u8_or_bool() {
    let mut env = Environment::new();
    let mut b = TypedASTBuilder::new(&mut env);
    b.begin_block();
    let x = b.var("x", Some(members(&["u8", "bool"])), Some(Expr::literal_int(5)));
    let as_u8 = b.var("y", None, Some(Expr::as_cast(Expr::identifier("x"), Expr::identifier("u8"))));
    let is_bool = b.var(
        "z",
        None,
        Some(Expr::is_test(Expr::identifier("x"), Expr::identifier("bool")).with_span(test_span())),
    );
    let tree = b.end_block(vec![x, as_u8, is_bool]);

    let out = erase_unions(&mut env, tree).unwrap();
    let children = &out.as_block().unwrap().children;
    assert_eq!(
        expansion(&children[0]),
        vec!["x.tag := 0", "bitcast(&x.payload, *u8).pointee := 5"]
    );
    let y = children[1].as_var_declaration().unwrap();
    let Some(ExprKind::Eseq { expr, .. }) = y.expression.as_ref().map(|e| &e.kind) else {
        panic!("expected a checked extraction");
    };
    assert_eq!(expr.to_string(), "bitcast(&x.payload, *u8).pointee");
    let z = children[2].as_var_declaration().unwrap();
    assert_eq!(z.expression.as_ref().unwrap().to_string(), "(x.tag == 1)");
}

#[test]
fn test_each_member_gets_its_own_tag() {
    let mut env = Environment::new();
    let mut b = TypedASTBuilder::new(&mut env);
    b.begin_block();
    let u = || members(&["u8", "bool", "u16"]);
    let w = b.var("w", Some(Expr::identifier("u16")), Some(Expr::literal_int(1000)));
    let a = b.var("a", Some(u()), Some(Expr::literal_int(1)));
    let c = b.var("c", Some(u()), Some(Expr::literal_bool(true)));
    let d = b.var("d", Some(u()), Some(Expr::identifier("w")));
    let tree = b.end_block(vec![w, a, c, d]);

    let out = erase_unions(&mut env, tree).unwrap();
    let children = &out.as_block().unwrap().children;
    let tags: Vec<String> = children[1..].iter().map(|n| expansion(n)[0].clone()).collect();
    assert_eq!(tags, vec!["a.tag := 0", "c.tag := 1", "d.tag := 2"]);
    assert_eq!(expansion(&children[3])[1], "bitcast(&d.payload, *u16).pointee := w");

    let decl = match &children[1].kind {
        NodeKind::Seq(seq) => seq.children[0].as_var_declaration().unwrap().clone(),
        _ => unreachable!(),
    };
    assert_eq!(decl.explicit_type.unwrap().to_string(), "__union[u8, bool, u16]");
}

#[test]
fn test_union_to_union_store_copies_the_tagged_struct() {
    let mut env = Environment::new();
    let mut b = TypedASTBuilder::new(&mut env);
    b.begin_block();
    let a = b.var("a", Some(members(&["u8", "bool"])), Some(Expr::literal_bool(false)));
    let c = b.var("c", Some(members(&["u8", "bool"])), Some(Expr::identifier("a")));
    let tree = b.end_block(vec![a, c]);

    let out = erase_unions(&mut env, tree).unwrap();
    let children = &out.as_block().unwrap().children;
    assert_eq!(expansion(&children[1]), vec!["c := a"]);
}

/// `a[f()] = 5` with `a: [2](u8 | bool)`
fn subscript_store(env: &mut Environment) -> Node {
    let mut b = TypedASTBuilder::new(env);
    b.begin_block();
    b.begin_function();
    let f = b.end_function("f", Expr::identifier("u8"), vec![], vec![Node::ret(Some(Expr::literal_int(1)))]);
    let a = b.var("a", Some(union_array(2, &["u8", "bool"])), None);
    let store = Node::expr(
        Expr::assignment(
            Expr::subscript(Expr::identifier("a"), Expr::call(Expr::identifier("f"), vec![])),
            Expr::literal_int(5),
        )
        .with_span(test_span()),
    );
    b.end_block(vec![f, a, store])
}

#[test]
fn test_store_through_subscript_evaluates_the_index_once() {
    let mut env = Environment::new();
    let tree = subscript_store(&mut env);
    let out = erase_unions(&mut env, tree).unwrap();
    assert_eq!(calls_to(&out, "f"), 1);

    let store = out.as_block().unwrap().children[2].as_expr().unwrap();
    let ExprKind::Eseq { seq, expr } = &store.kind else {
        panic!("expected the store to split into tag and payload, got {}", store);
    };
    let address = seq[0].as_var_declaration().unwrap();
    assert_eq!(address.identifier.as_string(), "__temp0");
    assert_eq!(address.expression.as_ref().unwrap().to_string(), "&a[f()]");
    assert_eq!(seq[1].as_expr().unwrap().to_string(), "__temp0.pointee.tag = 0");
    assert_eq!(expr.to_string(), "bitcast(&__temp0.pointee.payload, *u8).pointee = 5");

    let mut env = Environment::new();
    let tree = subscript_store(&mut env);
    let lowered = LoweringPipeline::new(LoweringConfig::default()).run(&mut env, tree).unwrap();
    assert!(!lowered.contains_eseq());
    assert_eq!(calls_to(&lowered, "f"), 1);
}

#[test]
fn test_store_through_member_path_needs_no_temporary() {
    let mut env = Environment::new();
    let mut b = TypedASTBuilder::new(&mut env);
    b.begin_block();
    let s = b.struct_decl("S", vec![("u", members(&["u8", "bool"]))]);
    let v = b.var("v", Some(Expr::identifier("S")), None);
    let store = Node::expr(Expr::assignment(Expr::get(Expr::identifier("v"), "u"), Expr::literal_bool(true)));
    let tree = b.end_block(vec![s, v, store]);

    let out = erase_unions(&mut env, tree).unwrap();
    let store = out.as_block().unwrap().children[2].as_expr().unwrap();
    let ExprKind::Eseq { seq, expr } = &store.kind else {
        panic!("expected the store to split into tag and payload, got {}", store);
    };
    assert_eq!(seq.len(), 1);
    assert_eq!(seq[0].as_expr().unwrap().to_string(), "v.u.tag = 1");
    assert_eq!(expr.to_string(), "bitcast(&v.u.payload, *bool).pointee = true");
}

/// `g` returns `u8 | bool`; `var y = g() as u8`
fn cast_of_call(env: &mut Environment) -> Node {
    let mut b = TypedASTBuilder::new(env);
    b.begin_block();
    b.begin_function();
    let r = b.var("r", Some(members(&["u8", "bool"])), Some(Expr::literal_int(7)));
    let g = b.end_function(
        "g",
        members(&["u8", "bool"]),
        vec![],
        vec![r, Node::ret(Some(Expr::identifier("r")))],
    );
    let y = b.var(
        "y",
        None,
        Some(Expr::as_cast(Expr::call(Expr::identifier("g"), vec![]), Expr::identifier("u8")).with_span(test_span())),
    );
    b.end_block(vec![g, y])
}

#[test]
fn test_cast_out_of_call_result_reads_one_copy() {
    let mut env = Environment::new();
    let tree = cast_of_call(&mut env);
    let out = erase_unions(&mut env, tree).unwrap();
    assert_eq!(calls_to(&out, "g"), 1);

    let y = out.as_block().unwrap().children[1].as_var_declaration().unwrap();
    let Some(ExprKind::Eseq { seq, expr }) = y.expression.as_ref().map(|e| &e.kind) else {
        panic!("expected a checked extraction");
    };
    let copy = seq[0].as_var_declaration().unwrap();
    assert_eq!(copy.explicit_type.as_ref().unwrap().to_string(), "__union[u8, bool]");
    assert_eq!(copy.expression.as_ref().unwrap().to_string(), "g()");
    let NodeKind::If(guard) = &seq[1].kind else {
        panic!("expected a tag guard");
    };
    let temp = copy.identifier.as_string();
    assert_eq!(guard.condition.to_string(), format!("!({}.tag == 0)", temp));
    assert_eq!(expr.to_string(), format!("bitcast(&{}.payload, *u8).pointee", temp));

    let mut env = Environment::new();
    let tree = cast_of_call(&mut env);
    let lowered = LoweringPipeline::new(LoweringConfig::default()).run(&mut env, tree).unwrap();
    assert!(!lowered.contains_eseq());
    assert_eq!(calls_to(&lowered, "g"), 1);
}

#[test]
fn test_is_and_as_agree_with_the_stored_tag_for_every_member() {
    let cases = [("u8", Expr::literal_int(1)), ("bool", Expr::literal_bool(true)), ("u16", Expr::identifier("w"))];

    let mut env = Environment::new();
    let mut b = TypedASTBuilder::new(&mut env);
    b.begin_block();
    let mut children = vec![b.var("w", Some(Expr::identifier("u16")), Some(Expr::literal_int(1000)))];
    for (k, (member, value)) in cases.iter().enumerate() {
        let x = format!("x{}", k);
        children.push(b.var(&x, Some(members(&["u8", "bool", "u16"])), Some(value.clone())));
        children.push(b.var(
            &format!("is{}", k),
            None,
            Some(Expr::is_test(Expr::identifier(x.as_str()), Expr::identifier(*member))),
        ));
        children.push(b.var(
            &format!("as{}", k),
            None,
            Some(Expr::as_cast(Expr::identifier(x.as_str()), Expr::identifier(*member))),
        ));
    }
    let tree = b.end_block(children);
    let out = erase_unions(&mut env, tree).unwrap();
    let children = &out.as_block().unwrap().children;

    let mut tags = Vec::new();
    for k in 0..cases.len() {
        let stored = tag_in(&expansion(&children[1 + 3 * k])[0]);
        let tested = tag_in(&children[2 + 3 * k].as_var_declaration().unwrap().expression.as_ref().unwrap().to_string());
        let cast = children[3 + 3 * k].as_var_declaration().unwrap();
        let Some(ExprKind::Eseq { seq, .. }) = cast.expression.as_ref().map(|e| &e.kind) else {
            panic!("expected a checked extraction");
        };
        let NodeKind::If(guard) = &seq[0].kind else {
            panic!("expected a tag guard");
        };
        let guarded = tag_in(&guard.condition.to_string());
        assert_eq!((stored, tested, guarded), (k as i64, k as i64, k as i64), "member {}", cases[k].0);
        tags.push(stored);
    }
    assert_eq!(tags, vec![0, 1, 2]);
}
