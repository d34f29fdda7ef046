//! # Type Checker
//!
//! The type-checking oracle queried by every lowering pass. It answers three
//! questions about an expression evaluated in a given scope:
//!
//! - [`TypeChecker::check`]: the rvalue type of the expression
//! - [`TypeChecker::check_type_expr`]: the type an expression denotes when it
//!   appears in a type position
//! - [`TypeChecker::check_lvalue`]: the type of the storage an expression
//!   designates, or `None` when it is not addressable
//!
//! and decides whether a value of one type may be converted to another
//! ([`TypeChecker::check_convertibility`]).
//!
//! Generic structs, traits and functions are instantiated on demand when a
//! type application is checked; instantiations are memoized in the
//! [`TypeRegistry`](crate::type_registry::TypeRegistry) by argument list.

use log::trace;

use crate::arena::InternedString;
use crate::environment::{Environment, ScopeId, TypeRecord};
use crate::error::{CompilerError, CompilerResult};
use crate::mangler;
use crate::nominal;
use crate::source::Span;
use crate::type_registry::{ArithmeticType, BooleanType, FunctionType, GenericRef, IntClass, Type, Visibility};
use crate::typed_ast::{BinaryOp, Expr, ExprKind, UnaryOp};

/// Outcome of a convertibility query
#[derive(Debug, Clone, PartialEq)]
pub enum Convertibility {
    /// The conversion is allowed and yields a value of this type
    Acceptable(Type),
    Unacceptable(CompilerError),
}

impl Convertibility {
    pub fn is_acceptable(&self) -> bool {
        matches!(self, Convertibility::Acceptable(_))
    }

    pub fn into_result(self) -> CompilerResult<Type> {
        match self {
            Convertibility::Acceptable(ty) => Ok(ty),
            Convertibility::Unacceptable(err) => Err(err),
        }
    }
}

/// Name of the implicit dereference member of pointers
pub const POINTEE: &str = "pointee";
/// Name of the element-count member of arrays
pub const COUNT: &str = "count";

pub struct TypeChecker<'a> {
    env: &'a mut Environment,
    scope: ScopeId,
}

impl<'a> TypeChecker<'a> {
    pub fn new(env: &'a mut Environment, scope: ScopeId) -> Self {
        Self { env, scope }
    }

    /// Rvalue type of `expr`
    pub fn check(&mut self, expr: &Expr) -> CompilerResult<Type> {
        let span = expr.span;
        let ty = match &expr.kind {
            ExprKind::LiteralInt(value) => Type::comp_time_int(*value),
            ExprKind::LiteralBool(value) => Type::comp_time_bool(*value),
            ExprKind::LiteralString(text) => Type::array(
                Some(text.len()),
                Type::Arithmetic(ArithmeticType::Immutable(IntClass::U8)),
            ),
            ExprKind::LiteralArray { array_type, elements } => self.check_literal_array(array_type, elements)?,
            ExprKind::Identifier(name) => self.check_identifier(*name, span)?,
            ExprKind::Unary { op, child } => self.check_unary(*op, child, span)?,
            ExprKind::Binary { op, left, right } => self.check_binary(*op, left, right, span)?,
            ExprKind::Assignment { lexpr, rexpr } => self.check_assignment(lexpr, rexpr, false, span)?,
            ExprKind::InitialAssignment { lexpr, rexpr } => self.check_assignment(lexpr, rexpr, true, span)?,
            ExprKind::Call { callee, arguments } => self.check_call(callee, arguments, span)?,
            ExprKind::As { expr: inner, target_type } => {
                let target = self.check_type_expr(target_type)?;
                let from = self.check(inner)?;
                self.check_convertibility(&from, &target, true)
                    .into_result()
                    .map_err(|e| e.or_span(span))?;
                target
            }
            ExprKind::Bitcast { expr: inner, target_type } => {
                self.check(inner)?;
                self.check_type_expr(target_type)?
            }
            ExprKind::Is { expr: inner, test_type } => {
                let from = self.check(inner)?;
                let test = self.check_type_expr(test_type)?;
                match from {
                    Type::Union(_) => Type::BOOL,
                    other => Type::comp_time_bool(other.same_modulo_const(&test)),
                }
            }
            ExprKind::Subscript { subscriptable, argument } => self.check_subscript(subscriptable, argument, span)?,
            ExprKind::Get { expr: object, member } => self.check_get(object, member, span)?,
            ExprKind::StructInitializer { struct_type, arguments } => {
                let ty = self.check_type_expr(struct_type)?;
                let sref = ty.as_struct().ok_or_else(|| {
                    CompilerError::type_mismatch(format!("expected a struct type, got `{}'", ty), span)
                })?;
                let mut seen = Vec::new();
                for argument in arguments {
                    if seen.contains(&argument.name) {
                        return Err(CompilerError::structural(
                            format!("duplicate initialization of member `{}'", argument.name),
                            argument.expr.span.or(span),
                        ));
                    }
                    seen.push(argument.name);
                    let field = nominal::struct_member(self.env, sref, argument.name)
                        .map(|s| s.ty.clone())
                        .ok_or_else(|| {
                            CompilerError::unresolved_identifier(
                                format!("{}.{}", sref.name, argument.name),
                                argument.expr.span.or(span),
                            )
                        })?;
                    let value = self.check(&argument.expr)?;
                    self.check_convertibility(&value, &field, false)
                        .into_result()
                        .map_err(|e| e.or_span(argument.expr.span.or(span)))?;
                }
                ty
            }
            ExprKind::TypeOf(inner) => self.check_type_or_value(inner)?,
            ExprKind::SizeOf(inner) => {
                let ty = self.check_type_or_value(inner)?;
                Type::comp_time_int(self.env.sizeof(&ty) as i64)
            }
            ExprKind::GenericTypeApplication { identifier, arguments } => {
                self.check_generic_application(*identifier, arguments, span)?
            }
            ExprKind::GenericFunctionType(g) => Type::GenericFunction(*g),
            ExprKind::PrimitiveType(_)
            | ExprKind::PointerType(_)
            | ExprKind::ConstType(_)
            | ExprKind::MutableType(_)
            | ExprKind::ArrayType { .. }
            | ExprKind::DynamicArrayType(_)
            | ExprKind::FunctionType { .. }
            | ExprKind::UnionType(_) => self.check_type_expr(expr)?,
            ExprKind::Eseq { expr: inner, .. } => self.check(inner)?,
        };
        trace!("[TYPECHECK] {} : {}", expr, ty);
        Ok(ty)
    }

    /// Type denoted by `expr` in a type position
    pub fn check_type_expr(&mut self, expr: &Expr) -> CompilerResult<Type> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Identifier(name) => self.env.resolve_type(self.scope, *name, span),
            ExprKind::PrimitiveType(ty) => Ok(ty.clone()),
            ExprKind::PointerType(pointee) => Ok(Type::pointer(self.check_type_expr(pointee)?)),
            ExprKind::ConstType(inner) => Ok(self.check_type_expr(inner)?.corresponding_const_type()),
            ExprKind::MutableType(inner) => Ok(self.check_type_expr(inner)?.corresponding_mutable_type()),
            ExprKind::ArrayType { count, element_type } => {
                let count = match count {
                    Some(count) => match self.check(count)? {
                        Type::Arithmetic(ArithmeticType::CompTimeInt(n)) if n >= 0 => Some(n as usize),
                        other => {
                            return Err(CompilerError::type_mismatch(
                                format!("array count must be a compile time constant, got `{}' instead", other),
                                count.span.or(span),
                            ))
                        }
                    },
                    None => None,
                };
                Ok(Type::array(count, self.check_type_expr(element_type)?))
            }
            ExprKind::DynamicArrayType(element) => Ok(Type::DynamicArray(Box::new(self.check_type_expr(element)?))),
            ExprKind::FunctionType {
                name,
                return_type,
                arguments,
            } => {
                let return_type = self.check_type_expr(return_type)?;
                let arguments = arguments
                    .iter()
                    .map(|a| self.check_type_expr(a))
                    .collect::<CompilerResult<Vec<_>>>()?;
                let mut f = FunctionType::new(return_type, arguments);
                f.name = *name;
                Ok(Type::Function(f))
            }
            ExprKind::UnionType(members) => {
                let members = members
                    .iter()
                    .map(|m| self.check_type_expr(m))
                    .collect::<CompilerResult<Vec<_>>>()?;
                Ok(Type::Union(members))
            }
            ExprKind::TypeOf(inner) => Ok(self.check_type_or_value(inner)?),
            ExprKind::GenericTypeApplication { identifier, arguments } => {
                self.check_generic_application(*identifier, arguments, span)
            }
            ExprKind::GenericFunctionType(g) => Ok(Type::GenericFunction(*g)),
            ExprKind::Eseq { expr: inner, .. } => self.check_type_expr(inner),
            _ => Err(CompilerError::type_mismatch(format!("expected a type, got `{}'", expr), span)),
        }
    }

    fn check_type_or_value(&mut self, expr: &Expr) -> CompilerResult<Type> {
        let ty = match &expr.kind {
            ExprKind::Identifier(name) if self.env.lookup_symbol(self.scope, *name).is_none() => {
                self.check_type_expr(expr)?
            }
            _ => self.check(expr)?,
        };
        Ok(match ty {
            Type::Arithmetic(ArithmeticType::CompTimeInt(_)) | Type::Bool(BooleanType::CompTimeBool(_)) => {
                ty.corresponding_mutable_type()
            }
            other => other,
        })
    }

    /// Type of the storage `expr` designates; `None` if it is not addressable
    pub fn check_lvalue(&mut self, expr: &Expr) -> CompilerResult<Option<Type>> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Identifier(name) => match self.env.lookup_symbol(self.scope, *name) {
                Some(symbol) => Ok(Some(symbol.ty.clone())),
                None if self.env.lookup_type(self.scope, *name).is_some() => Ok(None),
                None => Err(CompilerError::unresolved_identifier(name, span)),
            },
            ExprKind::Subscript { subscriptable, .. } => {
                let ty = self.check(expr)?;
                let base = self.check(subscriptable)?;
                let addressable = match base {
                    Type::Array { .. } => self.check_lvalue(subscriptable)?.is_some(),
                    _ => true,
                };
                Ok(addressable.then_some(ty))
            }
            ExprKind::Get { expr: object, member } => {
                let ty = self.check(expr)?;
                let member_name = member.as_identifier();
                let object_type = match &object.kind {
                    ExprKind::Identifier(name) if self.env.lookup_symbol(self.scope, *name).is_none() => {
                        // static access through a type name
                        return Ok(ty.is_function().then_some(ty));
                    }
                    _ => self.check(object)?,
                };
                if object_type.is_pointer() {
                    return Ok(Some(ty));
                }
                if let Type::Array { .. } | Type::DynamicArray(_) | Type::ConstDynamicArray(_) = object_type {
                    if member_name.map_or(false, |m| m == COUNT) {
                        return Ok(None);
                    }
                }
                if ty.is_function() {
                    return Ok(Some(ty));
                }
                Ok(self.check_lvalue(object)?.map(|_| ty))
            }
            ExprKind::Eseq { expr: inner, .. } => self.check_lvalue(inner),
            _ => Ok(None),
        }
    }

    /// Whether a value of type `from` may become a value of type `to`
    pub fn check_convertibility(&self, from: &Type, to: &Type, explicit: bool) -> Convertibility {
        let acceptable = Convertibility::Acceptable(to.clone());
        if from == to {
            return acceptable;
        }
        let mismatch = || {
            Convertibility::Unacceptable(CompilerError::type_mismatch(
                format!("cannot convert value of type `{}' to type `{}'", from, to),
                None,
            ))
        };
        match (from, to) {
            (Type::Function(_), _) | (_, Type::Function(_)) => mismatch(),
            (Type::GenericFunction(_), _) | (_, Type::GenericFunction(_)) => mismatch(),

            (Type::Arithmetic(ArithmeticType::CompTimeInt(v)), Type::Arithmetic(target)) => match target {
                ArithmeticType::CompTimeInt(_) => mismatch(),
                ArithmeticType::Mutable(c) | ArithmeticType::Immutable(c) => {
                    if c.contains(*v) || explicit {
                        acceptable
                    } else {
                        Convertibility::Unacceptable(CompilerError::type_mismatch(
                            format!("integer constant `{}' overflows when stored into `{}'", v, to),
                            None,
                        ))
                    }
                }
            },
            (Type::Arithmetic(a), Type::Arithmetic(b)) => match (a.int_class(), b) {
                (_, ArithmeticType::CompTimeInt(_)) => mismatch(),
                (Some(from_class), ArithmeticType::Mutable(to_class) | ArithmeticType::Immutable(to_class)) => {
                    if explicit || from_class.widens_to(*to_class) {
                        acceptable
                    } else {
                        mismatch()
                    }
                }
                _ => mismatch(),
            },
            (Type::Bool(_), Type::Bool(BooleanType::CompTimeBool(_))) => mismatch(),
            (Type::Bool(_), Type::Bool(_)) => acceptable,

            (
                Type::Array { count: n1, element: e1 },
                Type::Array { count: n2, element: e2 },
            ) => {
                if n2.is_some() && n1 != n2 {
                    return mismatch();
                }
                match self.check_convertibility(e1, e2, explicit) {
                    Convertibility::Acceptable(_) => Convertibility::Acceptable(Type::array(*n1, (**e2).clone())),
                    Convertibility::Unacceptable(_) => mismatch(),
                }
            }
            (Type::Array { element: e1, .. }, Type::DynamicArray(e2) | Type::ConstDynamicArray(e2))
            | (
                Type::DynamicArray(e1) | Type::ConstDynamicArray(e1),
                Type::DynamicArray(e2) | Type::ConstDynamicArray(e2),
            ) => {
                if e1.same_modulo_const(e2) {
                    acceptable
                } else {
                    mismatch()
                }
            }

            (Type::Pointer(p1) | Type::ConstPointer(p1), Type::Pointer(p2) | Type::ConstPointer(p2)) => {
                if p1 == p2 || **p2 == p1.corresponding_const_type() {
                    acceptable
                } else {
                    mismatch()
                }
            }

            (Type::Union(_), Type::Union(_)) => {
                if from.same_modulo_const(to) {
                    acceptable
                } else {
                    mismatch()
                }
            }
            (Type::Union(members), _) => {
                if !explicit {
                    return mismatch();
                }
                let any = members
                    .iter()
                    .any(|m| m.same_modulo_const(to) || self.check_convertibility(m, to, true).is_acceptable());
                if any {
                    acceptable
                } else {
                    mismatch()
                }
            }
            (_, Type::Union(members)) => {
                if members
                    .iter()
                    .any(|m| self.check_convertibility(from, m, false).is_acceptable())
                {
                    acceptable
                } else {
                    mismatch()
                }
            }

            (_, Type::Trait(t) | Type::ConstTrait(t)) => {
                let sref = match from {
                    Type::Struct(s) | Type::ConstStruct(s) => Some(*s),
                    _ => from.as_pointee().and_then(|p| p.as_struct()),
                };
                match sref {
                    Some(s) => {
                        let instance = mangler::vtable_instance_name(t.name, s.name);
                        if self.env.lookup_symbol(self.scope, instance).is_some() {
                            acceptable
                        } else {
                            mismatch()
                        }
                    }
                    None => mismatch(),
                }
            }

            (Type::Struct(a) | Type::ConstStruct(a), Type::Struct(b) | Type::ConstStruct(b)) if a.id == b.id => {
                acceptable
            }

            (_, Type::Pointer(pointee) | Type::ConstPointer(pointee)) if !from.is_pointer() => {
                if from.same_modulo_const(pointee) {
                    acceptable
                } else {
                    mismatch()
                }
            }

            _ if from.same_modulo_const(to) => acceptable,
            _ => mismatch(),
        }
    }

    /// Index of the first union member that accepts a `from` value implicitly
    pub fn union_member_for(&self, from: &Type, members: &[Type]) -> Option<usize> {
        members
            .iter()
            .position(|m| self.check_convertibility(from, m, false).is_acceptable())
    }

    fn check_identifier(&mut self, name: InternedString, span: Option<Span>) -> CompilerResult<Type> {
        if let Some(symbol) = self.env.lookup_symbol(self.scope, name) {
            return Ok(symbol.ty.clone());
        }
        if let Some(ty) = self.env.lookup_type(self.scope, name) {
            return Ok(ty.clone());
        }
        Err(CompilerError::unresolved_identifier(name, span))
    }

    fn check_literal_array(&mut self, array_type: &Expr, elements: &[Expr]) -> CompilerResult<Type> {
        let declared = self.check_type_expr(array_type)?;
        let Type::Array { count, element } = declared else {
            return Err(CompilerError::type_mismatch(
                format!("expected an array type, got `{}'", declared),
                array_type.span,
            ));
        };
        if let Some(count) = count {
            if count != elements.len() {
                return Err(CompilerError::type_mismatch(
                    format!("expected {} elements in `{}' array literal", count, element),
                    array_type.span,
                ));
            }
        }
        for e in elements {
            let ty = self.check(e)?;
            self.check_convertibility(&ty, &element, false)
                .into_result()
                .map_err(|err| err.or_span(e.span))?;
        }
        Ok(Type::array(Some(elements.len()), *element))
    }

    fn check_unary(&mut self, op: UnaryOp, child: &Expr, span: Option<Span>) -> CompilerResult<Type> {
        if op == UnaryOp::Ampersand {
            return match self.check_lvalue(child)? {
                Some(ty) => Ok(Type::pointer(ty)),
                None => Err(CompilerError::structural(
                    "lvalue required as operand of unary operator `&'",
                    span,
                )),
            };
        }
        let ty = self.check(child)?;
        let result = match (op, &ty) {
            (UnaryOp::Minus, Type::Arithmetic(ArithmeticType::CompTimeInt(v))) => Some(Type::comp_time_int(-v)),
            (UnaryOp::Tilde, Type::Arithmetic(ArithmeticType::CompTimeInt(v))) => Some(Type::comp_time_int(!v)),
            (UnaryOp::Minus | UnaryOp::Tilde, Type::Arithmetic(a)) => {
                a.int_class().map(|c| Type::Arithmetic(ArithmeticType::Mutable(c)))
            }
            (UnaryOp::Bang, Type::Bool(BooleanType::CompTimeBool(b))) => Some(Type::comp_time_bool(!b)),
            (UnaryOp::Bang, Type::Bool(_)) => Some(Type::BOOL),
            _ => None,
        };
        result.ok_or_else(|| {
            CompilerError::type_mismatch(
                format!("unary operator `{}' cannot be applied to an operand of type `{}'", op, ty),
                span,
            )
        })
    }

    fn check_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr, span: Option<Span>) -> CompilerResult<Type> {
        let lt = self.check(left)?;
        let rt = self.check(right)?;
        let invalid = || {
            CompilerError::type_mismatch(
                format!(
                    "binary operator `{}' cannot be applied to operands of types `{}' and `{}'",
                    op, lt, rt
                ),
                span,
            )
        };
        match (&lt, &rt) {
            (
                Type::Arithmetic(ArithmeticType::CompTimeInt(a)),
                Type::Arithmetic(ArithmeticType::CompTimeInt(b)),
            ) => fold_int(op, *a, *b, span)?.ok_or_else(invalid),
            (Type::Arithmetic(a), Type::Arithmetic(b)) => {
                if op.is_logical() {
                    return Err(invalid());
                }
                let result = ArithmeticType::binary_result(*a, *b).ok_or_else(invalid)?;
                Ok(if op.is_comparison() {
                    Type::BOOL
                } else {
                    Type::Arithmetic(result)
                })
            }
            (Type::Bool(a), Type::Bool(b)) => {
                if !matches!(op, BinaryOp::Eq | BinaryOp::Ne) && !op.is_logical() {
                    return Err(invalid());
                }
                if let (BooleanType::CompTimeBool(a), BooleanType::CompTimeBool(b)) = (a, b) {
                    let value = match op {
                        BinaryOp::Eq => a == b,
                        BinaryOp::Ne => a != b,
                        BinaryOp::LogicalAnd => *a && *b,
                        _ => *a || *b,
                    };
                    return Ok(Type::comp_time_bool(value));
                }
                Ok(Type::BOOL)
            }
            (l, r) if l.is_pointer() && r.is_pointer() && matches!(op, BinaryOp::Eq | BinaryOp::Ne) => Ok(Type::BOOL),
            _ => Err(invalid()),
        }
    }

    /// Operand type both sides of an arithmetic binary are converted to
    pub fn binary_operand_type(&self, left: &Type, right: &Type) -> Option<Type> {
        match (left, right) {
            (Type::Arithmetic(a), Type::Arithmetic(b)) => ArithmeticType::binary_result(*a, *b).map(Type::Arithmetic),
            _ => None,
        }
    }

    fn check_assignment(&mut self, lexpr: &Expr, rexpr: &Expr, initial: bool, span: Option<Span>) -> CompilerResult<Type> {
        let ltype = self
            .check_lvalue(lexpr)?
            .ok_or_else(|| CompilerError::structural(format!("lvalue required in assignment to `{}'", lexpr), span))?;
        if ltype.is_const() && !initial {
            return Err(CompilerError::type_mismatch(
                format!("cannot assign to constant `{}' of type `{}'", lexpr, ltype),
                span,
            ));
        }
        let rtype = self.check(rexpr)?;
        self.check_convertibility(&rtype, &ltype, false)
            .into_result()
            .map_err(|e| e.or_span(span))?;
        Ok(ltype)
    }

    fn check_call(&mut self, callee: &Expr, arguments: &[Expr], span: Option<Span>) -> CompilerResult<Type> {
        let callee_type = self.check(callee)?;
        let function = match &callee_type {
            Type::Function(f) => f.clone(),
            Type::Pointer(p) | Type::ConstPointer(p) => match p.as_ref() {
                Type::Function(f) => f.clone(),
                _ => return Err(not_callable(&callee_type, span)),
            },
            Type::GenericFunction(g) => {
                return Err(CompilerError::structural(
                    format!("generic function `{}' requires explicit type arguments", g.name),
                    span,
                ))
            }
            _ => return Err(not_callable(&callee_type, span)),
        };
        let name = function
            .name
            .map(|n| n.as_string())
            .unwrap_or_else(|| callee.to_string());
        if function.arguments.len() != arguments.len() {
            return Err(CompilerError::type_mismatch(
                format!(
                    "incorrect number of arguments in call to `{}'; expected {}, got {}",
                    name,
                    function.arguments.len(),
                    arguments.len()
                ),
                span,
            ));
        }
        for (argument, expected) in arguments.iter().zip(&function.arguments) {
            let actual = self.check(argument)?;
            if let Convertibility::Unacceptable(_) = self.check_convertibility(&actual, expected, false) {
                return Err(CompilerError::type_mismatch(
                    format!(
                        "cannot convert value of type `{}' to expected argument type `{}' in call to `{}'",
                        actual, expected, name
                    ),
                    argument.span.or(span),
                ));
            }
        }
        Ok(*function.return_type)
    }

    fn check_subscript(&mut self, subscriptable: &Expr, argument: &Expr, span: Option<Span>) -> CompilerResult<Type> {
        let base = self.check(subscriptable)?;
        let index = self.check(argument)?;
        if !index.is_arithmetic() {
            return Err(CompilerError::type_mismatch(
                format!("cannot subscript a value of type `{}' with an argument of type `{}'", base, index),
                span,
            ));
        }
        let container = match base.as_pointee() {
            Some(inner) if inner.as_element().is_some() => inner.clone(),
            _ => base.clone(),
        };
        if let (Type::Array { count: Some(n), .. }, Type::Arithmetic(ArithmeticType::CompTimeInt(i))) = (&container, &index) {
            if *i < 0 || *i as usize >= *n {
                return Err(CompilerError::type_mismatch(
                    format!("Array index is always out of bounds: value {} is not in 0..{}", i, n),
                    argument.span.or(span),
                ));
            }
        }
        container.as_element().cloned().ok_or_else(|| {
            CompilerError::type_mismatch(format!("value of type `{}' has no subscripts", base), span)
        })
    }

    fn check_get(&mut self, object: &Expr, member: &Expr, span: Option<Span>) -> CompilerResult<Type> {
        let member_name = match &member.kind {
            ExprKind::Identifier(name) => *name,
            ExprKind::GenericTypeApplication { identifier, .. } => *identifier,
            _ => {
                return Err(CompilerError::internal(
                    format!("unsupported member expression `{}'", member),
                    member.span.or(span),
                ))
            }
        };
        let object_type = self.check(object)?;

        if member_name == POINTEE {
            if let Some(pointee) = object_type.as_pointee() {
                return Ok(pointee.clone());
            }
        }
        let base = match object_type.as_pointee() {
            Some(pointee) => pointee.clone(),
            None => object_type.clone(),
        };
        let no_member = || {
            CompilerError::unresolved_identifier(format!("{}.{}", base, member_name), member.span.or(span))
        };
        let found = match &base {
            Type::Array { count, .. } if member_name == COUNT => Some(match count {
                Some(n) => Type::comp_time_int(*n as i64),
                None => Type::U16,
            }),
            Type::DynamicArray(_) | Type::ConstDynamicArray(_) if member_name == COUNT => Some(Type::U16),
            Type::Struct(sref) | Type::ConstStruct(sref) => nominal::struct_member(self.env, *sref, member_name).map(|s| {
                if matches!(base, Type::ConstStruct(_)) && !s.ty.is_function() {
                    s.ty.corresponding_const_type()
                } else {
                    s.ty.clone()
                }
            }),
            Type::Trait(tref) | Type::ConstTrait(tref) => nominal::trait_object_type(self.env, self.scope, *tref)
                .and_then(|obj| obj.as_struct())
                .and_then(|sref| nominal::struct_member(self.env, sref, member_name))
                .map(|s| s.ty.clone()),
            _ => None,
        };
        let ty = found.ok_or_else(no_member)?;
        if let ExprKind::GenericTypeApplication { arguments, .. } = &member.kind {
            if let Type::GenericFunction(g) = ty {
                let arguments = arguments
                    .iter()
                    .map(|a| self.check_type_expr(a))
                    .collect::<CompilerResult<Vec<_>>>()?;
                return self.instantiate_generic_function(g, arguments, span);
            }
        }
        Ok(ty)
    }

    fn check_generic_application(
        &mut self,
        identifier: InternedString,
        arguments: &[Expr],
        span: Option<Span>,
    ) -> CompilerResult<Type> {
        let arguments = arguments
            .iter()
            .map(|a| self.check_type_expr(a))
            .collect::<CompilerResult<Vec<_>>>()?;
        let generic = match self.env.lookup_symbol(self.scope, identifier) {
            Some(symbol) => symbol.ty.clone(),
            None => self.env.resolve_type(self.scope, identifier, span)?,
        };
        match generic {
            Type::GenericFunction(g) => self.instantiate_generic_function(g, arguments, span),
            Type::GenericStruct(g) => self.instantiate_generic_struct(g, arguments, span),
            Type::GenericTrait(g) => self.instantiate_generic_trait(g, arguments, span),
            other => Err(CompilerError::type_mismatch(
                format!("`{}' of type `{}' is not generic", identifier, other),
                span,
            )),
        }
    }

    fn bind_type_arguments(
        &mut self,
        scope: ScopeId,
        name: InternedString,
        parameters: &[InternedString],
        arguments: &[Type],
        span: Option<Span>,
    ) -> CompilerResult<ScopeId> {
        if parameters.len() != arguments.len() {
            return Err(CompilerError::type_mismatch(
                format!(
                    "incorrect number of type arguments in application of `{}'; expected {}, got {}",
                    name,
                    parameters.len(),
                    arguments.len()
                ),
                span,
            ));
        }
        let inner = self.env.new_scope(Some(scope));
        for (parameter, argument) in parameters.iter().zip(arguments) {
            self.env.bind_type(inner, *parameter, TypeRecord::new(argument.clone()));
        }
        Ok(inner)
    }

    fn instantiate_generic_struct(&mut self, g: GenericRef, arguments: Vec<Type>, span: Option<Span>) -> CompilerResult<Type> {
        let info = self
            .env
            .types
            .generic_struct(g.id)
            .cloned()
            .ok_or_else(|| CompilerError::internal(format!("unknown generic struct `{}'", g.name), span))?;
        if let Some(ty) = info.instantiations.get(&arguments) {
            return Ok(ty.clone());
        }
        let inner = self.bind_type_arguments(info.scope, info.name, &info.template.type_arguments, &arguments, span)?;
        let mangled = mangler::mangle_generic(info.name, &arguments);
        let ty = nominal::reserve_struct(self.env, info.scope, mangled, info.template.is_const, None);
        if let Some(entry) = self.env.types.generic_struct_mut(g.id) {
            entry.instantiations.insert(arguments, ty.clone());
        }
        let mut members = Vec::with_capacity(info.template.members.len());
        for member in &info.template.members {
            let member_type = TypeChecker::new(&mut *self.env, inner).check_type_expr(&member.member_type)?;
            members.push((member.name, member_type));
        }
        let sref = ty
            .as_struct()
            .ok_or_else(|| CompilerError::internal("instantiated struct is not a struct", span))?;
        nominal::layout_struct_fields(self.env, sref, &members, span)?;
        trace!("[TYPECHECK] instantiated {}", mangled);
        Ok(ty)
    }

    fn instantiate_generic_trait(&mut self, g: GenericRef, arguments: Vec<Type>, span: Option<Span>) -> CompilerResult<Type> {
        let info = self
            .env
            .types
            .generic_trait(g.id)
            .cloned()
            .ok_or_else(|| CompilerError::internal(format!("unknown generic trait `{}'", g.name), span))?;
        if let Some(ty) = info.instantiations.get(&arguments) {
            return Ok(ty.clone());
        }
        let inner = self.bind_type_arguments(info.scope, info.name, &info.template.type_arguments, &arguments, span)?;
        let mangled = mangler::mangle_generic(info.name, &arguments);
        let ty = nominal::reserve_trait(self.env, info.scope, mangled, mangled);
        if let Some(entry) = self.env.types.generic_trait_mut(g.id) {
            entry.instantiations.insert(arguments, ty.clone());
        }
        let tref = ty
            .as_trait()
            .ok_or_else(|| CompilerError::internal("instantiated trait is not a trait", span))?;
        let mut members = Vec::with_capacity(info.template.members.len());
        for member in &info.template.members {
            let member_type = TypeChecker::new(&mut *self.env, inner).check_type_expr(&member.member_type)?;
            members.push((member.name, member_type));
        }
        nominal::bind_trait_members(self.env, tref, &members);
        nominal::declare_trait_support_types(self.env, info.scope, tref, Visibility::Private, None, span)?;
        Ok(ty)
    }

    fn instantiate_generic_function(
        &mut self,
        g: GenericRef,
        arguments: Vec<Type>,
        span: Option<Span>,
    ) -> CompilerResult<Type> {
        let info = self
            .env
            .types
            .generic_function(g.id)
            .cloned()
            .ok_or_else(|| CompilerError::internal(format!("unknown generic function `{}'", g.name), span))?;
        if let Some(ty) = info.instantiations.get(&arguments) {
            return Ok(ty.clone());
        }
        let inner = self.bind_type_arguments(info.scope, info.name, &info.template.type_arguments, &arguments, span)?;
        let mangled = mangler::mangle_generic(self.env.mangle_name(info.scope, info.name), &arguments);
        let ty = match TypeChecker::new(&mut *self.env, inner).check_type_expr(&info.template.function_type)? {
            Type::Function(f) => Type::Function(FunctionType {
                name: Some(mangler::mangle_generic(info.name, &arguments)),
                mangled_name: Some(mangled),
                ..f
            }),
            other => {
                return Err(CompilerError::internal(
                    format!("generic function template has type `{}'", other),
                    span,
                ))
            }
        };
        if let Some(entry) = self.env.types.generic_function_mut(g.id) {
            entry.instantiations.insert(arguments, ty.clone());
        }
        Ok(ty)
    }
}

fn not_callable(ty: &Type, span: Option<Span>) -> CompilerError {
    CompilerError::type_mismatch(format!("cannot call value of non-function type `{}'", ty), span)
}

fn fold_int(op: BinaryOp, a: i64, b: i64, span: Option<Span>) -> CompilerResult<Option<Type>> {
    let int = |v: i64| Some(Type::comp_time_int(v));
    let boolean = |v: bool| Some(Type::comp_time_bool(v));
    let divide_by_zero = || CompilerError::type_mismatch("division by zero", span);
    Ok(match op {
        BinaryOp::Add => int(a.wrapping_add(b)),
        BinaryOp::Sub => int(a.wrapping_sub(b)),
        BinaryOp::Mul => int(a.wrapping_mul(b)),
        BinaryOp::Div => int(a.checked_div(b).ok_or_else(divide_by_zero)?),
        BinaryOp::Mod => int(a.checked_rem(b).ok_or_else(divide_by_zero)?),
        BinaryOp::And => int(a & b),
        BinaryOp::Or => int(a | b),
        BinaryOp::Xor => int(a ^ b),
        BinaryOp::LeftShift => int(a.wrapping_shl(b as u32)),
        BinaryOp::RightShift => int(a.wrapping_shr(b as u32)),
        BinaryOp::Eq => boolean(a == b),
        BinaryOp::Ne => boolean(a != b),
        BinaryOp::Lt => boolean(a < b),
        BinaryOp::Gt => boolean(a > b),
        BinaryOp::Le => boolean(a <= b),
        BinaryOp::Ge => boolean(a >= b),
        BinaryOp::LogicalAnd | BinaryOp::LogicalOr => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{Storage, Symbol};

    fn env_with(bindings: &[(&str, Type)]) -> (Environment, ScopeId) {
        let mut env = Environment::new();
        let scope = env.new_scope(Some(env.root()));
        for (name, ty) in bindings {
            env.bind_symbol(scope, (*name).into(), Symbol::new(ty.clone(), Storage::Automatic(Some(0))));
        }
        (env, scope)
    }

    #[test]
    fn test_literals_and_arithmetic() {
        let (mut env, scope) = env_with(&[("a", Type::U8), ("b", Type::U16)]);
        let mut tc = TypeChecker::new(&mut env, scope);
        let sum = Expr::binary(BinaryOp::Add, Expr::identifier("a"), Expr::identifier("b"));
        assert_eq!(tc.check(&sum).unwrap(), Type::U16);
        let folded = Expr::binary(BinaryOp::Mul, Expr::literal_int(6), Expr::literal_int(7));
        assert_eq!(tc.check(&folded).unwrap(), Type::comp_time_int(42));
        let cmp = Expr::binary(BinaryOp::Lt, Expr::identifier("a"), Expr::literal_int(3));
        assert_eq!(tc.check(&cmp).unwrap(), Type::BOOL);
    }

    #[test]
    fn test_address_of_requires_lvalue() {
        let (mut env, scope) = env_with(&[("a", Type::U8)]);
        let mut tc = TypeChecker::new(&mut env, scope);
        assert_eq!(
            tc.check(&Expr::address_of(Expr::identifier("a"))).unwrap(),
            Type::pointer(Type::U8)
        );
        let err = tc.check(&Expr::address_of(Expr::literal_int(1))).unwrap_err();
        assert_eq!(err.message(), "lvalue required as operand of unary operator `&'");
    }

    #[test]
    fn test_convertibility_rules() {
        let (mut env, scope) = env_with(&[]);
        let tc = TypeChecker::new(&mut env, scope);
        assert!(tc.check_convertibility(&Type::comp_time_int(200), &Type::U8, false).is_acceptable());
        assert!(!tc.check_convertibility(&Type::comp_time_int(300), &Type::U8, false).is_acceptable());
        assert!(tc.check_convertibility(&Type::U8, &Type::U16, false).is_acceptable());
        assert!(!tc.check_convertibility(&Type::U16, &Type::U8, false).is_acceptable());
        assert!(tc.check_convertibility(&Type::U16, &Type::U8, true).is_acceptable());
        assert!(tc
            .check_convertibility(&Type::U8, &Type::U8.corresponding_const_type(), false)
            .is_acceptable());
        assert!(tc
            .check_convertibility(&Type::pointer(Type::U8), &Type::pointer(Type::U8.corresponding_const_type()), false)
            .is_acceptable());
        assert!(!tc
            .check_convertibility(&Type::pointer(Type::U8.corresponding_const_type()), &Type::pointer(Type::U8), false)
            .is_acceptable());
    }

    #[test]
    fn test_union_conversions() {
        let (mut env, scope) = env_with(&[]);
        let tc = TypeChecker::new(&mut env, scope);
        let union = Type::Union(vec![Type::U8, Type::BOOL]);
        assert!(tc.check_convertibility(&Type::comp_time_int(5), &union, false).is_acceptable());
        assert!(!tc.check_convertibility(&union, &Type::U8, false).is_acceptable());
        assert!(tc.check_convertibility(&union, &Type::U8, true).is_acceptable());
        assert_eq!(tc.union_member_for(&Type::comp_time_bool(true), &[Type::U8, Type::BOOL]), Some(1));
        // first acceptable member wins
        assert_eq!(tc.union_member_for(&Type::U8, &[Type::U16, Type::U8]), Some(0));
    }

    #[test]
    fn test_function_types_never_convert() {
        let (mut env, scope) = env_with(&[]);
        let tc = TypeChecker::new(&mut env, scope);
        let a = Type::Function(FunctionType::new(Type::Void, vec![]));
        let b = Type::Function(FunctionType::new(Type::U8, vec![]));
        assert!(!tc.check_convertibility(&a, &b, true).is_acceptable());
        assert!(tc.check_convertibility(&a, &a, false).is_acceptable());
    }

    #[test]
    fn test_subscript_out_of_bounds() {
        let (mut env, scope) = env_with(&[("arr", Type::array(Some(3), Type::U8))]);
        let mut tc = TypeChecker::new(&mut env, scope);
        let ok = Expr::subscript(Expr::identifier("arr"), Expr::literal_int(2));
        assert_eq!(tc.check(&ok).unwrap(), Type::U8);
        let bad = Expr::subscript(Expr::identifier("arr"), Expr::literal_int(3));
        assert!(tc.check(&bad).unwrap_err().message().contains("out of bounds"));
    }

    #[test]
    fn test_get_through_pointer_and_count() {
        let (mut env, scope) = env_with(&[
            ("p", Type::pointer(Type::U8)),
            ("arr", Type::array(Some(4), Type::U8)),
        ]);
        let mut tc = TypeChecker::new(&mut env, scope);
        assert_eq!(tc.check(&Expr::pointee(Expr::identifier("p"))).unwrap(), Type::U8);
        assert_eq!(tc.check(&Expr::get(Expr::identifier("arr"), COUNT)).unwrap(), Type::comp_time_int(4));
        assert_eq!(tc.check_lvalue(&Expr::pointee(Expr::identifier("p"))).unwrap(), Some(Type::U8));
        assert_eq!(tc.check_lvalue(&Expr::get(Expr::identifier("arr"), COUNT)).unwrap(), None);
    }

    #[test]
    fn test_assignment_to_const_rejected_unless_initial() {
        let (mut env, scope) = env_with(&[("c", Type::U8.corresponding_const_type())]);
        let mut tc = TypeChecker::new(&mut env, scope);
        let assign = Expr::assignment(Expr::identifier("c"), Expr::literal_int(1));
        assert!(tc.check(&assign).is_err());
        let initial = Expr::initial_assignment(Expr::identifier("c"), Expr::literal_int(1));
        assert_eq!(tc.check(&initial).unwrap(), Type::U8.corresponding_const_type());
    }

    #[test]
    fn test_call_argument_mismatch() {
        let f = FunctionType::named("f".into(), "f".into(), Type::U8, vec![Type::U8]);
        let (mut env, scope) = env_with(&[("f", Type::Function(f)), ("b", Type::BOOL)]);
        let mut tc = TypeChecker::new(&mut env, scope);
        let call = Expr::call(Expr::identifier("f"), vec![Expr::identifier("b")]);
        assert_eq!(
            tc.check(&call).unwrap_err().message(),
            "cannot convert value of type `bool' to expected argument type `u8' in call to `f'"
        );
    }
}
