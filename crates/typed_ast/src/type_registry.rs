//! # Resolved Types
//!
//! The closed set of resolved Snap types, plus the registry that owns the
//! out-of-line information for nominal types.
//!
//! ## Architecture
//!
//! Struct and trait types refer to their member environment through a
//! [`StructId`] / [`TraitId`] into the [`TypeRegistry`] instead of embedding
//! the environment. Recursive types therefore compare and hash by id, and the
//! same declaration scanned again by a later pass resolves to the same id
//! because identity is keyed by (declaring scope, mangled name).
//!
//! Every type has a const dual and a mutable dual. Conversions that change
//! const-ness always name the dual they require.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::arena::InternedString;
use crate::environment::ScopeId;
use crate::typed_ast::{FunctionDeclaration, NodeId, StructDeclaration, TraitDeclaration};

/// Whether a binding is visible to importers of its module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Visibility {
    Public,
    #[default]
    Private,
}

/// Width class of an integer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IntClass {
    U8,
    U16,
    I8,
    I16,
}

impl IntClass {
    pub fn min(self) -> i64 {
        match self {
            IntClass::U8 | IntClass::U16 => 0,
            IntClass::I8 => i8::MIN as i64,
            IntClass::I16 => i16::MIN as i64,
        }
    }

    pub fn max(self) -> i64 {
        match self {
            IntClass::U8 => u8::MAX as i64,
            IntClass::U16 => u16::MAX as i64,
            IntClass::I8 => i8::MAX as i64,
            IntClass::I16 => i16::MAX as i64,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, IntClass::I8 | IntClass::I16)
    }

    pub fn contains(self, value: i64) -> bool {
        self.min() <= value && value <= self.max()
    }

    /// Smallest class able to hold `value`, preferring unsigned classes
    pub fn smallest_containing(value: i64) -> Option<IntClass> {
        [IntClass::U8, IntClass::I8, IntClass::U16, IntClass::I16]
            .into_iter()
            .find(|class| class.contains(value))
    }

    /// Whether every value of `self` is representable in `other`
    pub fn widens_to(self, other: IntClass) -> bool {
        other.min() <= self.min() && self.max() <= other.max()
    }

    /// Class wide enough for both operands of a binary operator
    pub fn common(a: IntClass, b: IntClass) -> Option<IntClass> {
        if a.widens_to(b) {
            Some(b)
        } else if b.widens_to(a) {
            Some(a)
        } else {
            [IntClass::U16, IntClass::I16]
                .into_iter()
                .find(|c| a.widens_to(*c) && b.widens_to(*c))
        }
    }
}

impl fmt::Display for IntClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntClass::U8 => "u8",
            IntClass::U16 => "u16",
            IntClass::I8 => "i8",
            IntClass::I16 => "i16",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithmeticType {
    Mutable(IntClass),
    Immutable(IntClass),
    /// Integer whose value is known at compile time
    CompTimeInt(i64),
}

impl ArithmeticType {
    pub fn int_class(&self) -> Option<IntClass> {
        match self {
            ArithmeticType::Mutable(c) | ArithmeticType::Immutable(c) => Some(*c),
            ArithmeticType::CompTimeInt(v) => IntClass::smallest_containing(*v),
        }
    }

    /// Result type of an arithmetic binary operator
    pub fn binary_result(left: ArithmeticType, right: ArithmeticType) -> Option<ArithmeticType> {
        match (left, right) {
            (ArithmeticType::CompTimeInt(_), ArithmeticType::CompTimeInt(_)) => None,
            (ArithmeticType::CompTimeInt(v), other) | (other, ArithmeticType::CompTimeInt(v)) => {
                let class = other.int_class()?;
                class.contains(v).then_some(ArithmeticType::Mutable(class))
            }
            (a, b) => IntClass::common(a.int_class()?, b.int_class()?).map(ArithmeticType::Mutable),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BooleanType {
    Mutable,
    Immutable,
    CompTimeBool(bool),
}

/// Signature of a function, with the names it is known by
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionType {
    pub name: Option<InternedString>,
    pub mangled_name: Option<InternedString>,
    pub return_type: Box<Type>,
    pub arguments: Vec<Type>,
    /// Declaration this signature was scanned from
    #[serde(skip)]
    pub decl: Option<NodeId>,
}

impl FunctionType {
    pub fn new(return_type: Type, arguments: Vec<Type>) -> Self {
        Self {
            name: None,
            mangled_name: None,
            return_type: Box::new(return_type),
            arguments,
            decl: None,
        }
    }

    pub fn named(name: InternedString, mangled_name: InternedString, return_type: Type, arguments: Vec<Type>) -> Self {
        Self {
            name: Some(name),
            mangled_name: Some(mangled_name),
            return_type: Box::new(return_type),
            arguments,
            decl: None,
        }
    }

    /// Same signature with the names dropped
    pub fn anonymous(&self) -> FunctionType {
        FunctionType::new((*self.return_type).clone(), self.arguments.clone())
    }
}

// The originating declaration is bookkeeping and does not take part in identity.
impl PartialEq for FunctionType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.mangled_name == other.mangled_name
            && self.return_type == other.return_type
            && self.arguments == other.arguments
    }
}

impl Eq for FunctionType {}

impl std::hash::Hash for FunctionType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.mangled_name.hash(state);
        self.return_type.hash(state);
        self.arguments.hash(state);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StructId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraitId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GenericId(pub u32);

/// Reference to a struct in the registry, carrying its name for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StructRef {
    pub id: StructId,
    pub name: InternedString,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraitRef {
    pub id: TraitId,
    pub name: InternedString,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenericRef {
    pub id: GenericId,
    pub name: InternedString,
}

/// A resolved Snap type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Void,
    Function(FunctionType),
    GenericFunction(GenericRef),
    Bool(BooleanType),
    Arithmetic(ArithmeticType),
    Array { count: Option<usize>, element: Box<Type> },
    ConstDynamicArray(Box<Type>),
    DynamicArray(Box<Type>),
    ConstPointer(Box<Type>),
    Pointer(Box<Type>),
    ConstStruct(StructRef),
    Struct(StructRef),
    GenericStruct(GenericRef),
    ConstTrait(TraitRef),
    Trait(TraitRef),
    GenericTrait(GenericRef),
    /// Ordered member list; member order determines tag values
    Union(Vec<Type>),
    Label,
}

impl Type {
    pub const U8: Type = Type::Arithmetic(ArithmeticType::Mutable(IntClass::U8));
    pub const U16: Type = Type::Arithmetic(ArithmeticType::Mutable(IntClass::U16));
    pub const I8: Type = Type::Arithmetic(ArithmeticType::Mutable(IntClass::I8));
    pub const I16: Type = Type::Arithmetic(ArithmeticType::Mutable(IntClass::I16));
    pub const BOOL: Type = Type::Bool(BooleanType::Mutable);

    pub fn pointer(pointee: Type) -> Type {
        Type::Pointer(Box::new(pointee))
    }

    pub fn const_pointer(pointee: Type) -> Type {
        Type::ConstPointer(Box::new(pointee))
    }

    pub fn array(count: Option<usize>, element: Type) -> Type {
        Type::Array {
            count,
            element: Box::new(element),
        }
    }

    pub fn comp_time_int(value: i64) -> Type {
        Type::Arithmetic(ArithmeticType::CompTimeInt(value))
    }

    pub fn comp_time_bool(value: bool) -> Type {
        Type::Bool(BooleanType::CompTimeBool(value))
    }

    pub fn corresponding_const_type(&self) -> Type {
        match self {
            Type::Arithmetic(ArithmeticType::Mutable(c)) => Type::Arithmetic(ArithmeticType::Immutable(*c)),
            Type::Bool(BooleanType::Mutable) => Type::Bool(BooleanType::Immutable),
            Type::Array { count, element } => Type::array(*count, element.corresponding_const_type()),
            Type::DynamicArray(element) => Type::ConstDynamicArray(element.clone()),
            Type::Pointer(pointee) => Type::ConstPointer(pointee.clone()),
            Type::Struct(s) => Type::ConstStruct(*s),
            Type::Trait(t) => Type::ConstTrait(*t),
            Type::Union(members) => Type::Union(members.iter().map(Type::corresponding_const_type).collect()),
            other => other.clone(),
        }
    }

    pub fn corresponding_mutable_type(&self) -> Type {
        match self {
            Type::Arithmetic(ArithmeticType::Immutable(c)) => Type::Arithmetic(ArithmeticType::Mutable(*c)),
            Type::Arithmetic(ArithmeticType::CompTimeInt(v)) => match IntClass::smallest_containing(*v) {
                Some(c) => Type::Arithmetic(ArithmeticType::Mutable(c)),
                None => self.clone(),
            },
            Type::Bool(BooleanType::Immutable) | Type::Bool(BooleanType::CompTimeBool(_)) => Type::BOOL,
            Type::Array { count, element } => Type::array(*count, element.corresponding_mutable_type()),
            Type::ConstDynamicArray(element) => Type::DynamicArray(element.clone()),
            Type::ConstPointer(pointee) => Type::Pointer(pointee.clone()),
            Type::ConstStruct(s) => Type::Struct(*s),
            Type::ConstTrait(t) => Type::Trait(*t),
            Type::Union(members) => Type::Union(members.iter().map(Type::corresponding_mutable_type).collect()),
            other => other.clone(),
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(
            self,
            Type::Arithmetic(ArithmeticType::Immutable(_))
                | Type::Bool(BooleanType::Immutable)
                | Type::ConstDynamicArray(_)
                | Type::ConstPointer(_)
                | Type::ConstStruct(_)
                | Type::ConstTrait(_)
        )
    }

    /// Fits in a register-sized temporary
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Type::Void
                | Type::Bool(_)
                | Type::Arithmetic(_)
                | Type::Pointer(_)
                | Type::ConstPointer(_)
                | Type::Label
        )
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(self, Type::Arithmetic(_))
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Type::Bool(_))
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Pointer(_) | Type::ConstPointer(_))
    }

    pub fn is_union(&self) -> bool {
        matches!(self, Type::Union(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Type::Function(_) | Type::GenericFunction(_))
    }

    pub fn as_arithmetic(&self) -> Option<ArithmeticType> {
        match self {
            Type::Arithmetic(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_pointee(&self) -> Option<&Type> {
        match self {
            Type::Pointer(p) | Type::ConstPointer(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<StructRef> {
        match self {
            Type::Struct(s) | Type::ConstStruct(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_trait(&self) -> Option<TraitRef> {
        match self {
            Type::Trait(t) | Type::ConstTrait(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionType> {
        match self {
            Type::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_union_members(&self) -> Option<&[Type]> {
        match self {
            Type::Union(members) => Some(members),
            _ => None,
        }
    }

    /// Element type of a fixed or dynamic array
    pub fn as_element(&self) -> Option<&Type> {
        match self {
            Type::Array { element, .. } | Type::DynamicArray(element) | Type::ConstDynamicArray(element) => Some(element),
            _ => None,
        }
    }

    /// Const-insensitive equality
    pub fn same_modulo_const(&self, other: &Type) -> bool {
        self.corresponding_const_type() == other.corresponding_const_type()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Function(func) => {
                let args: Vec<String> = func.arguments.iter().map(|a| a.to_string()).collect();
                match &func.name {
                    Some(name) => write!(f, "func {}({}) -> {}", name, args.join(", "), func.return_type),
                    None => write!(f, "func ({}) -> {}", args.join(", "), func.return_type),
                }
            }
            Type::GenericFunction(g) | Type::GenericStruct(g) | Type::GenericTrait(g) => write!(f, "{}", g.name),
            Type::Bool(BooleanType::Mutable) => write!(f, "bool"),
            Type::Bool(BooleanType::Immutable) => write!(f, "const bool"),
            Type::Bool(BooleanType::CompTimeBool(v)) => write!(f, "boolean constant {}", v),
            Type::Arithmetic(ArithmeticType::Mutable(c)) => write!(f, "{}", c),
            Type::Arithmetic(ArithmeticType::Immutable(c)) => write!(f, "const {}", c),
            Type::Arithmetic(ArithmeticType::CompTimeInt(v)) => write!(f, "integer constant {}", v),
            Type::Array { count: Some(n), element } => write!(f, "[{}]{}", n, element),
            Type::Array { count: None, element } => write!(f, "[_]{}", element),
            Type::ConstDynamicArray(element) => write!(f, "const []{}", element),
            Type::DynamicArray(element) => write!(f, "[]{}", element),
            Type::ConstPointer(p) => write!(f, "const *{}", p),
            Type::Pointer(p) => write!(f, "*{}", p),
            Type::ConstStruct(s) => write!(f, "const {}", s.name),
            Type::Struct(s) => write!(f, "{}", s.name),
            Type::ConstTrait(t) => write!(f, "const {}", t.name),
            Type::Trait(t) => write!(f, "{}", t.name),
            Type::Union(members) => {
                let parts: Vec<String> = members.iter().map(|m| m.to_string()).collect();
                write!(f, "{}", parts.join(" | "))
            }
            Type::Label => write!(f, "label"),
        }
    }
}

/// Out-of-line information for a struct type
#[derive(Debug, Clone)]
pub struct StructTypeInfo {
    pub name: InternedString,
    /// Fields and methods, in declaration order
    pub fields: ScopeId,
    /// Set when this struct is the trait-object or vtable shape of a trait
    pub associated_trait: Option<Type>,
    /// Set when this struct is the namespace of an imported module
    pub associated_module: Option<InternedString>,
}

/// Out-of-line information for a trait type
#[derive(Debug, Clone)]
pub struct TraitTypeInfo {
    pub name: InternedString,
    /// Method slots; each is a pointer-to-function member
    pub members: ScopeId,
    pub vtable_type_name: InternedString,
    pub trait_object_type_name: InternedString,
}

#[derive(Debug, Clone)]
pub struct GenericStructInfo {
    pub name: InternedString,
    pub template: StructDeclaration,
    /// Scope the template was declared in
    pub scope: ScopeId,
    pub instantiations: IndexMap<Vec<Type>, Type>,
}

#[derive(Debug, Clone)]
pub struct GenericTraitInfo {
    pub name: InternedString,
    pub template: TraitDeclaration,
    pub scope: ScopeId,
    pub instantiations: IndexMap<Vec<Type>, Type>,
}

#[derive(Debug, Clone)]
pub struct GenericFunctionInfo {
    pub name: InternedString,
    pub template: FunctionDeclaration,
    pub scope: ScopeId,
    pub instantiations: IndexMap<Vec<Type>, Type>,
}

/// Owner of nominal type information
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    structs: Vec<StructTypeInfo>,
    traits: Vec<TraitTypeInfo>,
    generic_structs: IndexMap<GenericId, GenericStructInfo>,
    generic_traits: IndexMap<GenericId, GenericTraitInfo>,
    generic_functions: IndexMap<GenericId, GenericFunctionInfo>,
    struct_keys: IndexMap<(ScopeId, InternedString), StructId>,
    trait_keys: IndexMap<(ScopeId, InternedString), TraitId>,
    generic_keys: IndexMap<(ScopeId, InternedString), GenericId>,
    /// Tagged-struct lowering of each distinct union, keyed by member list
    tagged_unions: IndexMap<Vec<Type>, StructId>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing id for a struct declared as `name` in `scope`, if any
    pub fn struct_key(&self, scope: ScopeId, name: InternedString) -> Option<StructId> {
        self.struct_keys.get(&(scope, name)).copied()
    }

    /// Register a struct, reusing the id of an earlier scan of the same declaration
    pub fn register_struct(&mut self, scope: ScopeId, info: StructTypeInfo) -> StructRef {
        let name = info.name;
        if let Some(id) = self.struct_key(scope, name) {
            self.structs[id.0 as usize] = info;
            return StructRef { id, name };
        }
        let id = StructId(self.structs.len() as u32);
        self.structs.push(info);
        self.struct_keys.insert((scope, name), id);
        StructRef { id, name }
    }

    pub fn struct_info(&self, id: StructId) -> &StructTypeInfo {
        &self.structs[id.0 as usize]
    }

    pub fn struct_info_mut(&mut self, id: StructId) -> &mut StructTypeInfo {
        &mut self.structs[id.0 as usize]
    }

    pub fn trait_key(&self, scope: ScopeId, name: InternedString) -> Option<TraitId> {
        self.trait_keys.get(&(scope, name)).copied()
    }

    pub fn register_trait(&mut self, scope: ScopeId, info: TraitTypeInfo) -> TraitRef {
        let name = info.name;
        if let Some(id) = self.trait_key(scope, name) {
            self.traits[id.0 as usize] = info;
            return TraitRef { id, name };
        }
        let id = TraitId(self.traits.len() as u32);
        self.traits.push(info);
        self.trait_keys.insert((scope, name), id);
        TraitRef { id, name }
    }

    pub fn trait_info(&self, id: TraitId) -> &TraitTypeInfo {
        &self.traits[id.0 as usize]
    }

    fn generic_id(&mut self, scope: ScopeId, name: InternedString) -> GenericId {
        let next = GenericId(self.generic_keys.len() as u32);
        *self.generic_keys.entry((scope, name)).or_insert(next)
    }

    /// Register a generic struct template; a rescan keeps earlier instantiations
    pub fn register_generic_struct(&mut self, mut info: GenericStructInfo) -> GenericRef {
        let name = info.name;
        let id = self.generic_id(info.scope, name);
        if let Some(old) = self.generic_structs.get_mut(&id) {
            info.instantiations = std::mem::take(&mut old.instantiations);
        }
        self.generic_structs.insert(id, info);
        GenericRef { id, name }
    }

    pub fn register_generic_trait(&mut self, mut info: GenericTraitInfo) -> GenericRef {
        let name = info.name;
        let id = self.generic_id(info.scope, name);
        if let Some(old) = self.generic_traits.get_mut(&id) {
            info.instantiations = std::mem::take(&mut old.instantiations);
        }
        self.generic_traits.insert(id, info);
        GenericRef { id, name }
    }

    pub fn register_generic_function(&mut self, mut info: GenericFunctionInfo) -> GenericRef {
        let name = info.name;
        let id = self.generic_id(info.scope, name);
        if let Some(old) = self.generic_functions.get_mut(&id) {
            info.instantiations = std::mem::take(&mut old.instantiations);
        }
        self.generic_functions.insert(id, info);
        GenericRef { id, name }
    }

    pub fn generic_struct(&self, id: GenericId) -> Option<&GenericStructInfo> {
        self.generic_structs.get(&id)
    }

    pub fn generic_struct_mut(&mut self, id: GenericId) -> Option<&mut GenericStructInfo> {
        self.generic_structs.get_mut(&id)
    }

    pub fn generic_trait(&self, id: GenericId) -> Option<&GenericTraitInfo> {
        self.generic_traits.get(&id)
    }

    pub fn generic_trait_mut(&mut self, id: GenericId) -> Option<&mut GenericTraitInfo> {
        self.generic_traits.get_mut(&id)
    }

    pub fn generic_function(&self, id: GenericId) -> Option<&GenericFunctionInfo> {
        self.generic_functions.get(&id)
    }

    pub fn generic_function_mut(&mut self, id: GenericId) -> Option<&mut GenericFunctionInfo> {
        self.generic_functions.get_mut(&id)
    }

    pub fn tagged_union(&self, members: &[Type]) -> Option<StructId> {
        self.tagged_unions.get(members).copied()
    }

    pub fn remember_tagged_union(&mut self, members: Vec<Type>, id: StructId) {
        self.tagged_unions.insert(members, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const_duals_round_trip() {
        let types = vec![
            Type::U8,
            Type::BOOL,
            Type::pointer(Type::U16),
            Type::DynamicArray(Box::new(Type::U8)),
            Type::array(Some(3), Type::I8),
            Type::Union(vec![Type::U8, Type::BOOL]),
        ];
        for ty in types {
            let c = ty.corresponding_const_type();
            assert_eq!(c.corresponding_mutable_type(), ty, "{}", ty);
            assert_eq!(c.corresponding_const_type(), c);
        }
    }

    #[test]
    fn test_comp_time_int_mutable_dual_picks_smallest_class() {
        assert_eq!(Type::comp_time_int(5).corresponding_mutable_type(), Type::U8);
        assert_eq!(Type::comp_time_int(-5).corresponding_mutable_type(), Type::I8);
        assert_eq!(Type::comp_time_int(1000).corresponding_mutable_type(), Type::U16);
        assert_eq!(Type::comp_time_int(-1000).corresponding_mutable_type(), Type::I16);
    }

    #[test]
    fn test_binary_result_widens() {
        use ArithmeticType::*;
        assert_eq!(ArithmeticType::binary_result(Mutable(IntClass::U8), Mutable(IntClass::U16)), Some(Mutable(IntClass::U16)));
        assert_eq!(ArithmeticType::binary_result(Mutable(IntClass::U8), CompTimeInt(3)), Some(Mutable(IntClass::U8)));
        assert_eq!(ArithmeticType::binary_result(Mutable(IntClass::U8), CompTimeInt(300)), None);
        assert_eq!(ArithmeticType::binary_result(Mutable(IntClass::U8), Mutable(IntClass::I8)), Some(Mutable(IntClass::I16)));
    }

    #[test]
    fn test_display() {
        assert_eq!(Type::Union(vec![Type::U8, Type::BOOL]).to_string(), "u8 | bool");
        assert_eq!(Type::const_pointer(Type::U8).to_string(), "const *u8");
        let f = FunctionType::new(Type::U16, vec![Type::pointer(Type::Void)]);
        assert_eq!(Type::Function(f).to_string(), "func (*void) -> u16");
    }
}
