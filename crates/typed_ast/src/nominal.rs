//! # Nominal Type Declaration
//!
//! Shared by the declaration scanners and by generic instantiation in the
//! type checker: reserving struct and trait identities, laying out struct
//! fields, filling trait member tables, and declaring the vtable and
//! trait-object structs every trait carries.
//!
//! Declaring happens in two steps so a struct can mention itself through a
//! pointer: reserve the identity and bind the name, then resolve the member
//! types and lay them out.

use std::collections::HashSet;

use log::trace;

use crate::arena::InternedString;
use crate::environment::{Breadcrumb, Environment, ScopeId, Storage, Symbol, TypeRecord};
use crate::error::{CompilerError, CompilerResult};
use crate::frame::Frame;
use crate::mangler;
use crate::source::Span;
use crate::type_registry::{
    FunctionType, StructId, StructRef, StructTypeInfo, TraitRef, TraitTypeInfo, Type, Visibility,
};
use crate::typed_ast::NodeId;

/// Name of the trait-object field holding the erased receiver
pub const TRAIT_OBJECT_FIELD: &str = "object";
/// Name of the trait-object field holding the vtable pointer
pub const TRAIT_VTABLE_FIELD: &str = "vtable";

/// Reserve the identity of a struct declared as `name` in `scope`. A second
/// reservation of the same declaration returns the same id with its member
/// scope emptied; `impl` blocks bind their methods again when scanned.
pub fn reserve_struct(
    env: &mut Environment,
    scope: ScopeId,
    name: InternedString,
    is_const: bool,
    associated_trait: Option<Type>,
) -> Type {
    let fields = match env.types.struct_key(scope, name) {
        Some(id) => {
            let fields = env.types.struct_info(id).fields;
            env.scope_mut(fields).symbols.clear();
            env.set_frame(fields, Frame::default());
            fields
        }
        None => {
            let fields = env.new_scope_with_frame(Some(scope), Frame::default());
            env.set_breadcrumb(fields, Breadcrumb::Struct(name));
            fields
        }
    };
    let sref = env.types.register_struct(
        scope,
        StructTypeInfo {
            name,
            fields,
            associated_trait,
            associated_module: None,
        },
    );
    trace!("[NOMINAL] reserved struct {} as {:?}", name, sref.id);
    if is_const {
        Type::ConstStruct(sref)
    } else {
        Type::Struct(sref)
    }
}

/// Lay out data fields in declaration order
pub fn layout_struct_fields(
    env: &mut Environment,
    sref: StructRef,
    members: &[(InternedString, Type)],
    span: Option<Span>,
) -> CompilerResult<()> {
    for (_, ty) in members {
        if contains_by_value(env, ty, sref.id, &mut HashSet::new()) {
            return Err(CompilerError::structural("a struct cannot contain itself recursively", span));
        }
    }
    let fields = env.types.struct_info(sref.id).fields;
    for (name, ty) in members {
        let size = env.sizeof(ty);
        let offset = env.allocate(fields, size);
        env.bind_symbol(fields, *name, Symbol::new(ty.clone(), Storage::Automatic(Some(offset))));
    }
    Ok(())
}

fn contains_by_value(env: &Environment, ty: &Type, target: StructId, visited: &mut HashSet<StructId>) -> bool {
    match ty {
        Type::Struct(s) | Type::ConstStruct(s) => {
            if s.id == target {
                return true;
            }
            if !visited.insert(s.id) {
                return false;
            }
            let fields = env.types.struct_info(s.id).fields;
            env.scope(fields)
                .symbols
                .values()
                .any(|symbol| contains_by_value(env, &symbol.ty, target, visited))
        }
        Type::Array { element, .. } => contains_by_value(env, element, target, visited),
        Type::Union(members) => members.iter().any(|m| contains_by_value(env, m, target, visited)),
        _ => false,
    }
}

/// Data fields of a struct, in layout order
pub fn struct_fields(env: &Environment, sref: StructRef) -> Vec<(InternedString, Type)> {
    let fields = env.types.struct_info(sref.id).fields;
    env.scope(fields)
        .symbols
        .iter()
        .filter(|(_, symbol)| !symbol.ty.is_function())
        .map(|(name, symbol)| (*name, symbol.ty.clone()))
        .collect()
}

/// Member symbol of a struct, field or method
pub fn struct_member(env: &Environment, sref: StructRef, member: InternedString) -> Option<&Symbol> {
    let fields = env.types.struct_info(sref.id).fields;
    env.scope(fields).symbols.get(&member)
}

/// Reserve a trait identity and its member scope
pub fn reserve_trait(env: &mut Environment, scope: ScopeId, name: InternedString, mangled_name: InternedString) -> Type {
    let members = match env.types.trait_key(scope, name) {
        Some(id) => {
            let members = env.types.trait_info(id).members;
            env.scope_mut(members).symbols.clear();
            members
        }
        None => {
            let members = env.new_scope(Some(scope));
            env.set_breadcrumb(members, Breadcrumb::Trait(name));
            members
        }
    };
    let tref = env.types.register_trait(
        scope,
        TraitTypeInfo {
            name,
            members,
            vtable_type_name: mangler::vtable_type_name(mangled_name),
            trait_object_type_name: mangler::trait_object_type_name(mangled_name),
        },
    );
    Type::Trait(tref)
}

pub fn bind_trait_members(env: &mut Environment, tref: TraitRef, members: &[(InternedString, Type)]) {
    let scope = env.types.trait_info(tref.id).members;
    for (name, ty) in members {
        env.bind_symbol(scope, *name, Symbol::new(ty.clone(), Storage::Automatic(None)));
    }
}

/// Trait members sorted by name
pub fn sorted_trait_members(env: &Environment, tref: TraitRef) -> Vec<(InternedString, Type)> {
    let scope = env.types.trait_info(tref.id).members;
    let mut members: Vec<(InternedString, Type)> = env
        .scope(scope)
        .symbols
        .iter()
        .map(|(name, symbol)| (*name, symbol.ty.clone()))
        .collect();
    members.sort_by_key(|(name, _)| name.as_string());
    members
}

/// Member type with a leading `*Trait` receiver erased to `*void`
pub fn vtable_slot_type(member: &Type, tref: TraitRef) -> Type {
    let Some(Type::Function(f)) = member.as_pointee() else {
        return member.clone();
    };
    let mut arguments = f.arguments.clone();
    if let Some(first) = arguments.first_mut() {
        let receives_trait = matches!(first.as_pointee(), Some(Type::Trait(t)) | Some(Type::ConstTrait(t)) if t.id == tref.id)
            || matches!(first.as_pointee(), Some(Type::GenericTrait(_)));
        if receives_trait {
            *first = Type::pointer(Type::Void);
        }
    }
    Type::pointer(Type::Function(FunctionType::new((*f.return_type).clone(), arguments)))
}

/// Field list of the vtable struct of a trait
pub fn vtable_fields(env: &Environment, tref: TraitRef) -> Vec<(InternedString, Type)> {
    sorted_trait_members(env, tref)
        .into_iter()
        .map(|(name, ty)| (name, vtable_slot_type(&ty, tref)))
        .collect()
}

/// Field list of the trait-object struct of a trait, given its vtable type
pub fn trait_object_fields(vtable_type: &Type) -> Vec<(InternedString, Type)> {
    vec![
        (TRAIT_OBJECT_FIELD.into(), Type::pointer(Type::Void)),
        (TRAIT_VTABLE_FIELD.into(), Type::pointer(vtable_type.corresponding_const_type())),
    ]
}

/// Declare the vtable and trait-object structs of a trait in `scope` and
/// bind their type names. Returns (vtable type, trait-object type).
pub fn declare_trait_support_types(
    env: &mut Environment,
    scope: ScopeId,
    tref: TraitRef,
    visibility: Visibility,
    decl: Option<NodeId>,
    span: Option<Span>,
) -> CompilerResult<(Type, Type)> {
    let info = env.types.trait_info(tref.id).clone();
    let trait_type = Some(Type::Trait(tref));

    let vtable_type = reserve_struct(env, scope, info.vtable_type_name, true, trait_type.clone());
    bind_nominal_type(env, scope, info.vtable_type_name, vtable_type.clone(), visibility, decl);
    let vtable_ref = vtable_type.as_struct().ok_or_else(|| CompilerError::internal("vtable is not a struct", span))?;
    let fields = vtable_fields(env, tref);
    layout_struct_fields(env, vtable_ref, &fields, span)?;

    let object_type = reserve_struct(env, scope, info.trait_object_type_name, false, trait_type);
    bind_nominal_type(env, scope, info.trait_object_type_name, object_type.clone(), visibility, decl);
    let object_ref = object_type
        .as_struct()
        .ok_or_else(|| CompilerError::internal("trait object is not a struct", span))?;
    layout_struct_fields(env, object_ref, &trait_object_fields(&vtable_type), span)?;

    Ok((vtable_type, object_type))
}

fn bind_nominal_type(
    env: &mut Environment,
    scope: ScopeId,
    name: InternedString,
    ty: Type,
    visibility: Visibility,
    decl: Option<NodeId>,
) {
    env.bind_type(scope, name, TypeRecord { ty, visibility, decl });
}

/// Trait-object struct type of a trait, resolved from `scope`
pub fn trait_object_type(env: &Environment, scope: ScopeId, tref: TraitRef) -> Option<Type> {
    let name = env.types.trait_info(tref.id).trait_object_type_name;
    env.lookup_type(scope, name).cloned()
}

/// The trait a vtable or trait-object struct was synthesized for
pub fn associated_trait(env: &Environment, ty: &Type) -> Option<TraitRef> {
    let sref = ty.as_struct()?;
    env.types.struct_info(sref.id).associated_trait.as_ref()?.as_trait()
}

/// Whether `ty` is the trait-object struct of some trait
pub fn is_trait_object(env: &Environment, ty: &Type) -> bool {
    match (ty.as_struct(), associated_trait(env, ty)) {
        (Some(sref), Some(tref)) => env.types.trait_info(tref.id).trait_object_type_name == sref.name,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_layout_and_rescan_identity() {
        let mut env = Environment::new();
        let root = env.root();
        let ty = reserve_struct(&mut env, root, "Point".into(), false, None);
        let sref = ty.as_struct().unwrap();
        layout_struct_fields(&mut env, sref, &[("x".into(), Type::U8), ("y".into(), Type::U16)], None).unwrap();
        assert_eq!(env.sizeof(&ty), 2);
        assert_eq!(
            struct_member(&env, sref, "y".into()).map(|s| s.storage),
            Some(Storage::Automatic(Some(1)))
        );

        let again = reserve_struct(&mut env, root, "Point".into(), false, None);
        assert_eq!(again.as_struct().map(|s| s.id), Some(sref.id));
        assert!(struct_fields(&env, sref).is_empty());
    }

    #[test]
    fn test_recursive_struct_rejected() {
        let mut env = Environment::new();
        let root = env.root();
        let ty = reserve_struct(&mut env, root, "Node".into(), false, None);
        let sref = ty.as_struct().unwrap();
        let err = layout_struct_fields(&mut env, sref, &[("next".into(), ty.clone())], None).unwrap_err();
        assert_eq!(err.message(), "a struct cannot contain itself recursively");
        layout_struct_fields(&mut env, sref, &[("next".into(), Type::pointer(ty))], None).unwrap();
    }

    #[test]
    fn test_vtable_slot_erases_receiver() {
        let mut env = Environment::new();
        let root = env.root();
        let trait_type = reserve_trait(&mut env, root, "Shape".into(), "Shape".into());
        let tref = trait_type.as_trait().unwrap();
        let member = Type::pointer(Type::Function(FunctionType::new(Type::U16, vec![Type::pointer(trait_type.clone())])));
        bind_trait_members(&mut env, tref, &[("area".into(), member)]);

        let (vtable, object) = declare_trait_support_types(&mut env, root, tref, Visibility::Private, None, None).unwrap();
        let fields = vtable_fields(&env, tref);
        assert_eq!(
            fields[0].1,
            Type::pointer(Type::Function(FunctionType::new(Type::U16, vec![Type::pointer(Type::Void)])))
        );
        assert!(matches!(vtable, Type::ConstStruct(_)));
        assert!(is_trait_object(&env, &object));
        assert!(!is_trait_object(&env, &vtable));
        assert_eq!(env.lookup_type(root, "__Shape_object".into()), Some(&object));
    }
}
