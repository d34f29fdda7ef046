//! Linker-visible names for functions, generic instantiations and
//! synthesized trait machinery

use crate::arena::InternedString;
use crate::environment::Breadcrumb;
use crate::type_registry::Type;

/// Join the enclosing breadcrumbs (outermost first) with the declared name
pub fn mangle(breadcrumbs: &[Breadcrumb], name: InternedString) -> InternedString {
    let mut parts: Vec<String> = breadcrumbs
        .iter()
        .filter_map(|crumb| crumb.name())
        .map(|n| n.as_string())
        .collect();
    parts.push(name.as_string());
    InternedString::from(parts.join("_"))
}

/// `Name[T1, T2]`
pub fn mangle_generic(name: InternedString, arguments: &[Type]) -> InternedString {
    let args: Vec<String> = arguments.iter().map(|a| a.to_string()).collect();
    InternedString::from(format!("{}[{}]", name, args.join(", ")))
}

pub fn vtable_type_name(trait_name: InternedString) -> InternedString {
    InternedString::from(format!("__{}_vtable", trait_name))
}

pub fn trait_object_type_name(trait_name: InternedString) -> InternedString {
    let name = trait_name.as_string();
    if name.starts_with("__") {
        InternedString::from(format!("{}_object", name))
    } else {
        InternedString::from(format!("__{}_object", name))
    }
}

pub fn vtable_instance_name(trait_name: InternedString, struct_name: InternedString) -> InternedString {
    let struct_name = struct_name.as_string();
    let struct_name = struct_name.strip_prefix("__").unwrap_or(&struct_name);
    InternedString::from(format!("__{}_{}_vtable_instance", trait_name, struct_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mangle_joins_breadcrumbs() {
        let crumbs = vec![
            Breadcrumb::Module {
                name: "geometry".into(),
                use_global_namespace: false,
            },
            Breadcrumb::Struct("Circle".into()),
        ];
        assert_eq!(mangle(&crumbs, "area".into()), "geometry_Circle_area");
        assert_eq!(mangle(&[], "main".into()), "main");
    }

    #[test]
    fn test_trait_machinery_names() {
        assert_eq!(vtable_type_name("Shape".into()), "__Shape_vtable");
        assert_eq!(trait_object_type_name("Shape".into()), "__Shape_object");
        assert_eq!(trait_object_type_name("__Shape".into()), "__Shape_object");
        assert_eq!(vtable_instance_name("Shape".into(), "Circle".into()), "__Shape_Circle_vtable_instance");
        assert_eq!(vtable_instance_name("Shape".into(), "__Circle".into()), "__Shape_Circle_vtable_instance");
    }

    #[test]
    fn test_mangle_generic() {
        assert_eq!(mangle_generic("List".into(), &[Type::U8, Type::BOOL]), "List[u8, bool]");
    }
}
