//! Interned IR types.

use crate::entities::TypeId;
use cranelift_entity::PrimaryMap;
use rustc_hash::FxHashMap;

/// The shape of one interned type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeData {
    Void,
    /// An integer type with the given bit width (`i1`, `i8`, ... `i128`).
    Int(u32),
    Half,
    Float,
    Double,
    X86Fp80,
    Fp128,
    /// A pointer. Typed pointers from older IR collapse to this; the pointee
    /// is never needed because `alloca`/`load`/`gep` carry their types
    /// explicitly in modern IR.
    Ptr,
    Array {
        elem: TypeId,
        len: u64,
    },
    Struct {
        fields: Vec<TypeId>,
        packed: bool,
    },
    /// A reference to a named struct (`%struct.S`); its body lives in the
    /// store's name table once the type definition line has been seen.
    Named(String),
    Func {
        ret: TypeId,
        params: Vec<TypeId>,
        vararg: bool,
    },
    Vector {
        elem: TypeId,
        len: u64,
    },
    Label,
    Metadata,
    Token,
    /// An opaque struct body (`type opaque`).
    Opaque,
}

/// Interner for all types of a module.
#[derive(Debug)]
pub struct TypeStore {
    types: PrimaryMap<TypeId, TypeData>,
    interned: FxHashMap<TypeData, TypeId>,
    struct_bodies: FxHashMap<String, TypeId>,
}

impl TypeStore {
    pub fn new() -> Self {
        Self {
            types: PrimaryMap::new(),
            interned: FxHashMap::default(),
            struct_bodies: FxHashMap::default(),
        }
    }

    /// Intern a type, returning its id. Structurally identical types share
    /// one id.
    pub fn intern(&mut self, data: TypeData) -> TypeId {
        if let Some(&id) = self.interned.get(&data) {
            return id;
        }
        let id = self.types.push(data.clone());
        self.interned.insert(data, id);
        id
    }

    /// Record the body of a named struct type.
    pub fn define_struct(&mut self, name: &str, body: TypeId) {
        self.struct_bodies.insert(name.to_string(), body);
    }

    pub fn data(&self, ty: TypeId) -> &TypeData {
        &self.types[ty]
    }

    /// Resolve named struct references to their body, when known.
    pub fn resolve(&self, ty: TypeId) -> TypeId {
        match &self.types[ty] {
            TypeData::Named(name) => match self.struct_bodies.get(name) {
                Some(&body) => body,
                None => ty,
            },
            _ => ty,
        }
    }

    /// Resolved type data: named structs are looked through.
    pub fn resolved(&self, ty: TypeId) -> &TypeData {
        self.data(self.resolve(ty))
    }

    pub fn void(&mut self) -> TypeId {
        self.intern(TypeData::Void)
    }

    pub fn int(&mut self, bits: u32) -> TypeId {
        self.intern(TypeData::Int(bits))
    }

    pub fn ptr(&mut self) -> TypeId {
        self.intern(TypeData::Ptr)
    }

    pub fn is_ptr(&self, ty: TypeId) -> bool {
        matches!(self.resolved(ty), TypeData::Ptr)
    }

    pub fn is_int(&self, ty: TypeId) -> bool {
        matches!(self.resolved(ty), TypeData::Int(_))
    }

    pub fn is_array(&self, ty: TypeId) -> bool {
        matches!(self.resolved(ty), TypeData::Array { .. })
    }

    pub fn is_struct(&self, ty: TypeId) -> bool {
        matches!(self.resolved(ty), TypeData::Struct { .. } | TypeData::Opaque)
    }

    /// Printable form of a type, close to the textual IR syntax.
    pub fn display(&self, ty: TypeId) -> String {
        match self.data(ty) {
            TypeData::Void => "void".to_string(),
            TypeData::Int(bits) => format!("i{bits}"),
            TypeData::Half => "half".to_string(),
            TypeData::Float => "float".to_string(),
            TypeData::Double => "double".to_string(),
            TypeData::X86Fp80 => "x86_fp80".to_string(),
            TypeData::Fp128 => "fp128".to_string(),
            TypeData::Ptr => "ptr".to_string(),
            TypeData::Array { elem, len } => format!("[{} x {}]", len, self.display(*elem)),
            TypeData::Struct { fields, packed } => {
                let inner = fields
                    .iter()
                    .map(|f| self.display(*f))
                    .collect::<Vec<_>>()
                    .join(", ");
                if *packed {
                    format!("<{{ {inner} }}>")
                } else {
                    format!("{{ {inner} }}")
                }
            }
            TypeData::Named(name) => format!("%{name}"),
            TypeData::Func { ret, params, vararg } => {
                let mut inner = params
                    .iter()
                    .map(|p| self.display(*p))
                    .collect::<Vec<_>>()
                    .join(", ");
                if *vararg {
                    if !inner.is_empty() {
                        inner.push_str(", ");
                    }
                    inner.push_str("...");
                }
                format!("{} ({inner})", self.display(*ret))
            }
            TypeData::Vector { elem, len } => format!("<{} x {}>", len, self.display(*elem)),
            TypeData::Label => "label".to_string(),
            TypeData::Metadata => "metadata".to_string(),
            TypeData::Token => "token".to_string(),
            TypeData::Opaque => "opaque".to_string(),
        }
    }
}

impl Default for TypeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedups() {
        let mut store = TypeStore::new();
        let a = store.int(32);
        let b = store.int(32);
        assert_eq!(a, b);
        let arr = store.intern(TypeData::Array { elem: a, len: 10 });
        let arr2 = store.intern(TypeData::Array { elem: b, len: 10 });
        assert_eq!(arr, arr2);
        assert_ne!(a, arr);
    }

    #[test]
    fn named_struct_resolution() {
        let mut store = TypeStore::new();
        let i32t = store.int(32);
        let body = store.intern(TypeData::Struct {
            fields: vec![i32t, i32t],
            packed: false,
        });
        let named = store.intern(TypeData::Named("struct.S".to_string()));
        assert_eq!(store.resolve(named), named);
        store.define_struct("struct.S", body);
        assert_eq!(store.resolve(named), body);
        assert!(store.is_struct(named));
    }

    #[test]
    fn display_forms() {
        let mut store = TypeStore::new();
        let i8t = store.int(8);
        let arr = store.intern(TypeData::Array { elem: i8t, len: 10 });
        assert_eq!(store.display(arr), "[10 x i8]");
        let p = store.ptr();
        assert_eq!(store.display(p), "ptr");
    }
}
