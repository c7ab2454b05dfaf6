//! A module: functions, globals, types, metadata, and the data layout.

use crate::constant::Constant;
use crate::datalayout::DataLayout;
use crate::entities::{FuncId, GlobalId, TypeId};
use crate::function::Function;
use crate::metadata::MetadataStore;
use crate::types::TypeStore;
use cranelift_entity::PrimaryMap;
use rustc_hash::FxHashMap;

/// A global variable, defined or declared.
#[derive(Clone, Debug)]
pub struct GlobalData {
    /// Symbol name without the leading `@`.
    pub name: String,
    pub ty: TypeId,
    pub is_constant: bool,
    pub init: Option<Constant>,
}

/// One translation unit's worth of IR.
#[derive(Debug)]
pub struct Module {
    /// `source_filename` from the IR, when present.
    pub source_filename: String,
    pub target_triple: String,
    pub data_layout: DataLayout,
    pub types: TypeStore,
    pub functions: PrimaryMap<FuncId, Function>,
    pub globals: PrimaryMap<GlobalId, GlobalData>,
    pub metadata: MetadataStore,

    func_names: FxHashMap<String, FuncId>,
    global_names: FxHashMap<String, GlobalId>,
}

impl Module {
    pub fn new() -> Self {
        Self {
            source_filename: String::new(),
            target_triple: String::new(),
            data_layout: DataLayout::default(),
            types: TypeStore::new(),
            functions: PrimaryMap::new(),
            globals: PrimaryMap::new(),
            metadata: MetadataStore::new(),
            func_names: FxHashMap::default(),
            global_names: FxHashMap::default(),
        }
    }

    /// The function with the given symbol name, creating a declaration stub
    /// for forward references.
    pub fn ensure_func(&mut self, name: &str, ret_ty: TypeId) -> FuncId {
        if let Some(&id) = self.func_names.get(name) {
            return id;
        }
        let id = self.functions.push(Function::new(name.to_string(), ret_ty));
        self.func_names.insert(name.to_string(), id);
        id
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.func_names.get(name).copied()
    }

    /// The global with the given symbol name, creating a stub for forward
    /// references.
    pub fn ensure_global(&mut self, name: &str, ty: TypeId) -> GlobalId {
        if let Some(&id) = self.global_names.get(name) {
            return id;
        }
        let id = self.globals.push(GlobalData {
            name: name.to_string(),
            ty,
            is_constant: false,
            init: None,
        });
        self.global_names.insert(name.to_string(), id);
        id
    }

    pub fn global_by_name(&self, name: &str) -> Option<GlobalId> {
        self.global_names.get(name).copied()
    }

    /// Iterate the functions that have a body.
    pub fn defined_functions(&self) -> impl Iterator<Item = FuncId> + '_ {
        self.functions
            .iter()
            .filter(|(_, f)| !f.is_declaration)
            .map(|(id, _)| id)
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}
