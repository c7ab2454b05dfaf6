//! Debug-info metadata nodes and the queries the analyses make of them.

use crate::entities::MdId;
use cranelift_entity::PrimaryMap;
use rustc_hash::FxHashMap;

/// The DWARF tags the analyzer distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DwTag {
    PointerType,
    ReferenceType,
    RvalueReferenceType,
    ConstType,
    VolatileType,
    RestrictType,
    Typedef,
    Member,
    StructureType,
    ClassType,
    UnionType,
    EnumerationType,
    ArrayType,
    Other,
}

impl DwTag {
    pub fn from_name(name: &str) -> Self {
        match name {
            "DW_TAG_pointer_type" => DwTag::PointerType,
            "DW_TAG_reference_type" => DwTag::ReferenceType,
            "DW_TAG_rvalue_reference_type" => DwTag::RvalueReferenceType,
            "DW_TAG_const_type" => DwTag::ConstType,
            "DW_TAG_volatile_type" => DwTag::VolatileType,
            "DW_TAG_restrict_type" => DwTag::RestrictType,
            "DW_TAG_typedef" => DwTag::Typedef,
            "DW_TAG_member" => DwTag::Member,
            "DW_TAG_structure_type" => DwTag::StructureType,
            "DW_TAG_class_type" => DwTag::ClassType,
            "DW_TAG_union_type" => DwTag::UnionType,
            "DW_TAG_enumeration_type" => DwTag::EnumerationType,
            "DW_TAG_array_type" => DwTag::ArrayType,
            _ => DwTag::Other,
        }
    }
}

/// One metadata node. Fields the analyzer does not consume are dropped by
/// the reader.
#[derive(Clone, Debug, PartialEq)]
pub enum MdNode {
    Location {
        line: u32,
        column: u32,
        scope: Option<MdId>,
    },
    File {
        filename: String,
        directory: String,
    },
    Subprogram {
        name: String,
        linkage_name: String,
        file: Option<MdId>,
        line: u32,
        ty: Option<MdId>,
        retained_nodes: Option<MdId>,
    },
    LexicalBlock {
        scope: Option<MdId>,
        file: Option<MdId>,
    },
    SubroutineType {
        /// Tuple of types; first entry is the return type.
        types: Option<MdId>,
    },
    LocalVariable {
        name: String,
        /// 1-based parameter index; 0 for plain locals.
        arg: u32,
        line: u32,
        ty: Option<MdId>,
        scope: Option<MdId>,
    },
    BasicType {
        name: String,
    },
    DerivedType {
        tag: DwTag,
        name: String,
        base: Option<MdId>,
    },
    CompositeType {
        tag: DwTag,
        name: String,
        identifier: String,
    },
    Expression,
    Tuple(Vec<Option<MdId>>),
    Str(String),
    Unknown,
}

/// CV qualifiers stripped from a debug type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TypeQuals {
    pub is_const: bool,
    pub is_volatile: bool,
    pub is_restrict: bool,
}

/// All metadata nodes of a module, addressable by the textual `!N` index.
#[derive(Debug)]
pub struct MetadataStore {
    nodes: PrimaryMap<MdId, MdNode>,
    by_index: FxHashMap<u32, MdId>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self {
            nodes: PrimaryMap::new(),
            by_index: FxHashMap::default(),
        }
    }

    pub fn add(&mut self, node: MdNode) -> MdId {
        self.nodes.push(node)
    }

    /// Id for textual index `!n`, creating an `Unknown` placeholder for
    /// forward references.
    pub fn ensure_indexed(&mut self, index: u32) -> MdId {
        if let Some(&id) = self.by_index.get(&index) {
            return id;
        }
        let id = self.nodes.push(MdNode::Unknown);
        self.by_index.insert(index, id);
        id
    }

    /// Install the definition of textual index `!n`.
    pub fn define_indexed(&mut self, index: u32, node: MdNode) -> MdId {
        let id = self.ensure_indexed(index);
        self.nodes[id] = node;
        id
    }

    pub fn node(&self, id: MdId) -> &MdNode {
        &self.nodes[id]
    }

    /// Line/column of a `DILocation`.
    pub fn location(&self, id: MdId) -> Option<(u32, u32)> {
        match self.node(id) {
            MdNode::Location { line, column, .. } => Some((*line, *column)),
            _ => None,
        }
    }

    /// Directory-joined path of a `DIFile`.
    pub fn file_path(&self, id: MdId) -> Option<String> {
        match self.node(id) {
            MdNode::File {
                filename,
                directory,
            } => {
                if filename.is_empty() {
                    None
                } else if directory.is_empty() || filename.starts_with('/') {
                    Some(filename.clone())
                } else {
                    Some(format!("{directory}/{filename}"))
                }
            }
            _ => None,
        }
    }

    /// Source path of the file a `DILocation` or `DISubprogram` belongs to,
    /// walking lexical-block scopes as needed.
    pub fn scope_path(&self, mut id: MdId) -> Option<String> {
        for _ in 0..32 {
            match self.node(id) {
                MdNode::Location { scope, .. } => id = (*scope)?,
                MdNode::LexicalBlock { file, scope } => {
                    if let Some(file) = file {
                        if let Some(path) = self.file_path(*file) {
                            return Some(path);
                        }
                    }
                    id = (*scope)?;
                }
                MdNode::Subprogram { file, .. } => return self.file_path((*file)?),
                MdNode::File { .. } => return self.file_path(id),
                _ => return None,
            }
        }
        None
    }

    pub fn subprogram_line(&self, id: MdId) -> u32 {
        match self.node(id) {
            MdNode::Subprogram { line, .. } => *line,
            _ => 0,
        }
    }

    /// The `DILocalVariable` describing the 1-based argument `argno` of a
    /// subprogram, searched through its retained nodes.
    pub fn param_variable(&self, subprogram: MdId, argno: u32) -> Option<MdId> {
        let retained = match self.node(subprogram) {
            MdNode::Subprogram { retained_nodes, .. } => (*retained_nodes)?,
            _ => return None,
        };
        let entries = match self.node(retained) {
            MdNode::Tuple(entries) => entries,
            _ => return None,
        };
        for entry in entries.iter().flatten() {
            if let MdNode::LocalVariable { arg, .. } = self.node(*entry) {
                if *arg == argno {
                    return Some(*entry);
                }
            }
        }
        None
    }

    /// The declared type of the 1-based argument `argno`: the local
    /// variable's type, falling back to the subroutine type array.
    pub fn param_type(&self, subprogram: MdId, argno: u32) -> Option<MdId> {
        if let Some(var) = self.param_variable(subprogram, argno) {
            if let MdNode::LocalVariable { ty: Some(ty), .. } = self.node(var) {
                return Some(*ty);
            }
        }
        let sub_ty = match self.node(subprogram) {
            MdNode::Subprogram { ty, .. } => (*ty)?,
            _ => return None,
        };
        let types = match self.node(sub_ty) {
            MdNode::SubroutineType { types } => (*types)?,
            _ => return None,
        };
        match self.node(types) {
            MdNode::Tuple(entries) => entries.get(argno as usize).copied().flatten(),
            _ => None,
        }
    }

    /// Strip `DW_TAG_typedef` wrappers.
    pub fn strip_typedefs(&self, mut id: MdId) -> MdId {
        for _ in 0..32 {
            match self.node(id) {
                MdNode::DerivedType {
                    tag: DwTag::Typedef,
                    base: Some(base),
                    ..
                } => id = *base,
                _ => break,
            }
        }
        id
    }

    /// Strip cv-qualifier wrappers, reporting which were present. `None`
    /// means the qualifier chain bottomed out (e.g. `const void`).
    pub fn strip_qualifiers(&self, id: Option<MdId>) -> (Option<MdId>, TypeQuals) {
        let mut quals = TypeQuals::default();
        let mut cur = id;
        for _ in 0..32 {
            let Some(node_id) = cur else { break };
            match self.node(node_id) {
                MdNode::DerivedType {
                    tag: DwTag::ConstType,
                    base,
                    ..
                } => {
                    quals.is_const = true;
                    cur = *base;
                }
                MdNode::DerivedType {
                    tag: DwTag::VolatileType,
                    base,
                    ..
                } => {
                    quals.is_volatile = true;
                    cur = *base;
                }
                MdNode::DerivedType {
                    tag: DwTag::RestrictType,
                    base,
                    ..
                } => {
                    quals.is_restrict = true;
                    cur = *base;
                }
                _ => break,
            }
        }
        (cur, quals)
    }

    /// Human-readable name of a debug type, preserving typedef names and
    /// looking through cv-qualifiers.
    pub fn type_name(&self, id: Option<MdId>) -> String {
        let Some(id) = id else {
            return "<unknown type>".to_string();
        };
        match self.node(id) {
            MdNode::BasicType { name } if !name.is_empty() => name.clone(),
            MdNode::CompositeType {
                name, identifier, ..
            } => {
                if !name.is_empty() {
                    name.clone()
                } else if !identifier.is_empty() {
                    identifier.clone()
                } else {
                    "<anonymous type>".to_string()
                }
            }
            MdNode::DerivedType {
                tag: DwTag::Typedef,
                name,
                ..
            } if !name.is_empty() => name.clone(),
            MdNode::DerivedType {
                tag: DwTag::ConstType | DwTag::VolatileType | DwTag::RestrictType,
                base,
                ..
            } => self.type_name(*base),
            MdNode::DerivedType { name, .. } if !name.is_empty() => name.clone(),
            MdNode::SubroutineType { .. } => "<function>".to_string(),
            _ => "<anonymous type>".to_string(),
        }
    }
}

impl Default for MetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_references_resolve() {
        let mut store = MetadataStore::new();
        let fwd = store.ensure_indexed(7);
        assert_eq!(store.node(fwd), &MdNode::Unknown);
        let defined = store.define_indexed(
            7,
            MdNode::File {
                filename: "a.c".to_string(),
                directory: "/src".to_string(),
            },
        );
        assert_eq!(fwd, defined);
        assert_eq!(store.file_path(fwd), Some("/src/a.c".to_string()));
    }

    #[test]
    fn qualifier_stripping() {
        let mut store = MetadataStore::new();
        let base = store.add(MdNode::BasicType {
            name: "int".to_string(),
        });
        let constant = store.add(MdNode::DerivedType {
            tag: DwTag::ConstType,
            name: String::new(),
            base: Some(base),
        });
        let (stripped, quals) = store.strip_qualifiers(Some(constant));
        assert_eq!(stripped, Some(base));
        assert!(quals.is_const);
        assert!(!quals.is_volatile);
        assert_eq!(store.type_name(Some(constant)), "int");
    }

    #[test]
    fn param_lookup_via_retained_nodes() {
        let mut store = MetadataStore::new();
        let ty = store.add(MdNode::BasicType {
            name: "int".to_string(),
        });
        let var = store.add(MdNode::LocalVariable {
            name: "p".to_string(),
            arg: 1,
            line: 3,
            ty: Some(ty),
            scope: None,
        });
        let retained = store.add(MdNode::Tuple(vec![Some(var)]));
        let sp = store.add(MdNode::Subprogram {
            name: "f".to_string(),
            linkage_name: String::new(),
            file: None,
            line: 3,
            ty: None,
            retained_nodes: Some(retained),
        });
        assert_eq!(store.param_variable(sp, 1), Some(var));
        assert_eq!(store.param_type(sp, 1), Some(ty));
        assert_eq!(store.param_variable(sp, 2), None);
    }
}
