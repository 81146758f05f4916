//! Type table: structural type descriptions interned to compact ids.
//!
//! Every type a program mentions is interned exactly once, so two values have
//! the same runtime type iff their [`TypeId`]s are equal. The scalar types
//! occupy fixed, predeclared ids.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Interned type identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TypeId(pub u32);

impl TypeId {
    pub const UNDEFINED: TypeId = TypeId(0);
    pub const ANY: TypeId = TypeId(1);
    pub const VOID: TypeId = TypeId(2);
    pub const BOOL: TypeId = TypeId(3);
    pub const INT: TypeId = TypeId(4);
    pub const DOUBLE: TypeId = TypeId(5);
    pub const STRING: TypeId = TypeId(6);
    pub const JSON: TypeId = TypeId(7);
    pub const TYPEID: TypeId = TypeId(8);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// How a value of a given type is held in a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Storage {
    /// Scalar stored by value; never reference counted.
    Inplace,
    /// Heap aggregate behind a shared reference count.
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Member {
    pub name: String,
    pub ty: TypeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StructDef {
    pub name: String,
    pub members: Vec<Member>,
}

impl StructDef {
    pub fn member_index(&self, name: &str) -> Option<usize> {
        self.members.iter().position(|m| m.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FunctionSig {
    pub ret: TypeId,
    pub args: Vec<TypeId>,
    pub pure: bool,
}

/// Structural type description.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Type {
    Undefined,
    Any,
    Void,
    Bool,
    Int,
    Double,
    String,
    Json,
    TypeId,
    Struct(StructDef),
    Vector(TypeId),
    Dict(TypeId),
    Function(FunctionSig),
}

static UNDEFINED: Type = Type::Undefined;

const PREDECLARED: [Type; 9] = [
    Type::Undefined,
    Type::Any,
    Type::Void,
    Type::Bool,
    Type::Int,
    Type::Double,
    Type::String,
    Type::Json,
    Type::TypeId,
];

/// Interning table for all types of one program.
#[derive(Debug, Clone, Serialize)]
pub struct TypeTable {
    types: Vec<Type>,
    #[serde(skip)]
    lookup: HashMap<Type, TypeId>,
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeTable {
    pub fn new() -> Self {
        let mut table = Self {
            types: Vec::new(),
            lookup: HashMap::new(),
        };
        for ty in PREDECLARED {
            table.intern(ty);
        }
        table
    }

    /// Intern a type, returning its stable id.
    pub fn intern(&mut self, ty: Type) -> TypeId {
        if let Some(&id) = self.lookup.get(&ty) {
            return id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(ty.clone());
        self.lookup.insert(ty, id);
        id
    }

    pub fn vector_of(&mut self, element: TypeId) -> TypeId {
        self.intern(Type::Vector(element))
    }

    pub fn dict_of(&mut self, value: TypeId) -> TypeId {
        self.intern(Type::Dict(value))
    }

    pub fn struct_of(&mut self, name: &str, members: &[(&str, TypeId)]) -> TypeId {
        self.intern(Type::Struct(StructDef {
            name: name.to_string(),
            members: members
                .iter()
                .map(|(n, t)| Member {
                    name: n.to_string(),
                    ty: *t,
                })
                .collect(),
        }))
    }

    pub fn function_of(&mut self, ret: TypeId, args: &[TypeId], pure: bool) -> TypeId {
        self.intern(Type::Function(FunctionSig {
            ret,
            args: args.to_vec(),
            pure,
        }))
    }

    /// Look up an already interned type without adding it.
    pub fn find(&self, ty: &Type) -> Option<TypeId> {
        self.lookup.get(ty).copied()
    }

    pub fn get(&self, id: TypeId) -> &Type {
        self.types.get(id.index()).unwrap_or(&UNDEFINED)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn storage(&self, id: TypeId) -> Storage {
        match self.get(id) {
            Type::Undefined
            | Type::Void
            | Type::Bool
            | Type::Int
            | Type::Double
            | Type::TypeId
            | Type::Function(_) => Storage::Inplace,
            Type::Any
            | Type::String
            | Type::Json
            | Type::Struct(_)
            | Type::Vector(_)
            | Type::Dict(_) => Storage::External,
        }
    }

    pub fn is_external(&self, id: TypeId) -> bool {
        self.storage(id) == Storage::External
    }

    /// Element type of a vector or value type of a dict.
    pub fn element_type(&self, id: TypeId) -> Option<TypeId> {
        match self.get(id) {
            Type::Vector(e) | Type::Dict(e) => Some(*e),
            _ => None,
        }
    }

    pub fn struct_def(&self, id: TypeId) -> Option<&StructDef> {
        match self.get(id) {
            Type::Struct(def) => Some(def),
            _ => None,
        }
    }

    pub fn function_sig(&self, id: TypeId) -> Option<&FunctionSig> {
        match self.get(id) {
            Type::Function(sig) => Some(sig),
            _ => None,
        }
    }

    /// Source-level spelling of a type, e.g. `[string:int]`.
    pub fn name(&self, id: TypeId) -> String {
        match self.get(id) {
            Type::Undefined => "undef".to_string(),
            Type::Any => "any".to_string(),
            Type::Void => "void".to_string(),
            Type::Bool => "bool".to_string(),
            Type::Int => "int".to_string(),
            Type::Double => "double".to_string(),
            Type::String => "string".to_string(),
            Type::Json => "json".to_string(),
            Type::TypeId => "typeid".to_string(),
            Type::Struct(def) => def.name.clone(),
            Type::Vector(e) => format!("[{}]", self.name(*e)),
            Type::Dict(e) => format!("[string:{}]", self.name(*e)),
            Type::Function(sig) => {
                let args: Vec<String> = sig.args.iter().map(|a| self.name(*a)).collect();
                format!(
                    "func {}({}) {}",
                    self.name(sig.ret),
                    args.join(","),
                    if sig.pure { "pure" } else { "impure" }
                )
            }
        }
    }
}
