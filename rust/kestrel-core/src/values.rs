//! Runtime values.
//!
//! Scalars are stored by value. Aggregates live behind an [`Arc`], so a
//! register holding one shares it with every other register holding the same
//! value. Collections are persistent (`imbl`): every update builds a new
//! value and leaves the original untouched.

use crate::frame::Constant;
use crate::program::FunctionId;
use crate::types::{Type, TypeId, TypeTable};
use imbl::{OrdMap, Vector};
use std::cmp::Ordering;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ValueError {
    #[error("a {found} value cannot be stored in an inplace collection")]
    NotInplace { found: &'static str },
    #[error("collection representations differ")]
    RepresentationMismatch,
    #[error("cannot convert json {json} to {ty}")]
    FromJson { json: String, ty: String },
}

/// Scalar payload stored directly in inplace collections.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Inplace {
    Undefined,
    Bool(bool),
    Int(i64),
    Double(f64),
    TypeId(TypeId),
    Function(FunctionId),
}

impl From<Inplace> for Value {
    fn from(v: Inplace) -> Self {
        match v {
            Inplace::Undefined => Value::Undefined,
            Inplace::Bool(b) => Value::Bool(b),
            Inplace::Int(n) => Value::Int(n),
            Inplace::Double(d) => Value::Double(d),
            Inplace::TypeId(t) => Value::TypeId(t),
            Inplace::Function(f) => Value::Function(f),
        }
    }
}

/// A register value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Bool(bool),
    Int(i64),
    Double(f64),
    TypeId(TypeId),
    Function(FunctionId),
    String(Arc<str>),
    Json(Arc<serde_json::Value>),
    Vector(Arc<VectorValue>),
    Dict(Arc<DictValue>),
    Struct(Arc<StructValue>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum VectorValue {
    Inplace(Vector<Inplace>),
    External(Vector<Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DictValue {
    Inplace(OrdMap<String, Inplace>),
    External(OrdMap<String, Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    pub ty: TypeId,
    pub members: Vec<Value>,
}

/// Doubles compare numerically, so `-0.0 == 0.0`. NaN has no numeric order
/// and falls back to the IEEE total order: it equals itself and sorts after
/// every number.
pub fn compare_doubles(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or_else(|| a.total_cmp(&b))
}

impl Value {
    pub fn string(s: impl Into<Arc<str>>) -> Value {
        Value::String(s.into())
    }

    pub fn json(j: serde_json::Value) -> Value {
        Value::Json(Arc::new(j))
    }

    pub fn vector(v: VectorValue) -> Value {
        Value::Vector(Arc::new(v))
    }

    pub fn dict(d: DictValue) -> Value {
        Value::Dict(Arc::new(d))
    }

    pub fn structure(ty: TypeId, members: Vec<Value>) -> Value {
        Value::Struct(Arc::new(StructValue { ty, members }))
    }

    pub fn from_constant(c: &Constant) -> Value {
        match c {
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(n) => Value::Int(*n),
            Constant::Double(d) => Value::Double(*d),
            Constant::String(s) => Value::string(s.as_str()),
            Constant::Json(j) => Value::json(j.clone()),
            Constant::TypeId(t) => Value::TypeId(*t),
            Constant::Function(f) => Value::Function(*f),
        }
    }

    /// Zero value of a type; the initial content of a non-constant slot.
    pub fn default_for(types: &TypeTable, ty: TypeId) -> Value {
        match types.get(ty) {
            Type::Bool => Value::Bool(false),
            Type::Int => Value::Int(0),
            Type::Double => Value::Double(0.0),
            Type::String => Value::string(""),
            Type::Json => Value::json(serde_json::Value::Null),
            Type::TypeId => Value::TypeId(TypeId::UNDEFINED),
            Type::Vector(e) => Value::vector(VectorValue::empty(types.is_external(*e))),
            Type::Dict(e) => Value::dict(DictValue::empty(types.is_external(*e))),
            Type::Struct(def) => Value::structure(
                ty,
                def.members
                    .iter()
                    .map(|m| Value::default_for(types, m.ty))
                    .collect(),
            ),
            Type::Undefined | Type::Any | Type::Void | Type::Function(_) => Value::Undefined,
        }
    }

    /// True for values that live behind a shared reference count.
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            Value::String(_) | Value::Json(_) | Value::Vector(_) | Value::Dict(_) | Value::Struct(_)
        )
    }

    /// Number of owners of an external value.
    pub fn strong_count(&self) -> Option<usize> {
        match self {
            Value::String(s) => Some(Arc::strong_count(s)),
            Value::Json(j) => Some(Arc::strong_count(j)),
            Value::Vector(v) => Some(Arc::strong_count(v)),
            Value::Dict(d) => Some(Arc::strong_count(d)),
            Value::Struct(s) => Some(Arc::strong_count(s)),
            _ => None,
        }
    }

    pub fn as_inplace(&self) -> Option<Inplace> {
        match self {
            Value::Undefined => Some(Inplace::Undefined),
            Value::Bool(b) => Some(Inplace::Bool(*b)),
            Value::Int(n) => Some(Inplace::Int(*n)),
            Value::Double(d) => Some(Inplace::Double(*d)),
            Value::TypeId(t) => Some(Inplace::TypeId(*t)),
            Value::Function(f) => Some(Inplace::Function(*f)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self { Value::Bool(b) => Some(*b), _ => None }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self { Value::Int(n) => Some(*n), _ => None }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self { Value::Double(d) => Some(*d), _ => None }
    }

    pub fn as_type_id(&self) -> Option<TypeId> {
        match self { Value::TypeId(t) => Some(*t), _ => None }
    }

    pub fn as_function(&self) -> Option<FunctionId> {
        match self { Value::Function(f) => Some(*f), _ => None }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self { Value::String(s) => Some(&**s), _ => None }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self { Value::Json(j) => Some(j.as_ref()), _ => None }
    }

    pub fn as_vector(&self) -> Option<&VectorValue> {
        match self { Value::Vector(v) => Some(v.as_ref()), _ => None }
    }

    pub fn as_dict(&self) -> Option<&DictValue> {
        match self { Value::Dict(d) => Some(d.as_ref()), _ => None }
    }

    pub fn as_struct(&self) -> Option<&StructValue> {
        match self { Value::Struct(s) => Some(s.as_ref()), _ => None }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::TypeId(_) => "typeid",
            Value::Function(_) => "function",
            Value::String(_) => "string",
            Value::Json(_) => "json",
            Value::Vector(_) => "vector",
            Value::Dict(_) => "dict",
            Value::Struct(_) => "struct",
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Value::Undefined => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Double(_) => 3,
            Value::TypeId(_) => 4,
            Value::Function(_) => 5,
            Value::String(_) => 6,
            Value::Json(_) => 7,
            Value::Vector(_) => 8,
            Value::Dict(_) => 9,
            Value::Struct(_) => 10,
        }
    }

    /// Total order used by the generic comparison opcodes. Aggregates compare
    /// lexicographically by element; doubles follow [`compare_doubles`]
    /// wherever they appear.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => compare_doubles(*a, *b),
            (Value::TypeId(a), Value::TypeId(b)) => a.cmp(b),
            (Value::Function(a), Value::Function(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Json(a), Value::Json(b)) => {
                if Arc::ptr_eq(a, b) || a == b {
                    Ordering::Equal
                } else {
                    a.to_string().cmp(&b.to_string())
                }
            }
            (Value::Vector(a), Value::Vector(b)) => {
                if Arc::ptr_eq(a, b) {
                    return Ordering::Equal;
                }
                a.iter().cmp_by_values(b.iter())
            }
            (Value::Dict(a), Value::Dict(b)) => {
                if Arc::ptr_eq(a, b) {
                    return Ordering::Equal;
                }
                let ea = a.entries();
                let eb = b.entries();
                for ((ka, va), (kb, vb)) in ea.iter().zip(eb.iter()) {
                    let ord = ka.cmp(kb).then_with(|| va.compare(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                ea.len().cmp(&eb.len())
            }
            (Value::Struct(a), Value::Struct(b)) => {
                if Arc::ptr_eq(a, b) {
                    return Ordering::Equal;
                }
                a.ty.cmp(&b.ty).then_with(|| {
                    a.members
                        .iter()
                        .cloned()
                        .cmp_by_values(b.members.iter().cloned())
                })
            }
            _ => self.kind_rank().cmp(&other.kind_rank()),
        }
    }

    /// Render for `print` and `to_string`: a top-level string is emitted raw.
    pub fn to_compact_string(&self, types: &TypeTable) -> String {
        match self {
            Value::String(s) => s.to_string(),
            _ => self.display_quoted(types),
        }
    }

    /// Like [`Value::to_compact_string`] but json is indented.
    pub fn to_pretty_string(&self, types: &TypeTable) -> String {
        match self {
            Value::Json(j) => serde_json::to_string_pretty(j.as_ref()).unwrap_or_default(),
            _ => self.to_compact_string(types),
        }
    }

    /// Display with quotes for strings (used inside containers).
    fn display_quoted(&self, types: &TypeTable) -> String {
        match self {
            Value::Undefined => "undef".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Double(d) => format_double(*d),
            Value::TypeId(t) => types.name(*t),
            Value::Function(FunctionId::Defined(i)) => format!("function#{}", i),
            Value::Function(FunctionId::Intrinsic(id)) => id.name().to_string(),
            Value::String(s) => serde_json::Value::String(s.to_string()).to_string(),
            Value::Json(j) => j.to_string(),
            Value::Vector(v) => {
                let items: Vec<String> = v.iter().map(|e| e.display_quoted(types)).collect();
                format!("[{}]", items.join(", "))
            }
            Value::Dict(d) => {
                let entries: Vec<String> = d
                    .entries()
                    .iter()
                    .map(|(k, v)| format!("\"{}\": {}", k, v.display_quoted(types)))
                    .collect();
                format!("{{{}}}", entries.join(", "))
            }
            Value::Struct(s) => {
                let def = types.struct_def(s.ty);
                let name = def.map(|d| d.name.as_str()).unwrap_or("struct");
                let fields: Vec<String> = s
                    .members
                    .iter()
                    .enumerate()
                    .map(|(i, v)| {
                        let member = def
                            .and_then(|d| d.members.get(i))
                            .map(|m| m.name.clone())
                            .unwrap_or_else(|| i.to_string());
                        format!("{}: {}", member, v.display_quoted(types))
                    })
                    .collect();
                format!("{}({})", name, fields.join(", "))
            }
        }
    }

    /// Convert to json. Structs become objects keyed by member name.
    pub fn to_json(&self, types: &TypeTable) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Undefined | Value::Function(_) => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Int(n) => J::from(*n),
            Value::Double(d) => serde_json::Number::from_f64(*d).map(J::Number).unwrap_or(J::Null),
            Value::TypeId(t) => J::String(types.name(*t)),
            Value::String(s) => J::String(s.to_string()),
            Value::Json(j) => j.as_ref().clone(),
            Value::Vector(v) => J::Array(v.iter().map(|e| e.to_json(types)).collect()),
            Value::Dict(d) => J::Object(
                d.entries()
                    .into_iter()
                    .map(|(k, v)| (k, v.to_json(types)))
                    .collect(),
            ),
            Value::Struct(s) => {
                let mut obj = serde_json::Map::new();
                let def = types.struct_def(s.ty);
                for (i, v) in s.members.iter().enumerate() {
                    let key = def
                        .and_then(|d| d.members.get(i))
                        .map(|m| m.name.clone())
                        .unwrap_or_else(|| i.to_string());
                    obj.insert(key, v.to_json(types));
                }
                J::Object(obj)
            }
        }
    }

    /// Type-directed conversion from json.
    pub fn from_json(
        types: &TypeTable,
        ty: TypeId,
        json: &serde_json::Value,
    ) -> Result<Value, ValueError> {
        use serde_json::Value as J;
        let fail = || ValueError::FromJson {
            json: json.to_string(),
            ty: types.name(ty),
        };
        let value = match (types.get(ty), json) {
            (Type::Json, j) => Value::json(j.clone()),
            (Type::Bool, J::Bool(b)) => Value::Bool(*b),
            (Type::Int, J::Number(n)) => Value::Int(n.as_i64().ok_or_else(fail)?),
            (Type::Double, J::Number(n)) => Value::Double(n.as_f64().ok_or_else(fail)?),
            (Type::String, J::String(s)) => Value::string(s.as_str()),
            (Type::TypeId, J::String(s)) => {
                let found = (0..types.len() as u32)
                    .map(TypeId)
                    .find(|t| types.name(*t) == *s)
                    .ok_or_else(fail)?;
                Value::TypeId(found)
            }
            (Type::Vector(e), J::Array(items)) => {
                let elements = items
                    .iter()
                    .map(|item| Value::from_json(types, *e, item))
                    .collect::<Result<Vec<_>, _>>()?;
                Value::vector(VectorValue::from_values(types.is_external(*e), elements)?)
            }
            (Type::Dict(e), J::Object(map)) => {
                let mut dict = DictValue::empty(types.is_external(*e));
                for (k, v) in map {
                    dict = dict.insert(k.clone(), Value::from_json(types, *e, v)?)?;
                }
                Value::dict(dict)
            }
            (Type::Struct(def), J::Object(map)) => {
                let members = def
                    .members
                    .iter()
                    .map(|m| match map.get(&m.name) {
                        Some(v) => Value::from_json(types, m.ty, v),
                        None => Err(fail()),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Value::structure(ty, members)
            }
            _ => return Err(fail()),
        };
        Ok(value)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.kind_rank() == other.kind_rank() && self.compare(other) == Ordering::Equal
    }
}

trait CmpByValues: Iterator<Item = Value> + Sized {
    fn cmp_by_values<I: Iterator<Item = Value>>(mut self, mut other: I) -> Ordering {
        loop {
            match (self.next(), other.next()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(a), Some(b)) => {
                    let ord = a.compare(&b);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
            }
        }
    }
}

impl<T: Iterator<Item = Value>> CmpByValues for T {}

/// Format a double keeping at least one decimal.
fn format_double(d: f64) -> String {
    if d == d.floor() && d.abs() < 1e15 {
        format!("{:.1}", d)
    } else {
        format!("{}", d)
    }
}

fn to_inplace(v: Value) -> Result<Inplace, ValueError> {
    v.as_inplace().ok_or(ValueError::NotInplace {
        found: v.kind_name(),
    })
}

impl VectorValue {
    pub fn empty(external: bool) -> Self {
        if external {
            VectorValue::External(Vector::new())
        } else {
            VectorValue::Inplace(Vector::new())
        }
    }

    pub fn from_values(external: bool, values: Vec<Value>) -> Result<Self, ValueError> {
        if external {
            Ok(VectorValue::External(values.into_iter().collect()))
        } else {
            let items = values
                .into_iter()
                .map(to_inplace)
                .collect::<Result<Vector<_>, _>>()?;
            Ok(VectorValue::Inplace(items))
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, VectorValue::External(_))
    }

    pub fn len(&self) -> usize {
        match self {
            VectorValue::Inplace(v) => v.len(),
            VectorValue::External(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        match self {
            VectorValue::Inplace(v) => v.get(index).map(|e| Value::from(*e)),
            VectorValue::External(v) => v.get(index).cloned(),
        }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = Value> + '_> {
        match self {
            VectorValue::Inplace(v) => Box::new(v.iter().map(|e| Value::from(*e))),
            VectorValue::External(v) => Box::new(v.iter().cloned()),
        }
    }

    pub fn push_back(&self, value: Value) -> Result<Self, ValueError> {
        match self {
            VectorValue::Inplace(v) => {
                let mut next = v.clone();
                next.push_back(to_inplace(value)?);
                Ok(VectorValue::Inplace(next))
            }
            VectorValue::External(v) => {
                let mut next = v.clone();
                next.push_back(value);
                Ok(VectorValue::External(next))
            }
        }
    }

    /// Replace element `index`. The caller checks bounds.
    pub fn update(&self, index: usize, value: Value) -> Result<Self, ValueError> {
        match self {
            VectorValue::Inplace(v) => Ok(VectorValue::Inplace(v.update(index, to_inplace(value)?))),
            VectorValue::External(v) => Ok(VectorValue::External(v.update(index, value))),
        }
    }

    pub fn concat(&self, other: &VectorValue) -> Result<Self, ValueError> {
        match (self, other) {
            (VectorValue::Inplace(a), VectorValue::Inplace(b)) => {
                let mut next = a.clone();
                next.append(b.clone());
                Ok(VectorValue::Inplace(next))
            }
            (VectorValue::External(a), VectorValue::External(b)) => {
                let mut next = a.clone();
                next.append(b.clone());
                Ok(VectorValue::External(next))
            }
            _ => Err(ValueError::RepresentationMismatch),
        }
    }

    /// Elements `start..end`, both clamped to the length.
    pub fn subset(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.len());
        let start = start.min(end);
        match self {
            VectorValue::Inplace(v) => VectorValue::Inplace(v.clone().slice(start..end)),
            VectorValue::External(v) => VectorValue::External(v.clone().slice(start..end)),
        }
    }

    /// Replace `start..end` with the elements of `with`.
    pub fn replace(&self, start: usize, end: usize, with: &VectorValue) -> Result<Self, ValueError> {
        let end = end.min(self.len());
        let start = start.min(end);
        let head = self.subset(0, start);
        let tail = self.subset(end, self.len());
        head.concat(with)?.concat(&tail)
    }

    pub fn find(&self, needle: &Value) -> Option<usize> {
        self.iter().position(|e| e == *needle)
    }
}

impl DictValue {
    pub fn empty(external: bool) -> Self {
        if external {
            DictValue::External(OrdMap::new())
        } else {
            DictValue::Inplace(OrdMap::new())
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, DictValue::External(_))
    }

    pub fn len(&self) -> usize {
        match self {
            DictValue::Inplace(d) => d.len(),
            DictValue::External(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            DictValue::Inplace(d) => d.get(key).map(|e| Value::from(*e)),
            DictValue::External(d) => d.get(key).cloned(),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        match self {
            DictValue::Inplace(d) => d.contains_key(key),
            DictValue::External(d) => d.contains_key(key),
        }
    }

    pub fn insert(&self, key: String, value: Value) -> Result<Self, ValueError> {
        match self {
            DictValue::Inplace(d) => Ok(DictValue::Inplace(d.update(key, to_inplace(value)?))),
            DictValue::External(d) => Ok(DictValue::External(d.update(key, value))),
        }
    }

    pub fn remove(&self, key: &str) -> Self {
        match self {
            DictValue::Inplace(d) => DictValue::Inplace(d.without(key)),
            DictValue::External(d) => DictValue::External(d.without(key)),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        match self {
            DictValue::Inplace(d) => d.keys().cloned().collect(),
            DictValue::External(d) => d.keys().cloned().collect(),
        }
    }

    /// Entries in key order.
    pub fn entries(&self) -> Vec<(String, Value)> {
        match self {
            DictValue::Inplace(d) => d.iter().map(|(k, v)| (k.clone(), Value::from(*v))).collect(),
            DictValue::External(d) => d.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

impl StructValue {
    pub fn with_member(&self, index: usize, value: Value) -> Option<StructValue> {
        if index >= self.members.len() {
            return None;
        }
        let mut members = self.members.clone();
        members[index] = value;
        Some(StructValue {
            ty: self.ty,
            members,
        })
    }
}
