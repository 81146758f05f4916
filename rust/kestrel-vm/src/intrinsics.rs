//! Native implementations of the intrinsic functions.
//!
//! Intrinsics receive every argument with its concrete type, so one
//! implementation serves strings, vectors, dicts, structs and json alike.
//! None of them mutates an argument; updates return new values.

use crate::call::runtime_type;
use crate::error::VmError;
use crate::interpreter::{json_kind, json_size, push_back_string, Interpreter};
use crate::link::{NativeFn, TypedValue};
use kestrel_core::{FunctionId, IntrinsicId, TypeId, TypeTable, Value, VectorValue};
use kestrel_runtime::SendError;
use std::sync::Arc;
use tracing::trace;

/// Native function for each intrinsic, indexed by [`IntrinsicId::index`].
pub(crate) fn table() -> Vec<NativeFn> {
    (0..).map_while(IntrinsicId::from_index).map(native_for).collect()
}

fn native_for(id: IntrinsicId) -> NativeFn {
    match id {
        IntrinsicId::Print => print,
        IntrinsicId::Assert => assert,
        IntrinsicId::ToString => to_string,
        IntrinsicId::ToPrettyString => to_pretty_string,
        IntrinsicId::Typeof => type_of,
        IntrinsicId::Update => update,
        IntrinsicId::Size => size,
        IntrinsicId::Find => find,
        IntrinsicId::Exists => exists,
        IntrinsicId::Erase => erase,
        IntrinsicId::GetKeys => get_keys,
        IntrinsicId::PushBack => push_back,
        IntrinsicId::Subset => subset,
        IntrinsicId::Replace => replace,
        IntrinsicId::ParseJsonScript => parse_json_script,
        IntrinsicId::GenerateJsonScript => generate_json_script,
        IntrinsicId::ToJson => to_json,
        IntrinsicId::FromJson => from_json,
        IntrinsicId::GetJsonType => get_json_type,
        IntrinsicId::Map => map,
        IntrinsicId::Filter => filter,
        IntrinsicId::Reduce => reduce,
        IntrinsicId::Send => send,
        IntrinsicId::Exit => exit,
    }
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn arity<'a, const N: usize>(name: &str, args: &'a [TypedValue]) -> Result<&'a [TypedValue; N], VmError> {
    args.try_into().map_err(|_| {
        VmError::TypeError(format!("{} takes {} arguments, got {}", name, N, args.len()))
    })
}

fn int_arg(name: &str, a: &TypedValue) -> Result<i64, VmError> {
    a.value
        .as_int()
        .ok_or_else(|| VmError::type_error(name, "int", a.value.kind_name()))
}

fn str_arg<'a>(name: &str, a: &'a TypedValue) -> Result<&'a str, VmError> {
    a.value
        .as_str()
        .ok_or_else(|| VmError::type_error(name, "string", a.value.kind_name()))
}

fn function_arg(name: &str, a: &TypedValue) -> Result<FunctionId, VmError> {
    a.value
        .as_function()
        .ok_or_else(|| VmError::type_error(name, "function", a.value.kind_name()))
}

fn index_arg(name: &str, a: &TypedValue, size: usize, what: &'static str) -> Result<usize, VmError> {
    let index = int_arg(name, a)?;
    usize::try_from(index)
        .ok()
        .filter(|i| *i < size)
        .ok_or(VmError::IndexOutOfBounds { what, index, size })
}

fn range_args(name: &str, start: &TypedValue, end: &TypedValue) -> Result<(usize, usize), VmError> {
    let s = int_arg(name, start)?;
    let e = int_arg(name, end)?;
    if s < 0 || e < 0 {
        return Err(VmError::TypeError(format!("{}: negative range {}..{}", name, s, e)));
    }
    Ok((s as usize, e as usize))
}

fn as_json_value(types: &TypeTable, v: &Value) -> serde_json::Value {
    match v {
        Value::Json(j) => j.as_ref().clone(),
        other => other.to_json(types),
    }
}

fn unsupported(name: &str, a: &TypedValue, types: &TypeTable) -> VmError {
    VmError::TypeError(format!("{} does not apply to {}", name, types.name(a.ty)))
}

fn char_slice(s: &str, start: usize, end: usize) -> String {
    s.chars().skip(start).take(end.saturating_sub(start)).collect()
}

// ---------------------------------------------------------------------------
// Output and inspection
// ---------------------------------------------------------------------------

fn print(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [value] = arity::<1>("print", args)?;
    let program = Arc::clone(interp.program());
    interp.print_line(value.value.to_compact_string(program.types()));
    Ok(Value::Undefined)
}

fn assert(_: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [cond] = arity::<1>("assert", args)?;
    match cond.value.as_bool() {
        Some(true) => Ok(Value::Undefined),
        Some(false) => Err(VmError::AssertFailed),
        None => Err(VmError::type_error("assert", "bool", cond.value.kind_name())),
    }
}

fn to_string(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [value] = arity::<1>("to_string", args)?;
    Ok(Value::string(value.value.to_compact_string(interp.types())))
}

fn to_pretty_string(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [value] = arity::<1>("to_pretty_string", args)?;
    Ok(Value::string(value.value.to_pretty_string(interp.types())))
}

fn type_of(_: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [value] = arity::<1>("typeof", args)?;
    Ok(Value::TypeId(value.ty))
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

fn update(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [coll, key, value] = arity::<3>("update", args)?;
    let types = interp.types();
    match &coll.value {
        Value::String(s) => {
            let size = s.chars().count();
            let at = index_arg("update", key, size, "string")?;
            let replacement = match &value.value {
                Value::Int(code) => u32::try_from(*code).ok().and_then(char::from_u32),
                Value::String(c) if c.chars().count() == 1 => c.chars().next(),
                _ => None,
            }
            .ok_or_else(|| VmError::type_error("update string", "a character", value.value.kind_name()))?;
            let out: String = s
                .chars()
                .enumerate()
                .map(|(i, ch)| if i == at { replacement } else { ch })
                .collect();
            Ok(Value::string(out))
        }
        Value::Vector(v) => {
            let at = index_arg("update", key, v.len(), "vector")?;
            Ok(Value::vector(v.update(at, value.value.clone())?))
        }
        Value::Dict(d) => {
            let k = str_arg("update", key)?;
            Ok(Value::dict(d.insert(k.to_string(), value.value.clone())?))
        }
        Value::Struct(s) => {
            let def = types.struct_def(s.ty);
            let index = match &key.value {
                Value::String(name) => def
                    .and_then(|d| d.member_index(name))
                    .ok_or_else(|| VmError::KeyNotFound(name.to_string()))?,
                _ => index_arg("update", key, s.members.len(), "struct")?,
            };
            let next = s.with_member(index, value.value.clone()).ok_or(VmError::IndexOutOfBounds {
                what: "struct",
                index: index as i64,
                size: s.members.len(),
            })?;
            Ok(Value::Struct(Arc::new(next)))
        }
        Value::Json(j) => {
            let mut next = j.as_ref().clone();
            let new_value = as_json_value(types, &value.value);
            match &mut next {
                serde_json::Value::Object(map) => {
                    map.insert(str_arg("update", key)?.to_string(), new_value);
                }
                serde_json::Value::Array(items) => {
                    let at = index_arg("update", key, items.len(), "json array")?;
                    items[at] = new_value;
                }
                other => return Err(VmError::JsonLookup(json_kind(other).to_string())),
            }
            Ok(Value::json(next))
        }
        _ => Err(unsupported("update", coll, types)),
    }
}

fn size(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [coll] = arity::<1>("size", args)?;
    let n = match &coll.value {
        Value::String(s) => s.chars().count(),
        Value::Vector(v) => v.len(),
        Value::Dict(d) => d.len(),
        Value::Json(_) => json_size(&coll.value)?,
        _ => return Err(unsupported("size", coll, interp.types())),
    };
    Ok(Value::Int(n as i64))
}

fn find(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [coll, needle] = arity::<2>("find", args)?;
    let found = match &coll.value {
        Value::String(s) => {
            let n = str_arg("find", needle)?;
            s.find(n).map(|byte| s[..byte].chars().count())
        }
        Value::Vector(v) => v.find(&needle.value),
        _ => return Err(unsupported("find", coll, interp.types())),
    };
    Ok(Value::Int(found.map_or(-1, |i| i as i64)))
}

fn exists(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [coll, key] = arity::<2>("exists", args)?;
    let k = str_arg("exists", key)?;
    let present = match &coll.value {
        Value::Dict(d) => d.contains_key(k),
        Value::Json(j) => match j.as_ref() {
            serde_json::Value::Object(map) => map.contains_key(k),
            other => return Err(VmError::JsonLookup(json_kind(other).to_string())),
        },
        _ => return Err(unsupported("exists", coll, interp.types())),
    };
    Ok(Value::Bool(present))
}

fn erase(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [coll, key] = arity::<2>("erase", args)?;
    let k = str_arg("erase", key)?;
    match &coll.value {
        Value::Dict(d) => Ok(Value::dict(d.remove(k))),
        Value::Json(j) => match j.as_ref() {
            serde_json::Value::Object(map) => {
                let mut next = map.clone();
                next.remove(k);
                Ok(Value::json(serde_json::Value::Object(next)))
            }
            other => Err(VmError::JsonLookup(json_kind(other).to_string())),
        },
        _ => Err(unsupported("erase", coll, interp.types())),
    }
}

fn get_keys(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [coll] = arity::<1>("get_keys", args)?;
    let keys = match &coll.value {
        Value::Dict(d) => d.keys(),
        Value::Json(j) => match j.as_ref() {
            serde_json::Value::Object(map) => map.keys().cloned().collect(),
            other => return Err(VmError::JsonLookup(json_kind(other).to_string())),
        },
        _ => return Err(unsupported("get_keys", coll, interp.types())),
    };
    let values = keys.into_iter().map(Value::string).collect();
    Ok(Value::vector(VectorValue::from_values(true, values)?))
}

fn push_back(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [coll, element] = arity::<2>("push_back", args)?;
    let types = interp.types();
    match &coll.value {
        Value::String(s) => push_back_string(s, &element.value),
        Value::Vector(v) => Ok(Value::vector(v.push_back(element.value.clone())?)),
        Value::Json(j) => match j.as_ref() {
            serde_json::Value::Array(items) => {
                let mut next = items.clone();
                next.push(as_json_value(types, &element.value));
                Ok(Value::json(serde_json::Value::Array(next)))
            }
            other => Err(VmError::JsonLookup(json_kind(other).to_string())),
        },
        _ => Err(unsupported("push_back", coll, types)),
    }
}

fn subset(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [coll, start, end] = arity::<3>("subset", args)?;
    let (s, e) = range_args("subset", start, end)?;
    match &coll.value {
        Value::String(text) => Ok(Value::string(char_slice(text, s, e))),
        Value::Vector(v) => Ok(Value::vector(v.subset(s, e))),
        _ => Err(unsupported("subset", coll, interp.types())),
    }
}

fn replace(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [coll, start, end, with] = arity::<4>("replace", args)?;
    let (s, e) = range_args("replace", start, end)?;
    match (&coll.value, &with.value) {
        (Value::String(text), Value::String(w)) => {
            let len = text.chars().count();
            let e = e.min(len);
            let s = s.min(e);
            let mut out = char_slice(text, 0, s);
            out.push_str(w);
            out.push_str(&char_slice(text, e, len));
            Ok(Value::string(out))
        }
        (Value::Vector(v), Value::Vector(w)) => Ok(Value::vector(v.replace(s, e, w)?)),
        _ => Err(unsupported("replace", coll, interp.types())),
    }
}

// ---------------------------------------------------------------------------
// Json
// ---------------------------------------------------------------------------

fn parse_json_script(_: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [text] = arity::<1>("parse_json_script", args)?;
    let s = str_arg("parse_json_script", text)?;
    let json: serde_json::Value = serde_json::from_str(s)
        .map_err(|e| VmError::Runtime(format!("invalid json script: {}", e)))?;
    Ok(Value::json(json))
}

fn generate_json_script(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [value] = arity::<1>("generate_json_script", args)?;
    let json = as_json_value(interp.types(), &value.value);
    Ok(Value::string(json.to_string()))
}

fn to_json(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [value] = arity::<1>("to_json", args)?;
    Ok(Value::json(as_json_value(interp.types(), &value.value)))
}

fn from_json(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [json, target] = arity::<2>("from_json", args)?;
    let j = json
        .value
        .as_json()
        .ok_or_else(|| VmError::type_error("from_json", "json", json.value.kind_name()))?;
    let ty = target
        .value
        .as_type_id()
        .ok_or_else(|| VmError::type_error("from_json", "typeid", target.value.kind_name()))?;
    Ok(Value::from_json(interp.types(), ty, j)?)
}

/// Json kind codes: object 1, array 2, string 3, number 4, true 5, false 6,
/// null 7.
fn get_json_type(_: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [json] = arity::<1>("get_json_type", args)?;
    let j = json
        .value
        .as_json()
        .ok_or_else(|| VmError::type_error("get_json_type", "json", json.value.kind_name()))?;
    let code = match j {
        serde_json::Value::Object(_) => 1,
        serde_json::Value::Array(_) => 2,
        serde_json::Value::String(_) => 3,
        serde_json::Value::Number(_) => 4,
        serde_json::Value::Bool(true) => 5,
        serde_json::Value::Bool(false) => 6,
        serde_json::Value::Null => 7,
    };
    Ok(Value::Int(code))
}

// ---------------------------------------------------------------------------
// Higher order
// ---------------------------------------------------------------------------

fn element_type(types: &TypeTable, collection: TypeId, element: &Value) -> TypeId {
    types
        .element_type(collection)
        .unwrap_or_else(|| runtime_type(element))
}

fn vector_arg<'a>(name: &str, a: &'a TypedValue) -> Result<&'a VectorValue, VmError> {
    a.value
        .as_vector()
        .ok_or_else(|| VmError::type_error(name, "vector", a.value.kind_name()))
}

fn map(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [coll, f] = arity::<2>("map", args)?;
    let v = vector_arg("map", coll)?;
    let f = function_arg("map", f)?;
    let program = Arc::clone(interp.program());
    let types = program.types();
    let mut results = Vec::with_capacity(v.len());
    for e in v.iter() {
        let ty = element_type(types, coll.ty, &e);
        results.push(interp.call_typed(f, &[TypedValue::new(ty, e)])?);
    }
    let external = match program.return_type(f) {
        Some(ret) if ret != TypeId::ANY => types.is_external(ret),
        _ => results.first().map_or(v.is_external(), Value::is_external),
    };
    Ok(Value::vector(VectorValue::from_values(external, results)?))
}

fn filter(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [coll, f] = arity::<2>("filter", args)?;
    let v = vector_arg("filter", coll)?;
    let f = function_arg("filter", f)?;
    let program = Arc::clone(interp.program());
    let mut kept = Vec::new();
    for e in v.iter() {
        let ty = element_type(program.types(), coll.ty, &e);
        let keep = interp.call_typed(f, &[TypedValue::new(ty, e.clone())])?;
        match keep.as_bool() {
            Some(true) => kept.push(e),
            Some(false) => {}
            None => return Err(VmError::type_error("filter", "bool", keep.kind_name())),
        }
    }
    Ok(Value::vector(VectorValue::from_values(v.is_external(), kept)?))
}

fn reduce(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [coll, init, f] = arity::<3>("reduce", args)?;
    let v = vector_arg("reduce", coll)?;
    let f = function_arg("reduce", f)?;
    let program = Arc::clone(interp.program());
    let mut acc = init.value.clone();
    for e in v.iter() {
        let ty = element_type(program.types(), coll.ty, &e);
        acc = interp.call_typed(
            f,
            &[TypedValue::new(init.ty, acc), TypedValue::new(ty, e)],
        )?;
    }
    Ok(acc)
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

/// Deliver a message. An unknown destination, or a destination that has
/// already shut down, is ignored; a message of the wrong type is fatal.
fn send(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [dest, message] = arity::<2>("send", args)?;
    let dest = str_arg("send", dest)?;
    let registry = match &interp.process {
        Some(ctx) => Arc::clone(&ctx.registry),
        None => {
            trace!(dest, "send outside a process runtime ignored");
            return Ok(Value::Undefined);
        }
    };
    match registry.send(dest, message.value.clone(), message.ty) {
        Ok(_) => Ok(Value::Undefined),
        Err(SendError::Closed { process }) => {
            trace!(process = %process, "send to a closed mailbox ignored");
            Ok(Value::Undefined)
        }
        Err(err) => {
            let types = interp.types();
            Err(VmError::from_send(err, |t| types.name(t)))
        }
    }
}

fn exit(interp: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let [] = arity::<0>("exit", args)?;
    if let Some(ctx) = &interp.process {
        ctx.handle.request_exit();
    }
    Ok(Value::Undefined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::link::{link, HostLibrary};
    use kestrel_core::{DictValue, Program, StaticFrame};

    fn interp_with(types: TypeTable) -> Interpreter {
        let program = Program {
            globals: StaticFrame::new("global", vec![], vec![], 0),
            functions: vec![],
            types,
            container: None,
            tests: vec![],
        };
        let linked = link(program, &HostLibrary::new()).unwrap();
        Interpreter::new(Arc::new(linked), VmConfig::default()).unwrap()
    }

    fn interp() -> Interpreter {
        interp_with(TypeTable::new())
    }

    fn tv(ty: TypeId, value: Value) -> TypedValue {
        TypedValue::new(ty, value)
    }

    fn ints(items: &[i64]) -> Value {
        Value::vector(
            VectorValue::from_values(false, items.iter().map(|n| Value::Int(*n)).collect()).unwrap(),
        )
    }

    #[test]
    fn table_covers_every_intrinsic() {
        assert_eq!(table().len(), 24);
    }

    #[test]
    fn print_collects_output() {
        let mut i = interp();
        print(&mut i, &[tv(TypeId::STRING, Value::string("hi"))]).unwrap();
        print(&mut i, &[tv(TypeId::INT, Value::Int(3))]).unwrap();
        assert_eq!(i.output(), &["hi".to_string(), "3".to_string()]);
    }

    #[test]
    fn arity_is_checked() {
        let mut i = interp();
        let err = print(&mut i, &[]).unwrap_err();
        assert!(err.message_contains("print takes 1 arguments, got 0"));
    }

    #[test]
    fn assert_false_fails() {
        let mut i = interp();
        assert_eq!(
            assert(&mut i, &[tv(TypeId::BOOL, Value::Bool(false))]),
            Err(VmError::AssertFailed)
        );
    }

    #[test]
    fn update_leaves_the_original_alone() {
        let mut i = interp();
        let original = ints(&[1, 2, 3]);
        let updated = update(
            &mut i,
            &[
                tv(TypeId::ANY, original.clone()),
                tv(TypeId::INT, Value::Int(1)),
                tv(TypeId::INT, Value::Int(9)),
            ],
        )
        .unwrap();
        assert_eq!(updated, ints(&[1, 9, 3]));
        assert_eq!(original, ints(&[1, 2, 3]));
    }

    #[test]
    fn update_out_of_bounds() {
        let mut i = interp();
        let err = update(
            &mut i,
            &[
                tv(TypeId::ANY, ints(&[1])),
                tv(TypeId::INT, Value::Int(5)),
                tv(TypeId::INT, Value::Int(0)),
            ],
        )
        .unwrap_err();
        assert!(err.is_index_out_of_bounds());
    }

    #[test]
    fn update_struct_member_by_name() {
        let mut types = TypeTable::new();
        let pixel = types.struct_of("pixel", &[("x", TypeId::INT), ("y", TypeId::INT)]);
        let mut i = interp_with(types);
        let p = Value::structure(pixel, vec![Value::Int(1), Value::Int(2)]);
        let moved = update(
            &mut i,
            &[
                tv(pixel, p),
                tv(TypeId::STRING, Value::string("y")),
                tv(TypeId::INT, Value::Int(7)),
            ],
        )
        .unwrap();
        assert_eq!(moved.to_compact_string(i.types()), "pixel(x: 1, y: 7)");
    }

    #[test]
    fn string_operations() {
        let mut i = interp();
        let s = tv(TypeId::STRING, Value::string("hello"));
        assert_eq!(
            find(&mut i, &[s.clone(), tv(TypeId::STRING, Value::string("ll"))]).unwrap(),
            Value::Int(2)
        );
        assert_eq!(
            subset(&mut i, &[s.clone(), tv(TypeId::INT, Value::Int(1)), tv(TypeId::INT, Value::Int(3))]).unwrap(),
            Value::string("el")
        );
        assert_eq!(
            replace(
                &mut i,
                &[
                    s.clone(),
                    tv(TypeId::INT, Value::Int(0)),
                    tv(TypeId::INT, Value::Int(1)),
                    tv(TypeId::STRING, Value::string("j")),
                ]
            )
            .unwrap(),
            Value::string("jello")
        );
        assert_eq!(size(&mut i, &[s]).unwrap(), Value::Int(5));
    }

    #[test]
    fn dict_keys_exists_erase() {
        let mut i = interp();
        let d = DictValue::empty(false)
            .insert("a".into(), Value::Int(1))
            .unwrap()
            .insert("b".into(), Value::Int(2))
            .unwrap();
        let d = tv(TypeId::ANY, Value::dict(d));
        let key = |k: &str| tv(TypeId::STRING, Value::string(k));
        assert_eq!(exists(&mut i, &[d.clone(), key("a")]).unwrap(), Value::Bool(true));
        let erased = erase(&mut i, &[d.clone(), key("a")]).unwrap();
        assert_eq!(
            exists(&mut i, &[tv(TypeId::ANY, erased), key("a")]).unwrap(),
            Value::Bool(false)
        );
        let keys = get_keys(&mut i, &[d]).unwrap();
        assert_eq!(keys.to_compact_string(i.types()), r#"["a", "b"]"#);
    }

    #[test]
    fn json_round_trip_and_kinds() {
        let mut i = interp();
        let parsed = parse_json_script(
            &mut i,
            &[tv(TypeId::STRING, Value::string(r#"{"n": [1, true, null]}"#))],
        )
        .unwrap();
        assert_eq!(get_json_type(&mut i, &[tv(TypeId::JSON, parsed.clone())]).unwrap(), Value::Int(1));
        let text = generate_json_script(&mut i, &[tv(TypeId::JSON, parsed)]).unwrap();
        assert_eq!(text, Value::string(r#"{"n":[1,true,null]}"#));
        assert!(parse_json_script(&mut i, &[tv(TypeId::STRING, Value::string("{"))]).is_err());
    }

    #[test]
    fn from_json_is_type_directed() {
        let mut types = TypeTable::new();
        let vec_int = types.vector_of(TypeId::INT);
        let mut i = interp_with(types);
        let v = from_json(
            &mut i,
            &[
                tv(TypeId::JSON, Value::json(serde_json::json!([1, 2]))),
                tv(TypeId::TYPEID, Value::TypeId(vec_int)),
            ],
        )
        .unwrap();
        assert_eq!(v, ints(&[1, 2]));
    }

    #[test]
    fn typeof_reports_the_static_type() {
        let mut i = interp();
        assert_eq!(
            type_of(&mut i, &[tv(TypeId::DOUBLE, Value::Double(1.5))]).unwrap(),
            Value::TypeId(TypeId::DOUBLE)
        );
    }

    #[test]
    fn send_and_exit_outside_processes_are_ignored() {
        let mut i = interp();
        assert_eq!(
            send(
                &mut i,
                &[
                    tv(TypeId::STRING, Value::string("nobody")),
                    tv(TypeId::INT, Value::Int(1)),
                ]
            )
            .unwrap(),
            Value::Undefined
        );
        assert_eq!(exit(&mut i, &[]).unwrap(), Value::Undefined);
    }
}
