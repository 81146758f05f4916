//! The compiled program: global frame, function table, types, process
//! declarations and tests.

use crate::frame::{FrameError, FrameId, StaticFrame};
use crate::types::{TypeId, TypeTable};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::sync::Arc;
use strum::{EnumCount, EnumIter, EnumString, FromRepr, IntoStaticStr};

/// Built-in operations reachable through the uniform intrinsic call
/// convention. The discriminant is the stable registered id.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    EnumIter,
    EnumCount,
    EnumString,
    FromRepr,
    IntoStaticStr,
)]
#[repr(u16)]
#[strum(serialize_all = "snake_case")]
pub enum IntrinsicId {
    Print,
    Assert,
    ToString,
    ToPrettyString,
    Typeof,
    Update,
    Size,
    Find,
    Exists,
    Erase,
    GetKeys,
    PushBack,
    Subset,
    Replace,
    ParseJsonScript,
    GenerateJsonScript,
    ToJson,
    FromJson,
    GetJsonType,
    Map,
    Filter,
    Reduce,
    Send,
    Exit,
}

impl IntrinsicId {
    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn index(self) -> u16 {
        self as u16
    }

    pub fn from_index(index: u16) -> Option<IntrinsicId> {
        IntrinsicId::from_repr(index)
    }
}

/// A callable function identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum FunctionId {
    /// Index into [`Program::functions`].
    Defined(u32),
    Intrinsic(IntrinsicId),
}

/// One entry of the function table. A `None` frame means the body lives in
/// the host library under `linkage_name`.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionDef {
    pub name: String,
    pub linkage_name: String,
    /// Function signature type.
    pub signature: TypeId,
    pub frame: Option<Arc<StaticFrame>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessDecl {
    pub name: String,
    pub init: FunctionId,
    pub handler: FunctionId,
    pub state_type: TypeId,
    pub message_type: TypeId,
}

/// Process declarations of a container. Process 0 runs on the thread that
/// starts the program.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerDef {
    pub name: String,
    pub processes: Vec<ProcessDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TestId {
    pub module: String,
    pub name: String,
}

impl TestId {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestDef {
    pub id: TestId,
    pub function: FunctionId,
}

#[derive(Debug, Clone, Serialize)]
pub struct Program {
    pub globals: StaticFrame,
    pub functions: Vec<FunctionDef>,
    pub types: TypeTable,
    pub container: Option<ContainerDef>,
    pub tests: Vec<TestDef>,
}

impl Program {
    pub fn frame(&self, id: FrameId) -> Option<&StaticFrame> {
        match id {
            FrameId::Global => Some(&self.globals),
            FrameId::Function(i) => self.functions.get(i as usize)?.frame.as_deref(),
        }
    }

    pub fn function(&self, id: FunctionId) -> Option<&FunctionDef> {
        match id {
            FunctionId::Defined(i) => self.functions.get(i as usize),
            FunctionId::Intrinsic(_) => None,
        }
    }

    pub fn find_function(&self, name: &str) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FunctionId::Defined(i as u32))
    }

    pub fn global_index(&self, name: &str) -> Option<usize> {
        self.globals.find_symbol(name)
    }

    /// Validate every frame against its own symbol table and the globals.
    pub fn validate(&self) -> Result<(), FrameError> {
        let global_count = self.globals.symbols.len();
        self.globals.validate(global_count)?;
        for f in &self.functions {
            if let Some(frame) = &f.frame {
                frame.validate(global_count)?;
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Content hash of the serialized program.
    pub fn fingerprint(&self) -> String {
        format!("sha256:{:x}", Sha256::digest(self.to_json().to_string().as_bytes()))
    }

    pub fn disassemble(&self) -> String {
        let mut out = self.globals.disassemble();
        for (i, f) in self.functions.iter().enumerate() {
            match &f.frame {
                Some(frame) => {
                    let _ = writeln!(out, "\n; function #{} {}", i, self.types.name(f.signature));
                    out.push_str(&frame.disassemble());
                }
                None => {
                    let _ = writeln!(out, "\n; function #{} {} -> host `{}`", i, f.name, f.linkage_name);
                }
            }
        }
        out
    }
}
