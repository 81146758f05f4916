//! Interpreter limits and switches.

use serde::Deserialize;

pub const DEFAULT_MAX_CALL_DEPTH: usize = 1000;
pub const DEFAULT_STACK_RESERVE: usize = 1024;

/// VM configuration. Every field is optional in TOML and falls back to
/// [`VmConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Nested call limit before `StackOverflow`.
    pub max_call_depth: usize,
    /// Total instruction budget for one interpreter, unlimited when `None`.
    pub instruction_limit: Option<u64>,
    /// Also write `print` output to stdout.
    pub echo_print: bool,
    /// Initial register stack capacity, in slots.
    pub stack_reserve: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            instruction_limit: None,
            echo_print: false,
            stack_reserve: DEFAULT_STACK_RESERVE,
        }
    }
}

impl VmConfig {
    /// Parse from a TOML document. A `[vm]` table is used when present,
    /// otherwise the top level is read.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        let table: toml::Table = toml::from_str(s)?;
        match table.get("vm") {
            Some(vm) => vm.clone().try_into(),
            None => toml::Value::Table(table).try_into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = VmConfig::default();
        assert_eq!(cfg.max_call_depth, 1000);
        assert_eq!(cfg.instruction_limit, None);
        assert!(!cfg.echo_print);
    }

    #[test]
    fn parse_vm_table() {
        let cfg = VmConfig::from_toml_str(
            r#"
[vm]
max_call_depth = 64
instruction_limit = 10000
"#,
        )
        .unwrap();
        assert_eq!(cfg.max_call_depth, 64);
        assert_eq!(cfg.instruction_limit, Some(10000));
        assert_eq!(cfg.stack_reserve, DEFAULT_STACK_RESERVE);
    }

    #[test]
    fn parse_top_level() {
        let cfg = VmConfig::from_toml_str("echo_print = true\n").unwrap();
        assert!(cfg.echo_print);
        assert_eq!(cfg.max_call_depth, DEFAULT_MAX_CALL_DEPTH);
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(VmConfig::from_toml_str("").unwrap(), VmConfig::default());
    }

    #[test]
    fn bad_value_is_an_error() {
        assert!(VmConfig::from_toml_str("max_call_depth = \"deep\"\n").is_err());
    }
}
