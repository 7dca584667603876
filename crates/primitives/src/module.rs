use crate::BlockNumber;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a store combines a newly written value with the one already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Last write wins.
    Set,
    /// First write wins.
    SetIfNotExists,
    /// Byte concatenation.
    Append,
    /// Numeric sum.
    Add,
    /// Keeps the smallest value.
    Min,
    /// Keeps the largest value.
    Max,
}

impl UpdatePolicy {
    /// Returns the policy name used in module hashes and log fields.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::SetIfNotExists => "set_if_not_exists",
            Self::Append => "append",
            Self::Add => "add",
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type of the values held by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// Signed 64 bit integer, stored as decimal text.
    Int64,
    /// 64 bit float, stored as decimal text.
    Float64,
    /// Arbitrary precision integer, stored as decimal text.
    BigInt,
    /// Arbitrary precision decimal, stored as decimal text.
    BigDecimal,
    /// UTF-8 text.
    String,
    /// Raw bytes.
    Bytes,
    /// An encoded protobuf message.
    Proto,
}

impl ValueType {
    /// Returns `true` for the types [`UpdatePolicy::Add`], `Min` and `Max` operate on.
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Int64 | Self::Float64 | Self::BigInt | Self::BigDecimal)
    }

    /// Returns the type name used in module hashes and log fields.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::BigInt => "bigint",
            Self::BigDecimal => "bigdecimal",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::Proto => "proto",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a module emits per-block payloads or accumulates keyed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleKind {
    /// Emits one payload per block.
    Map {
        /// Type url of the emitted payload.
        output_type: String,
    },
    /// Accumulates keyed state across blocks.
    Store {
        /// Merge policy.
        update_policy: UpdatePolicy,
        /// Declared value type.
        value_type: ValueType,
    },
}

/// How a store input is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreMode {
    /// Read access to the accumulated state.
    Get,
    /// The per-block deltas of the store.
    Deltas,
}

/// A single module input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleInput {
    /// Raw chain data, such as blocks or clocks.
    Source {
        /// Source type url.
        type_url: String,
    },
    /// Output of a map module.
    Map {
        /// Input module name.
        name: String,
    },
    /// State or deltas of a store module.
    Store {
        /// Input module name.
        name: String,
        /// Access mode.
        mode: StoreMode,
    },
    /// Static parameters.
    Params {
        /// Parameter value.
        value: String,
    },
}

impl ModuleInput {
    /// Name of the module this input depends on, if any.
    pub fn module_name(&self) -> Option<&str> {
        match self {
            Self::Map { name } | Self::Store { name, .. } => Some(name),
            Self::Source { .. } | Self::Params { .. } => None,
        }
    }
}

/// A user module of the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    /// Unique module name.
    pub name: String,
    /// Map or store.
    pub kind: ModuleKind,
    /// First block at which the module is defined.
    pub initial_block: BlockNumber,
    /// Ordered module inputs.
    pub inputs: Vec<ModuleInput>,
}

impl Module {
    /// Creates a map module.
    pub fn map(name: impl Into<String>, initial_block: BlockNumber) -> Self {
        Self {
            name: name.into(),
            kind: ModuleKind::Map { output_type: String::new() },
            initial_block,
            inputs: Vec::new(),
        }
    }

    /// Creates a store module.
    pub fn store(
        name: impl Into<String>,
        initial_block: BlockNumber,
        update_policy: UpdatePolicy,
        value_type: ValueType,
    ) -> Self {
        Self {
            name: name.into(),
            kind: ModuleKind::Store { update_policy, value_type },
            initial_block,
            inputs: Vec::new(),
        }
    }

    /// Adds an input.
    pub fn with_input(mut self, input: ModuleInput) -> Self {
        self.inputs.push(input);
        self
    }

    /// Adds a map input.
    pub fn with_map_input(self, name: impl Into<String>) -> Self {
        self.with_input(ModuleInput::Map { name: name.into() })
    }

    /// Adds a store input read in [`StoreMode::Get`] mode.
    pub fn with_store_input(self, name: impl Into<String>) -> Self {
        self.with_input(ModuleInput::Store { name: name.into(), mode: StoreMode::Get })
    }

    /// Sets the type url emitted by a map module. No-op on stores.
    pub fn with_output_type(mut self, type_url: impl Into<String>) -> Self {
        if let ModuleKind::Map { output_type } = &mut self.kind {
            *output_type = type_url.into();
        }
        self
    }

    /// Returns `true` if this module is a store.
    pub const fn is_store(&self) -> bool {
        matches!(self.kind, ModuleKind::Store { .. })
    }
}
