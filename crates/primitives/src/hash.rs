use crate::{GraphError, ModuleGraph, ModuleInput, ModuleKind, StoreMode};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, fmt};

/// Content hash of a module and, recursively, of everything it depends on.
///
/// Every persisted artifact of a module lives under the hex form of this hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHash([u8; 32]);

impl ModuleHash {
    /// Raw hash bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form, used as a storage prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ModuleHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ModuleHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleHash({})", self.to_hex())
    }
}

/// Hashes of every module of a [`ModuleGraph`], computed once in topological order.
#[derive(Debug, Clone, Default)]
pub struct ModuleHashes {
    hashes: HashMap<String, ModuleHash>,
}

impl ModuleHashes {
    /// Hashes all modules of `graph`.
    pub fn new(graph: &ModuleGraph) -> Self {
        let mut hashes: HashMap<String, ModuleHash> = HashMap::new();
        for module in graph.topological() {
            let mut hasher = Sha256::new();
            hasher.update(b"name");
            hasher.update(module.name.as_bytes());
            hasher.update(b"initial_block");
            hasher.update(module.initial_block.to_le_bytes());

            match &module.kind {
                ModuleKind::Map { output_type } => {
                    hasher.update(b"kind_map");
                    hasher.update(output_type.as_bytes());
                }
                ModuleKind::Store { update_policy, value_type } => {
                    hasher.update(b"kind_store");
                    hasher.update(update_policy.as_str());
                    hasher.update(value_type.as_str());
                }
            }

            for input in &module.inputs {
                match input {
                    ModuleInput::Source { type_url } => {
                        hasher.update(b"source");
                        hasher.update(type_url.as_bytes());
                    }
                    ModuleInput::Params { value } => {
                        hasher.update(b"params");
                        hasher.update(value.as_bytes());
                    }
                    ModuleInput::Map { name } => {
                        hasher.update(b"map");
                        hasher.update(name.as_bytes());
                    }
                    ModuleInput::Store { name, mode } => {
                        hasher.update(b"store");
                        hasher.update(name.as_bytes());
                        hasher.update(match mode {
                            StoreMode::Get => b"get".as_slice(),
                            StoreMode::Deltas => b"deltas".as_slice(),
                        });
                    }
                }
                // inputs always precede their consumers in topological order
                if let Some(parent) = input.module_name().and_then(|name| hashes.get(name)) {
                    hasher.update(parent.as_bytes());
                }
            }

            hashes.insert(module.name.clone(), ModuleHash(hasher.finalize().into()));
        }
        Self { hashes }
    }

    /// Returns the hash of `name`.
    pub fn get(&self, name: &str) -> Result<ModuleHash, GraphError> {
        self.hashes.get(name).copied().ok_or_else(|| GraphError::UnknownModule(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Module, UpdatePolicy, ValueType};

    fn graph(store_policy: UpdatePolicy) -> ModuleGraph {
        ModuleGraph::new(vec![
            Module::map("map_a", 0),
            Module::store("store_b", 0, store_policy, ValueType::Int64).with_map_input("map_a"),
            Module::map("map_c", 0).with_store_input("store_b"),
            Module::map("map_x", 0).with_map_input("map_a"),
        ])
        .unwrap()
    }

    #[test]
    fn hashes_are_stable() {
        let first = ModuleHashes::new(&graph(UpdatePolicy::Add));
        let second = ModuleHashes::new(&graph(UpdatePolicy::Add));
        for name in ["map_a", "store_b", "map_c", "map_x"] {
            assert_eq!(first.get(name).unwrap(), second.get(name).unwrap());
        }
        assert_eq!(first.get("map_a").unwrap().to_hex().len(), 64);
    }

    #[test]
    fn changes_propagate_to_dependents_only() {
        let add = ModuleHashes::new(&graph(UpdatePolicy::Add));
        let max = ModuleHashes::new(&graph(UpdatePolicy::Max));
        assert_eq!(add.get("map_a").unwrap(), max.get("map_a").unwrap());
        assert_eq!(add.get("map_x").unwrap(), max.get("map_x").unwrap());
        assert_ne!(add.get("store_b").unwrap(), max.get("store_b").unwrap());
        assert_ne!(add.get("map_c").unwrap(), max.get("map_c").unwrap());
    }
}
