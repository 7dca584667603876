use crate::{error::GraphError, BlockNumber, Module, ModuleInput};
use std::collections::{BTreeSet, HashMap};

/// Validated, acyclic module dependency graph.
///
/// Modules are stored in a flat list and referenced by index. Topological order and the ancestor
/// set of every module are computed once at construction.
#[derive(Debug, Clone)]
pub struct ModuleGraph {
    modules: Vec<Module>,
    by_name: HashMap<String, usize>,
    parents: Vec<Vec<usize>>,
    /// Module indices in topological order, parents first.
    topo: Vec<usize>,
    /// Position of every module in `topo`.
    position: Vec<usize>,
    /// Ancestors of every module, in topological order.
    ancestors: Vec<Vec<usize>>,
}

impl ModuleGraph {
    /// Builds the graph, validating names, inputs and acyclicity.
    pub fn new(modules: Vec<Module>) -> Result<Self, GraphError> {
        let mut by_name = HashMap::with_capacity(modules.len());
        for (idx, module) in modules.iter().enumerate() {
            if by_name.insert(module.name.clone(), idx).is_some() {
                return Err(GraphError::DuplicateModule(module.name.clone()))
            }
        }

        let mut parents = Vec::with_capacity(modules.len());
        for module in &modules {
            let mut deps = Vec::new();
            for input in &module.inputs {
                let Some(name) = input.module_name() else { continue };
                let &idx = by_name.get(name).ok_or_else(|| GraphError::UnknownInput {
                    module: module.name.clone(),
                    input: name.to_string(),
                })?;
                if matches!(input, ModuleInput::Store { .. }) && !modules[idx].is_store() {
                    return Err(GraphError::NotAStore {
                        module: module.name.clone(),
                        input: name.to_string(),
                    })
                }
                if !deps.contains(&idx) {
                    deps.push(idx);
                }
            }
            parents.push(deps);
        }

        let topo = topological_sort(&modules, &parents)?;
        let mut position = vec![0; modules.len()];
        for (pos, &idx) in topo.iter().enumerate() {
            position[idx] = pos;
        }

        let mut ancestors: Vec<Vec<usize>> = vec![Vec::new(); modules.len()];
        for &idx in &topo {
            let mut set = BTreeSet::new();
            for &parent in &parents[idx] {
                set.insert(position[parent]);
                set.extend(ancestors[parent].iter().map(|&a| position[a]));
            }
            ancestors[idx] = set.into_iter().map(|pos| topo[pos]).collect();
        }

        Ok(Self { modules, by_name, parents, topo, position, ancestors })
    }

    fn index(&self, name: &str) -> Result<usize, GraphError> {
        self.by_name.get(name).copied().ok_or_else(|| GraphError::UnknownModule(name.to_string()))
    }

    /// Returns the module with the given name.
    pub fn module(&self, name: &str) -> Result<&Module, GraphError> {
        Ok(&self.modules[self.index(name)?])
    }

    /// Returns `true` if the graph contains `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// All modules in topological order.
    pub fn topological(&self) -> impl Iterator<Item = &Module> + '_ {
        self.topo.iter().map(|&idx| &self.modules[idx])
    }

    /// Direct dependencies of `name`.
    pub fn parents_of(&self, name: &str) -> Result<Vec<&Module>, GraphError> {
        let idx = self.index(name)?;
        Ok(self.parents[idx].iter().map(|&p| &self.modules[p]).collect())
    }

    /// Transitive dependencies of `name`, in topological order.
    pub fn ancestors_of(&self, name: &str) -> Result<Vec<&Module>, GraphError> {
        let idx = self.index(name)?;
        Ok(self.ancestors[idx].iter().map(|&a| &self.modules[a]).collect())
    }

    /// Transitive store dependencies of `name`, in topological order.
    pub fn ancestor_stores_of(&self, name: &str) -> Result<Vec<&Module>, GraphError> {
        Ok(self.ancestors_of(name)?.into_iter().filter(|m| m.is_store()).collect())
    }

    /// Ancestors of `name` followed by `name` itself.
    pub fn modules_down_to(&self, name: &str) -> Result<Vec<&Module>, GraphError> {
        let idx = self.index(name)?;
        let mut out = self.ancestors_of(name)?;
        out.push(&self.modules[idx]);
        Ok(out)
    }

    /// Stores required to run `name`, including `name` if it is itself a store.
    pub fn stores_down_to(&self, name: &str) -> Result<Vec<&Module>, GraphError> {
        Ok(self.modules_down_to(name)?.into_iter().filter(|m| m.is_store()).collect())
    }

    /// Stores that transitively depend on `name`, in topological order.
    pub fn descendant_stores_of(&self, name: &str) -> Result<Vec<&Module>, GraphError> {
        let idx = self.index(name)?;
        Ok(self
            .topo
            .iter()
            .filter(|&&other| self.ancestors[other].contains(&idx))
            .map(|&other| &self.modules[other])
            .filter(|m| m.is_store())
            .collect())
    }

    /// Lowest initial block among `name` and its ancestors.
    pub fn lowest_initial_block(&self, name: &str) -> Result<BlockNumber, GraphError> {
        Ok(self
            .modules_down_to(name)?
            .iter()
            .map(|m| m.initial_block)
            .min()
            .unwrap_or_default())
    }

    /// Returns `true` if `a` comes before `b` in topological order.
    pub fn precedes(&self, a: &str, b: &str) -> Result<bool, GraphError> {
        Ok(self.position[self.index(a)?] < self.position[self.index(b)?])
    }
}

/// Kahn's algorithm, breaking ties by declaration order.
fn topological_sort(modules: &[Module], parents: &[Vec<usize>]) -> Result<Vec<usize>, GraphError> {
    let mut in_degree: Vec<usize> = parents.iter().map(Vec::len).collect();
    let mut children = vec![Vec::new(); modules.len()];
    for (idx, deps) in parents.iter().enumerate() {
        for &dep in deps {
            children[dep].push(idx);
        }
    }

    let mut ready: BTreeSet<usize> =
        in_degree.iter().enumerate().filter(|(_, d)| **d == 0).map(|(idx, _)| idx).collect();
    let mut order = Vec::with_capacity(modules.len());
    while let Some(idx) = ready.pop_first() {
        order.push(idx);
        for &child in &children[idx] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                ready.insert(child);
            }
        }
    }

    if order.len() != modules.len() {
        let stuck = in_degree.iter().position(|&d| d > 0).unwrap_or_default();
        return Err(GraphError::Cycle(modules[stuck].name.clone()))
    }
    Ok(order)
}
