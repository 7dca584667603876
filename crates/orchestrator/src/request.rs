//! Backfill requests and their resolution against the module graph.

use crate::BackfillError;
use backfill_primitives::{
    boundary_at_or_below, BlockNumber, BlockRange, ModuleGraph, ModuleKind, Segmenter,
};
use std::sync::Arc;

/// A request to serve `[start_block, stop_block)` of an output module.
#[derive(Debug, Clone)]
pub struct Request {
    /// First block to serve. Negative values are rejected.
    pub start_block: i64,
    /// Exclusive last block, `0` for no stop.
    pub stop_block: u64,
    /// Whether only final blocks are streamed.
    pub final_blocks_only: bool,
    /// Module graph.
    pub modules: Arc<ModuleGraph>,
    /// Module whose outputs are streamed.
    pub output_module: String,
    /// Production mode caches map outputs; development mode only builds stores.
    pub production_mode: bool,
    /// Stores whose state at the handoff block is sent to the caller.
    pub debug_initial_snapshot_modules: Vec<String>,
}

impl Request {
    /// Creates a request for `output_module` starting at block zero, without stop.
    pub fn new(modules: Arc<ModuleGraph>, output_module: impl Into<String>) -> Self {
        Self {
            start_block: 0,
            stop_block: 0,
            final_blocks_only: true,
            modules,
            output_module: output_module.into(),
            production_mode: false,
            debug_initial_snapshot_modules: Vec::new(),
        }
    }

    /// Sets the block range.
    pub const fn with_range(mut self, start_block: i64, stop_block: u64) -> Self {
        self.start_block = start_block;
        self.stop_block = stop_block;
        self
    }

    /// Enables production mode.
    pub const fn with_production_mode(mut self) -> Self {
        self.production_mode = true;
        self
    }

    /// Requests a debug snapshot of `module`.
    pub fn with_debug_snapshot(mut self, module: impl Into<String>) -> Self {
        self.debug_initial_snapshot_modules.push(module.into());
        self
    }
}

/// A validated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDetails {
    /// Identifier of the request in logs and responses.
    pub trace_id: String,
    /// Output module.
    pub output_module: String,
    /// Whether the output module is a map.
    pub output_is_map: bool,
    /// First block streamed.
    pub resolved_start_block: BlockNumber,
    /// Exclusive stop, if any.
    pub stop_block: Option<BlockNumber>,
    /// Exclusive end of the parallel region.
    pub linear_handoff_block: BlockNumber,
    /// Lowest initial block of the output module and its ancestors.
    pub graph_initial_block: BlockNumber,
    /// Production mode.
    pub production_mode: bool,
    /// Stores whose final state is sent to the caller.
    pub debug_initial_snapshot_modules: Vec<String>,
}

impl RequestDetails {
    /// Validates `request` and computes its linear handoff block.
    ///
    /// `recent_final_block` is the latest irreversible block known to the caller, and
    /// `segment_interval` the store snapshot interval.
    pub fn resolve(
        request: &Request,
        recent_final_block: BlockNumber,
        segment_interval: u64,
    ) -> Result<Self, BackfillError> {
        if segment_interval == 0 {
            return Err(BackfillError::InvalidRequest("segment interval must be positive".into()))
        }
        let start_block = u64::try_from(request.start_block).map_err(|_| {
            BackfillError::InvalidRequest(format!(
                "negative start block {} is not supported",
                request.start_block
            ))
        })?;
        let stop_block = (request.stop_block != 0).then_some(request.stop_block);
        if stop_block.is_some_and(|stop| stop < start_block) {
            return Err(BackfillError::InvalidRequest(format!(
                "stop block {} is below start block {start_block}",
                request.stop_block
            )))
        }

        let graph = &request.modules;
        let output = graph.module(&request.output_module).map_err(|_| {
            BackfillError::InvalidRequest(format!(
                "output module {} is not in the graph",
                request.output_module
            ))
        })?;
        for name in &request.debug_initial_snapshot_modules {
            if !graph.module(name).is_ok_and(|module| module.is_store()) {
                return Err(BackfillError::InvalidRequest(format!(
                    "debug snapshot module {name} is not a store of the graph"
                )))
            }
        }

        let resolved_start_block = start_block.max(output.initial_block);
        let graph_initial_block = graph.lowest_initial_block(&request.output_module)?;
        // highest initial block of the required stores starting below the resolved start
        let state_required_at = graph
            .stores_down_to(&request.output_module)?
            .iter()
            .map(|store| store.initial_block)
            .filter(|initial| *initial < resolved_start_block)
            .max();

        let final_boundary = boundary_at_or_below(recent_final_block, segment_interval);
        let linear_handoff_block = if request.production_mode {
            match stop_block {
                Some(stop) if stop <= recent_final_block => {
                    round_up(stop, segment_interval).max(resolved_start_block)
                }
                _ if state_required_at.is_none() && resolved_start_block > final_boundary => {
                    resolved_start_block
                }
                _ => final_boundary,
            }
        } else {
            match state_required_at {
                None => resolved_start_block,
                Some(required_at) => boundary_at_or_below(resolved_start_block, segment_interval)
                    .max(required_at)
                    .min(final_boundary),
            }
        };

        Ok(Self {
            trace_id: uuid::Uuid::new_v4().simple().to_string(),
            output_module: request.output_module.clone(),
            output_is_map: matches!(output.kind, ModuleKind::Map { .. }),
            resolved_start_block,
            stop_block,
            linear_handoff_block,
            graph_initial_block,
            production_mode: request.production_mode,
            debug_initial_snapshot_modules: request.debug_initial_snapshot_modules.clone(),
        })
    }

    /// Returns `true` if cached map outputs are streamed before the handoff.
    pub const fn linear_reader_active(&self) -> bool {
        self.production_mode &&
            self.output_is_map &&
            self.resolved_start_block < self.linear_handoff_block
    }
}

const fn round_up(block: BlockNumber, interval: u64) -> BlockNumber {
    match block % interval {
        0 => block,
        rem => block - rem + interval,
    }
}

/// What the parallel processor has to produce for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPlan {
    /// Range over which stores are built, `None` if no store work is needed.
    pub build_stores: Option<BlockRange>,
    /// Range over which the output map module caches its outputs.
    pub write_exec_out: Option<BlockRange>,
    /// Range streamed by the linear output reader.
    pub read_exec_out: Option<BlockRange>,
    /// Segment size of the output cache.
    pub exec_out_interval: u64,
}

impl RequestPlan {
    /// Lays out the work of `details`.
    pub fn new(details: &RequestDetails, exec_out_interval: u64) -> Self {
        let handoff = details.linear_handoff_block;
        let build_stores = BlockRange::new(details.graph_initial_block, handoff);

        let (write_exec_out, read_exec_out) = if details.linear_reader_active() {
            let start = details.resolved_start_block.max(details.graph_initial_block);
            let segment_start = boundary_at_or_below(start, exec_out_interval);
            (
                BlockRange::new(segment_start, handoff),
                BlockRange::new(details.resolved_start_block, handoff),
            )
        } else {
            (None, None)
        };

        Self { build_stores, write_exec_out, read_exec_out, exec_out_interval }
    }

    /// Segmenter of the output cache over the exec-out range.
    pub fn exec_out_segmenter(&self) -> Option<Segmenter> {
        self.write_exec_out
            .map(|range| Segmenter::new(self.exec_out_interval, range.start(), range.end()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use backfill_primitives::{Module, UpdatePolicy, ValueType};

    fn graph() -> Arc<ModuleGraph> {
        Arc::new(
            ModuleGraph::new(vec![
                Module::map("map_transfers", 100),
                Module::store("store_balances", 100, UpdatePolicy::Add, ValueType::BigInt)
                    .with_map_input("map_transfers"),
                Module::map("map_output", 100)
                    .with_map_input("map_transfers")
                    .with_store_input("store_balances"),
                Module::map("map_standalone", 50),
            ])
            .unwrap(),
        )
    }

    #[test]
    fn rejects_invalid_requests() {
        let request = Request::new(graph(), "map_output").with_range(-1, 0);
        assert_matches!(
            RequestDetails::resolve(&request, 10_000, 100),
            Err(BackfillError::InvalidRequest(_))
        );

        let request = Request::new(graph(), "map_output").with_range(500, 400);
        assert_matches!(
            RequestDetails::resolve(&request, 10_000, 100),
            Err(BackfillError::InvalidRequest(_))
        );

        let request = Request::new(graph(), "unknown");
        assert_matches!(
            RequestDetails::resolve(&request, 10_000, 100),
            Err(BackfillError::InvalidRequest(_))
        );

        let request = Request::new(graph(), "map_output").with_debug_snapshot("map_transfers");
        assert_matches!(
            RequestDetails::resolve(&request, 10_000, 100),
            Err(BackfillError::InvalidRequest(_))
        );
    }

    #[test]
    fn production_handoff() {
        // stop below the final block rounds up to the next boundary
        let request =
            Request::new(graph(), "map_output").with_range(150, 1_250).with_production_mode();
        let details = RequestDetails::resolve(&request, 10_000, 100).unwrap();
        assert_eq!(details.stop_block, Some(1_250));
        assert_eq!(details.linear_handoff_block, 1_300);
        assert!(details.linear_reader_active());

        // no stop hands off at the final boundary
        let request = Request::new(graph(), "map_output").with_range(150, 0).with_production_mode();
        let details = RequestDetails::resolve(&request, 10_050, 100).unwrap();
        assert_eq!(details.stop_block, None);
        assert_eq!(details.linear_handoff_block, 10_000);

        // stateless request above the final block starts linearly
        let request =
            Request::new(graph(), "map_standalone").with_range(20_000, 0).with_production_mode();
        let details = RequestDetails::resolve(&request, 10_050, 100).unwrap();
        assert_eq!(details.linear_handoff_block, 20_000);
        assert!(!details.linear_reader_active());
    }

    #[test]
    fn development_handoff() {
        // start below every store: no state to build
        let request = Request::new(graph(), "map_output").with_range(0, 0);
        let details = RequestDetails::resolve(&request, 10_000, 100).unwrap();
        assert_eq!(details.resolved_start_block, 100);
        assert_eq!(details.linear_handoff_block, 100);

        let request = Request::new(graph(), "map_output").with_range(1_250, 0);
        let details = RequestDetails::resolve(&request, 10_000, 100).unwrap();
        assert_eq!(details.linear_handoff_block, 1_200);
        assert!(!details.linear_reader_active());

        // capped by the final boundary
        let request = Request::new(graph(), "map_output").with_range(1_250, 0);
        let details = RequestDetails::resolve(&request, 750, 100).unwrap();
        assert_eq!(details.linear_handoff_block, 700);
    }

    #[test]
    fn development_handoff_at_store_initial_block() {
        let graph = Arc::new(
            ModuleGraph::new(vec![
                Module::store("late", 105, UpdatePolicy::Set, ValueType::String),
                Module::map("map_late", 0).with_store_input("late"),
            ])
            .unwrap(),
        );

        // a store starting at the request start holds no state yet
        let request = Request::new(graph.clone(), "map_late").with_range(105, 0);
        let details = RequestDetails::resolve(&request, 10_000, 100).unwrap();
        assert_eq!(details.linear_handoff_block, 105);

        // a store starting above the previous boundary moves the handoff up to it
        let request = Request::new(graph.clone(), "map_late").with_range(150, 0);
        let details = RequestDetails::resolve(&request, 10_000, 100).unwrap();
        assert_eq!(details.linear_handoff_block, 105);

        // never above the final boundary
        let request = Request::new(graph, "map_late").with_range(150, 0);
        let details = RequestDetails::resolve(&request, 120, 100).unwrap();
        assert_eq!(details.linear_handoff_block, 100);
    }

    #[test]
    fn plan_layout() {
        let request =
            Request::new(graph(), "map_output").with_range(150, 1_250).with_production_mode();
        let details = RequestDetails::resolve(&request, 10_000, 100).unwrap();
        let plan = RequestPlan::new(&details, 100);
        assert_eq!(plan.build_stores, BlockRange::new(100, 1_300));
        assert_eq!(plan.write_exec_out, BlockRange::new(100, 1_300));
        assert_eq!(plan.read_exec_out, BlockRange::new(150, 1_300));
        assert_eq!(plan.exec_out_segmenter().unwrap().count(), 13);

        let request = Request::new(graph(), "map_output").with_range(1_250, 0);
        let details = RequestDetails::resolve(&request, 10_000, 100).unwrap();
        let plan = RequestPlan::new(&details, 100);
        assert_eq!(plan.build_stores, BlockRange::new(100, 1_200));
        assert_eq!(plan.write_exec_out, None);
        assert_eq!(plan.read_exec_out, None);
    }
}
