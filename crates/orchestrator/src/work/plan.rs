use super::{Job, JobKind, WorkUnit};
use crate::BackfillError;
use backfill_primitives::{BlockNumber, BlockRange, BlockRanges, ModuleGraph, Segmenter};
use backfill_storage::{ExecOutputCache, SnapshotsProber, StoreConfig};
use futures::future::try_join_all;
use std::collections::HashSet;
use tracing::{debug, info};

/// Cached output segments of the output map module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutUnit {
    /// Output module.
    pub module: String,
    /// Every segment of the exec-out range.
    pub segments: BlockRanges,
    /// Segments already cached.
    pub present: BlockRanges,
    /// Segments still to be produced.
    pub missing: BlockRanges,
}

/// Work of a request: one unit per store, plus the output cache segments in production mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkPlan {
    /// Store units, in topological order.
    pub stores: Vec<WorkUnit>,
    /// Output cache work, if outputs are read linearly.
    pub exec_out: Option<ExecOutUnit>,
}

impl WorkPlan {
    /// Probes storage and plans the work of every store up to `work_up_to`, and of the output
    /// cache segments of `exec_out`.
    pub async fn build(
        stores: &[StoreConfig],
        work_up_to: BlockNumber,
        store_interval: u64,
        exec_out: Option<(&ExecOutputCache, Segmenter)>,
        prober: &SnapshotsProber,
    ) -> Result<Self, BackfillError> {
        let units = try_join_all(stores.iter().map(|store| async move {
            let snapshots = store.list_snapshots(prober).await?;
            let unit = WorkUnit::build(
                store.name(),
                store.module_initial_block(),
                &snapshots,
                store_interval,
                work_up_to,
            )?;
            Ok::<_, BackfillError>(unit)
        }))
        .await?;

        let exec_out = match exec_out {
            Some((cache, segmenter)) => Some(ExecOutUnit::build(cache, segmenter).await?),
            None => None,
        };

        let plan = Self { stores: units, exec_out };
        plan.log_summary();
        Ok(plan)
    }

    /// Jobs of the plan, in dispatch order: stores with the most dependent stores first, then by
    /// module name and start block.
    pub fn jobs(&self, graph: &ModuleGraph, split_size: u64) -> Result<Vec<Job>, BackfillError> {
        let planned: HashSet<&str> = self.stores.iter().map(|unit| unit.module.as_str()).collect();
        let parents_of = |module: &str| -> Result<Vec<String>, BackfillError> {
            Ok(graph
                .ancestor_stores_of(module)?
                .into_iter()
                .filter(|store| planned.contains(store.name.as_str()))
                .map(|store| store.name.clone())
                .collect())
        };

        let mut jobs = Vec::new();
        for unit in &self.stores {
            let required_parents = parents_of(&unit.module)?;
            let priority = graph
                .descendant_stores_of(&unit.module)?
                .iter()
                .filter(|store| planned.contains(store.name.as_str()))
                .count();
            jobs.extend(unit.partials_missing.merged_by_bucket(split_size).into_iter().map(
                |range| Job {
                    module: unit.module.clone(),
                    kind: JobKind::Store,
                    range,
                    required_parents: required_parents.clone(),
                    priority,
                    attempt: 0,
                },
            ));
        }
        if let Some(exec_out) = &self.exec_out {
            let required_parents = parents_of(&exec_out.module)?;
            jobs.extend(exec_out.missing.merged_by_bucket(split_size).into_iter().map(|range| {
                Job {
                    module: exec_out.module.clone(),
                    kind: JobKind::ExecOut,
                    range,
                    required_parents: required_parents.clone(),
                    priority: 0,
                    attempt: 0,
                }
            }));
        }
        Ok(jobs)
    }

    /// Block each store has reached before any job runs.
    pub fn initial_progress(&self) -> impl Iterator<Item = (String, BlockNumber)> + '_ {
        self.stores.iter().map(|unit| (unit.module.clone(), unit.next_expected_start()))
    }

    fn log_summary(&self) {
        for unit in &self.stores {
            debug!(
                target: "backfill::planner",
                module = %unit.module,
                initial_complete = ?unit.initial_complete_range,
                present = %unit.partials_present,
                missing = %unit.partials_missing,
                "Planned store"
            );
        }
        info!(
            target: "backfill::planner",
            stores = self.stores.len(),
            missing_blocks = self.stores.iter().map(|unit| unit.partials_missing.total_size()).sum::<u64>(),
            exec_out_missing = self.exec_out.as_ref().map_or(0, |unit| unit.missing.len()),
            "Work plan ready"
        );
    }
}

impl ExecOutUnit {
    async fn build(cache: &ExecOutputCache, segmenter: Segmenter) -> Result<Self, BackfillError> {
        let present_ends: HashSet<BlockNumber> = cache
            .present_ends()
            .await
            .map_err(|source| BackfillError::Storage { module: cache.module().to_string(), source })?
            .into_iter()
            .collect();

        let mut unit = Self {
            module: cache.module().to_string(),
            segments: BlockRanges::new(),
            present: BlockRanges::new(),
            missing: BlockRanges::new(),
        };
        for segment in segmenter.iter() {
            unit.segments.push(segment);
            if present_ends.contains(&segment.end()) {
                unit.present.push(segment);
            } else {
                unit.missing.push(segment);
            }
        }
        Ok(unit)
    }

    /// Segments of `range`.
    pub fn segments_within(&self, range: BlockRange) -> impl Iterator<Item = BlockRange> + '_ {
        self.segments
            .iter()
            .copied()
            .filter(move |segment| segment.start() >= range.start() && segment.end() <= range.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backfill_primitives::{Module, ModuleHashes, UpdatePolicy, ValueType};
    use backfill_storage::{BlobStoreRef, MemoryBlobStore, OutputFile, StoreLimits};
    use std::{sync::Arc, time::Duration};

    fn r(start: u64, end: u64) -> BlockRange {
        BlockRange::new(start, end).unwrap()
    }

    fn unit(module: &str, missing: &str) -> WorkUnit {
        WorkUnit {
            module: module.to_string(),
            module_initial_block: 0,
            work_up_to: 0,
            initial_complete_range: None,
            partials_present: BlockRanges::new(),
            partials_missing: missing.parse().unwrap(),
        }
    }

    fn graph() -> ModuleGraph {
        ModuleGraph::new(vec![
            Module::map("map_a", 0),
            Module::store("store_a", 0, UpdatePolicy::Set, ValueType::String)
                .with_map_input("map_a"),
            Module::store("store_b", 0, UpdatePolicy::Set, ValueType::String)
                .with_store_input("store_a"),
            Module::map("map_out", 0).with_store_input("store_b"),
        ])
        .unwrap()
    }

    #[test]
    fn bucketed_jobs() {
        // ten contiguous segments of 100 blocks fit in one sub-request of 1000
        let missing: BlockRanges = (10..20).map(|i| r(i * 100, (i + 1) * 100)).collect();
        assert_eq!(missing.merged_by_bucket(1_000), BlockRanges::from(vec![r(1_000, 2_000)]));

        let plan = WorkPlan {
            stores: vec![WorkUnit { partials_missing: missing, ..unit("store_a", "") }],
            exec_out: None,
        };
        let jobs = plan.jobs(&graph(), 1_000).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].range, r(1_000, 2_000));
    }

    #[test]
    fn jobs_carry_parents_and_priority() {
        let plan = WorkPlan {
            stores: vec![unit("store_a", "0-10,10-20"), unit("store_b", "0-10,10-20")],
            exec_out: Some(ExecOutUnit {
                module: "map_out".into(),
                segments: "0-10,10-20".parse().unwrap(),
                present: "0-10".parse().unwrap(),
                missing: "10-20".parse().unwrap(),
            }),
        };
        let jobs = plan.jobs(&graph(), 10).unwrap();
        assert_eq!(jobs.len(), 5);

        let store_a: Vec<_> = jobs.iter().filter(|j| j.module == "store_a").collect();
        assert!(store_a.iter().all(|j| j.priority == 1 && j.required_parents.is_empty()));

        let store_b: Vec<_> = jobs.iter().filter(|j| j.module == "store_b").collect();
        assert!(store_b.iter().all(|j| j.priority == 0 && j.required_parents == ["store_a"]));

        let out = jobs.iter().find(|j| j.kind == JobKind::ExecOut).unwrap();
        assert_eq!(out.range, r(10, 20));
        assert_eq!(out.required_parents, vec!["store_a".to_string(), "store_b".to_string()]);
    }

    #[tokio::test]
    async fn build_probes_storage() {
        let graph = graph();
        let hashes = ModuleHashes::new(&graph);
        let base: BlobStoreRef = Arc::new(MemoryBlobStore::new());
        let stores: Vec<_> = ["store_a", "store_b"]
            .into_iter()
            .map(|name| {
                StoreConfig::new(
                    name,
                    hashes.get(name).unwrap(),
                    0,
                    UpdatePolicy::Set,
                    ValueType::String,
                    StoreLimits::default(),
                    &base,
                )
            })
            .collect();
        stores[0].new_full_kv().save(20).await.unwrap();
        stores[1].new_partial_kv(10).save(20).await.unwrap();

        let cache = ExecOutputCache::new("map_out", hashes.get("map_out").unwrap(), &base);
        cache.save(&OutputFile::new(r(10, 20))).await.unwrap();

        let prober = SnapshotsProber::new(1, Duration::from_millis(1));
        let plan =
            WorkPlan::build(&stores, 30, 10, Some((&cache, Segmenter::new(10, 0, 30))), &prober)
                .await
                .unwrap();

        assert_eq!(plan.stores[0].initial_complete_range, Some(r(0, 20)));
        assert_eq!(plan.stores[0].partials_missing, "20-30".parse().unwrap());
        assert_eq!(plan.stores[1].partials_present, "10-20".parse().unwrap());
        assert_eq!(plan.stores[1].partials_missing, "0-10,20-30".parse().unwrap());
        assert_eq!(
            plan.initial_progress().collect::<Vec<_>>(),
            vec![("store_a".to_string(), 20), ("store_b".to_string(), 0)]
        );

        let exec_out = plan.exec_out.unwrap();
        assert_eq!(exec_out.present, "10-20".parse().unwrap());
        assert_eq!(exec_out.missing, "0-10,20-30".parse().unwrap());
        assert_eq!(exec_out.segments_within(r(0, 20)).count(), 2);
    }
}
