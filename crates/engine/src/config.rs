//! Config snapshots and reconfiguration deltas.
//!
//! A config snapshot is an immutable bundle (schema, document type repo,
//! maintenance parameters, ranking profiles) carrying a monotone
//! generation. Two derived views matter during the lifecycle:
//!
//! - the *replay config* masks everything irrelevant to transaction-log
//!   replay, so two snapshots can be "equal for replay purposes" even
//!   when their generations differ;
//! - the *delayed-attribute-aspect config* keeps the active schema's
//!   shape for fields whose aspect change cannot be applied hot, and
//!   flags the database as needing a restart to finish the change.

use crate::resource_filter::ResourceLimitConfig;
use lodestone_core::{DocTypeName, DocumentTypeRepo, Schema};
#[cfg(test)]
use lodestone_core::FieldKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Maintenance knobs carried by the config snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Batching window between commit and search visibility, in ms.
    /// Zero means immediate commit.
    pub visibility_delay_ms: u64,
    /// Periodic tick driving maintenance jobs, in ms.
    pub job_interval_ms: u64,
    /// Sessions idle longer than this are pruned, in ms.
    pub session_max_age_ms: u64,
    /// Tombstones older than this are pruned, in ms.
    pub remove_doc_age_ms: u64,
    /// Lid-space compaction triggers above this unbound fraction.
    pub lid_bloat_limit: f64,
    /// Resource-write-filter limits.
    pub resource_limits: ResourceLimitConfig,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        MaintenanceConfig {
            visibility_delay_ms: 0,
            job_interval_ms: 1000,
            session_max_age_ms: 10_000,
            remove_doc_age_ms: 60_000,
            lid_bloat_limit: 0.5,
            resource_limits: ResourceLimitConfig::default(),
        }
    }
}

/// Immutable config snapshot for one DocumentDB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentDbConfig {
    /// Monotone config generation.
    pub generation: i64,
    /// The document type this database serves.
    pub doc_type_name: DocTypeName,
    /// Index/attribute field set.
    pub schema: Schema,
    /// Document type registry.
    pub repo: DocumentTypeRepo,
    /// Maintenance parameters.
    pub maintenance: MaintenanceConfig,
    /// Opaque ranking-profile payloads, irrelevant to replay.
    pub ranking_profiles: BTreeMap<String, String>,
    /// True when this snapshot has attribute-aspect changes masked out.
    pub delayed_attribute_aspects: bool,
}

impl DocumentDbConfig {
    /// Construct a snapshot.
    pub fn new(
        generation: i64,
        doc_type_name: DocTypeName,
        schema: Schema,
        repo: DocumentTypeRepo,
    ) -> Self {
        DocumentDbConfig {
            generation,
            doc_type_name,
            schema,
            repo,
            maintenance: MaintenanceConfig::default(),
            ranking_profiles: BTreeMap::new(),
            delayed_attribute_aspects: false,
        }
    }

    /// Same snapshot under a new generation.
    pub fn with_generation(&self, generation: i64) -> Self {
        let mut next = self.clone();
        next.generation = generation;
        next
    }

    /// Mask everything irrelevant during transaction-log replay.
    pub fn make_replay_config(config: &Arc<Self>) -> Arc<Self> {
        let mut replay = (**config).clone();
        replay.ranking_profiles.clear();
        replay.maintenance = MaintenanceConfig::default();
        replay.delayed_attribute_aspects = false;
        if replay == **config {
            Arc::clone(config)
        } else {
            Arc::new(replay)
        }
    }

    /// True when the two snapshots replay identically (generation aside).
    pub fn equal_for_replay(a: &Arc<Self>, b: &Arc<Self>) -> bool {
        let mut ra = (*Self::make_replay_config(a)).clone();
        let mut rb = (*Self::make_replay_config(b)).clone();
        ra.generation = 0;
        rb.generation = 0;
        ra == rb
    }

    /// Fields whose kind differs between the two schemas (both present).
    fn changed_aspect_fields(new: &Schema, active: &Schema) -> Vec<String> {
        new.fields()
            .filter_map(|(name, kind)| match active.field(name) {
                Some(active_kind) if active_kind != kind => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Produce the config actually applied while online: attribute-aspect
    /// changes to existing fields cannot be applied hot, so the active
    /// kinds are kept for those fields and the snapshot is flagged.
    pub fn make_delayed_attribute_aspect_config(
        new: &Arc<Self>,
        active: &Arc<Self>,
    ) -> Arc<Self> {
        let changed = Self::changed_aspect_fields(&new.schema, &active.schema);
        if changed.is_empty() {
            return Arc::clone(new);
        }
        let mut masked = (**new).clone();
        let mut schema = Schema::new();
        for (name, kind) in new.schema.fields() {
            let kind = if changed.contains(name) {
                active
                    .schema
                    .field(name)
                    .expect("changed fields exist in the active schema")
                    .clone()
            } else {
                kind.clone()
            };
            schema.add_field(name.clone(), kind);
        }
        masked.schema = schema;
        masked.delayed_attribute_aspects = true;
        Arc::new(masked)
    }

    /// Field-by-field delta against a newer snapshot.
    pub fn compare(&self, new: &DocumentDbConfig) -> ConfigComparisonResult {
        ConfigComparisonResult {
            schema_changed: self.schema != new.schema,
            repo_changed: self.repo != new.repo,
            maintenance_changed: self.maintenance != new.maintenance,
            ranking_changed: self.ranking_profiles != new.ranking_profiles,
            visibility_delay_changed: self.maintenance.visibility_delay_ms
                != new.maintenance.visibility_delay_ms,
        }
    }
}

/// What differs between two snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigComparisonResult {
    /// Index/attribute schema changed.
    pub schema_changed: bool,
    /// Document type repo changed.
    pub repo_changed: bool,
    /// Maintenance parameters changed.
    pub maintenance_changed: bool,
    /// Ranking profiles changed.
    pub ranking_changed: bool,
    /// Visibility delay changed.
    pub visibility_delay_changed: bool,
}

/// What a delta means for the subsystems.
#[derive(Debug, Clone, Copy)]
pub struct ReconfigParams {
    cmp: ConfigComparisonResult,
}

impl ReconfigParams {
    /// Wrap a comparison result.
    pub fn new(cmp: ConfigComparisonResult) -> Self {
        ReconfigParams { cmp }
    }

    /// Sub-DB views must be re-created.
    pub fn should_sub_dbs_change(&self) -> bool {
        self.cmp.schema_changed || self.cmp.repo_changed
    }

    /// The index manager needs the new schema.
    pub fn should_index_manager_change(&self) -> bool {
        self.cmp.schema_changed
    }

    /// Maintenance must be re-injected with the new parameters.
    pub fn should_maintenance_controller_change(&self) -> bool {
        self.cmp.maintenance_changed
    }

    /// The underlying delta.
    pub fn comparison(&self) -> &ConfigComparisonResult {
        &self.cmp
    }
}
