//! The lodestone DocumentDB engine.
//!
//! One `DocumentDb` per served document type: a feed pipeline
//! serialized through a single master thread, a durable transaction log
//! with replay, a lifecycle state machine coordinating config snapshots
//! with in-flight operations, and a background maintenance scheduler
//! with frozen-bucket coordination.
//!
//! Layering, bottom up:
//! - `token`, `operation`: the feed vocabulary
//! - `write_service`: the named executor set
//! - `meta_store`, `sub_db`: per-sub-DB document bookkeeping
//! - `feed_handler`: ordering, log writes, rejection rules, replay
//! - `ddb_state`, `config`, `config_store`: lifecycle and configuration
//! - `maintenance`: background jobs
//! - `document_db`: the owner wiring it all together

#![warn(missing_docs)]

pub mod config;
pub mod config_store;
pub mod ddb_state;
pub mod document_db;
pub mod feed_handler;
pub mod feed_view;
pub mod maintenance;
pub mod meta_store;
pub mod operation;
pub mod resource_filter;
pub mod session;
pub mod status;
pub mod sub_db;
pub mod testing;
pub mod token;
pub mod write_service;

pub use config::{DocumentDbConfig, MaintenanceConfig, ReconfigParams};
pub use config_store::{ConfigStore, ConfigStoreError, FileConfigStore, MemoryConfigStore};
pub use ddb_state::{ConfigState, DdbState, State};
pub use document_db::{DocumentDb, DocumentDbError, DocumentDbParams, FeedViewFactory};
pub use feed_handler::{
    FeedHandler, FeedHandlerOwner, FeedState, ReplayConfigHandler, SharedTransLog, TlsWriter,
    TransLogWriter,
};
pub use feed_view::FeedView;
pub use maintenance::{BucketGuard, FrozenBuckets, JobOutcome, MaintenanceController, MaintenanceJob};
pub use meta_store::DocumentMetaStore;
pub use operation::{
    FeedOperation, MoveOperation, PrevInfo, PruneRemovedDocumentsOperation, PutOperation,
    RemoveOperation, UpdateOperation,
};
pub use resource_filter::{
    AcceptState, AttributeUsageFilter, ResourceLimitConfig, ResourceWriteFilter,
};
pub use session::SessionManager;
pub use status::{StatusReport, StatusState};
pub use sub_db::{SubDb, SubDbCollection};
pub use token::{FeedResult, FeedToken, FeedTokenTransport};
pub use write_service::{Executor, WriteService, WriteServiceConfig};
