//! The write-path sink contract.
//!
//! A feed view is the set of sinks (index, attribute, summary) for one
//! active config. The feed handler prepares document operations against
//! the view (filling previous-version info from the meta store), then
//! dispatches handlers carrying serial numbers. Client-originated
//! operations also carry a token; replayed operations do not.
//!
//! The concrete index machinery is an external collaborator; this crate
//! only specifies the contract and dispatches into it.

use crate::operation::{
    MoveOperation, PruneRemovedDocumentsOperation, PutOperation, RemoveOperation, UpdateOperation,
};
use crate::token::FeedToken;
use lodestone_core::{DocumentTypeRepo, SerialNum};
use std::sync::Arc;

/// Write-path sinks for one active config.
pub trait FeedView: Send + Sync {
    /// The document type repo this view was built against.
    fn document_type_repo(&self) -> Arc<DocumentTypeRepo>;

    /// Fill previous-version info for a put.
    fn prepare_put(&self, op: &mut PutOperation);

    /// Fill previous-version info for an update.
    fn prepare_update(&self, op: &mut UpdateOperation);

    /// Fill previous-version info for a remove. Default: nothing known.
    fn prepare_remove(&self, op: &mut RemoveOperation) {
        let _ = op;
    }

    /// Fill target info for a move. Default: nothing to do.
    fn prepare_move(&self, op: &mut MoveOperation) {
        let _ = op;
    }

    /// Apply a put. `token` is absent during replay and for internally
    /// generated operations.
    fn handle_put(&self, token: Option<&FeedToken>, op: &PutOperation);

    /// Apply an update.
    fn handle_update(&self, token: Option<&FeedToken>, op: &UpdateOperation);

    /// Apply a remove.
    fn handle_remove(&self, token: Option<&FeedToken>, op: &RemoveOperation);

    /// Apply a sub-DB move.
    fn handle_move(&self, op: &MoveOperation);

    /// Drop a batch of tombstone lids.
    fn handle_prune_removed_documents(&self, op: &PruneRemovedDocumentsOperation);

    /// Advance the commit horizon while idle.
    fn heart_beat(&self, serial: SerialNum);

    /// Make everything up to `serial` visible to search.
    fn force_commit(&self, serial: SerialNum);
}
