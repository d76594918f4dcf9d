//! In-memory [`ChangesetSource`] for tests: records every operation and can
//! be primed with failures, so reconciler and rewirer scenarios run without
//! a code host.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use armada_core::{ChangesetEvent, Error, ExternalState, Result};

use crate::{ChangesetSource, SourceChangeset};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeOp {
    Load,
    Create,
    CreateDraft,
    Update,
    Close,
    Reopen,
    Undraft,
    Comment,
    Merge,
    LoadEvents,
}

#[derive(Debug, Clone, Default)]
pub struct FakeChangesetSource {
    ops: Arc<Mutex<Vec<FakeOp>>>,
    /// Errors popped one per operation before the operation runs.
    queued_errors: Arc<Mutex<VecDeque<(u16, String)>>>,
    /// When set, the next create reports the changeset as already existing.
    already_exists: Arc<Mutex<bool>>,
    next_number: Arc<Mutex<i64>>,
}

impl FakeChangesetSource {
    pub fn new() -> Self {
        Self {
            next_number: Arc::new(Mutex::new(1)),
            ..Default::default()
        }
    }

    pub fn ops(&self) -> Vec<FakeOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn queue_error(&self, status: u16, message: &str) {
        self.queued_errors
            .lock()
            .unwrap()
            .push_back((status, message.to_string()));
    }

    pub fn set_already_exists(&self) {
        *self.already_exists.lock().unwrap() = true;
    }

    fn record(&self, op: FakeOp) -> Result<()> {
        self.ops.lock().unwrap().push(op);
        if let Some((status, message)) = self.queued_errors.lock().unwrap().pop_front() {
            return Err(Error::CodeHostStatus { status, message });
        }
        Ok(())
    }

    fn publish(&self, cs: &mut SourceChangeset<'_>, state: ExternalState) {
        let number = {
            let mut n = self.next_number.lock().unwrap();
            let number = *n;
            *n += 1;
            number
        };
        let branch = cs.head_branch().to_string();
        let changeset = &mut *cs.changeset;
        if changeset.external_id.is_empty() {
            changeset.external_id = number.to_string();
        }
        changeset.external_branch = branch;
        changeset.external_state = Some(state);
        changeset.external_created_at = Some(Utc::now());
        changeset.external_updated_at = Some(Utc::now());
    }
}

#[async_trait]
impl ChangesetSource for FakeChangesetSource {
    async fn load_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()> {
        self.record(FakeOp::Load)?;
        cs.changeset.external_updated_at = Some(Utc::now());
        if cs.changeset.external_state.is_none() {
            cs.changeset.external_state = Some(ExternalState::Open);
        }
        Ok(())
    }

    async fn create_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<bool> {
        self.record(FakeOp::Create)?;
        self.publish(cs, ExternalState::Open);
        Ok(std::mem::take(&mut *self.already_exists.lock().unwrap()))
    }

    async fn create_draft_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<bool> {
        self.record(FakeOp::CreateDraft)?;
        self.publish(cs, ExternalState::Draft);
        Ok(std::mem::take(&mut *self.already_exists.lock().unwrap()))
    }

    async fn update_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()> {
        self.record(FakeOp::Update)?;
        cs.changeset.external_updated_at = Some(Utc::now());
        Ok(())
    }

    async fn close_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()> {
        self.record(FakeOp::Close)?;
        if !matches!(cs.changeset.external_state, Some(ExternalState::Merged)) {
            cs.changeset.external_state = Some(ExternalState::Closed);
        }
        Ok(())
    }

    async fn reopen_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()> {
        self.record(FakeOp::Reopen)?;
        cs.changeset.external_state = Some(ExternalState::Open);
        Ok(())
    }

    async fn undraft_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()> {
        self.record(FakeOp::Undraft)?;
        cs.changeset.external_state = Some(ExternalState::Open);
        Ok(())
    }

    async fn create_comment(&self, _cs: &mut SourceChangeset<'_>, _body: &str) -> Result<()> {
        self.record(FakeOp::Comment)
    }

    async fn merge_changeset(&self, cs: &mut SourceChangeset<'_>, _squash: bool) -> Result<()> {
        self.record(FakeOp::Merge)?;
        cs.changeset.external_state = Some(ExternalState::Merged);
        Ok(())
    }

    async fn load_events(&self, _cs: &mut SourceChangeset<'_>) -> Result<Vec<ChangesetEvent>> {
        self.record(FakeOp::LoadEvents)?;
        Ok(Vec::new())
    }
}
