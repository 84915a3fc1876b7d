//! Multi-entity transactions.
//!
//! A transaction stages mutations against the shared entity and index
//! views, so staged state is immediately visible to reads (relationship
//! lookups included), while holding back the events. Commit re-verifies
//! versions and publishes all events through the log; rollback walks the
//! stages in reverse, restoring pre-images and repairing the reverse
//! relationship index along the way.
//!
//! Entity ids cross this boundary in canonical `"ns/id"` form and leave
//! it inside events as `"ns:id"` targets; the conversion happens exactly
//! here and nowhere else.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::{Document, Entity, EntityId, Event, EventOp};
use entity_store::{TransactionalBackend, UpdateDoc};
use snafu::{ensure, ResultExt, Snafu};
use std::sync::Arc;
use tracing::{debug, warn};

/// Transaction errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("transaction already {}", state))]
    Closed { state: &'static str },

    #[snafu(display("{}", source))]
    Backend { source: entity_store::Error },

    #[snafu(display(
        "commit-time version check failed for {}: staged {}, stored {:?}",
        id,
        staged,
        stored
    ))]
    CommitVersionCheck {
        id: String,
        staged: u64,
        stored: Option<u64>,
    },
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Creates transactions over one transactional backend.
#[derive(Debug, Clone)]
pub struct TransactionManager {
    backend: Arc<dyn TransactionalBackend>,
}

impl TransactionManager {
    /// Build over `backend`.
    pub fn new(backend: Arc<dyn TransactionalBackend>) -> Self {
        Self { backend }
    }

    /// Begin a transaction.
    pub fn begin(&self) -> Transaction {
        Transaction {
            backend: Arc::clone(&self.backend),
            staged: vec![],
            state: State::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Active,
    Committed,
    RolledBack,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        }
    }
}

/// One staged mutation and everything needed to invert it.
#[derive(Debug, Clone)]
enum StagedOp {
    Create {
        entity: Entity,
    },
    Update {
        before: Entity,
        after: Entity,
        actor: Option<String>,
    },
    Delete {
        before: Entity,
        after: Entity,
        actor: Option<String>,
    },
}

/// An open transaction; explicitly [`commit`](Self::commit) or
/// [`rollback`](Self::rollback) it.
#[derive(Debug)]
pub struct Transaction {
    backend: Arc<dyn TransactionalBackend>,
    staged: Vec<StagedOp>,
    state: State,
}

impl Transaction {
    fn check_active(&self) -> Result<()> {
        ensure!(
            self.state == State::Active,
            ClosedSnafu {
                state: self.state.name(),
            }
        );
        Ok(())
    }

    /// Number of staged operations.
    pub fn staged_ops(&self) -> usize {
        self.staged.len()
    }

    /// Stage an entity creation; the entity is visible to reads at once.
    pub async fn create(
        &mut self,
        ns: &str,
        id: Option<String>,
        body: Document,
        actor: Option<String>,
    ) -> Result<Entity> {
        self.check_active()?;
        let entity = self
            .backend
            .stage_create(ns, id, body, actor)
            .await
            .context(BackendSnafu)?;
        self.staged.push(StagedOp::Create {
            entity: entity.clone(),
        });
        Ok(entity)
    }

    /// Stage an update.
    pub async fn update(
        &mut self,
        id: &EntityId,
        update: &UpdateDoc,
        expected_version: Option<u64>,
        actor: Option<String>,
    ) -> Result<Entity> {
        self.check_active()?;
        let (before, after) = self
            .backend
            .stage_update(id, update, expected_version, actor.clone())
            .await
            .context(BackendSnafu)?;
        self.staged.push(StagedOp::Update {
            before,
            after: after.clone(),
            actor,
        });
        Ok(after)
    }

    /// Stage a soft delete.
    pub async fn delete(
        &mut self,
        id: &EntityId,
        expected_version: Option<u64>,
        actor: Option<String>,
    ) -> Result<()> {
        self.check_active()?;
        let (before, after) = self
            .backend
            .stage_delete(id, expected_version, actor.clone())
            .await
            .context(BackendSnafu)?;
        self.staged.push(StagedOp::Delete {
            before,
            after,
            actor,
        });
        Ok(())
    }

    /// Publish the transaction: verify nothing moved underneath the
    /// staged versions, then append one event per stage to the log.
    pub async fn commit(mut self) -> Result<()> {
        self.check_active()?;

        // the staged working set must still be what we produced
        for op in &self.staged {
            let (entity, staged_version) = match op {
                StagedOp::Create { entity } => (entity, entity.meta.version),
                StagedOp::Update { after, .. } => (after, after.meta.version),
                StagedOp::Delete { after, .. } => (after, after.meta.version),
            };
            let stored = self
                .backend
                .current_version(&entity.id)
                .await
                .context(BackendSnafu)?;
            ensure!(
                stored == Some(staged_version),
                CommitVersionCheckSnafu {
                    id: entity.id.canonical(),
                    staged: staged_version,
                    stored,
                }
            );
        }

        let events: Vec<Event> = self.staged.iter().map(to_event).collect();
        self.backend
            .commit_events(events)
            .await
            .context(BackendSnafu)?;
        debug!(n_ops = self.staged.len(), "transaction committed");
        self.state = State::Committed;
        Ok(())
    }

    /// Undo every staged operation, newest first.
    pub async fn rollback(mut self) -> Result<()> {
        self.check_active()?;
        self.rollback_staged().await?;
        self.state = State::RolledBack;
        Ok(())
    }

    async fn rollback_staged(&mut self) -> Result<()> {
        for op in self.staged.drain(..).rev() {
            match op {
                StagedOp::Create { entity } => {
                    self.backend
                        .unstage_create(&entity.id)
                        .await
                        .context(BackendSnafu)?;
                }
                StagedOp::Update { before, .. } => {
                    self.backend
                        .unstage_update(before)
                        .await
                        .context(BackendSnafu)?;
                }
                StagedOp::Delete { before, .. } => {
                    self.backend
                        .unstage_delete(before)
                        .await
                        .context(BackendSnafu)?;
                }
            }
        }
        debug!("transaction rolled back");
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == State::Active && !self.staged.is_empty() {
            // staged state stays visible; only an explicit rollback undoes it
            warn!(
                n_ops = self.staged.len(),
                "transaction dropped while active; call commit() or rollback()"
            );
        }
    }
}

/// Build the event a staged operation publishes.
///
/// The event `target` takes the `"ns:id"` form here; the entity keeps its
/// canonical `"ns/id"` form everywhere else.
fn to_event(op: &StagedOp) -> Event {
    match op {
        StagedOp::Create { entity } => {
            let mut event = Event::new(EventOp::Create, &entity.id, entity.meta.created_at);
            event.actor = entity.meta.created_by.clone();
            event.after = Some(entity.to_full_document());
            event
        }
        StagedOp::Update {
            before,
            after,
            actor,
        } => {
            let mut event = Event::new(EventOp::Update, &after.id, after.meta.updated_at);
            event.actor = actor.clone();
            event.before = Some(before.to_full_document());
            event.after = Some(after.to_full_document());
            event
        }
        // a staged delete is a soft delete: it publishes as an update so
        // replay keeps the deletion markers
        StagedOp::Delete {
            before,
            after,
            actor,
        } => {
            let mut event = Event::new(EventOp::Update, &after.id, after.meta.updated_at);
            event.actor = actor.clone();
            event.before = Some(before.to_full_document());
            event.after = Some(after.to_full_document());
            event
        }
    }
}
