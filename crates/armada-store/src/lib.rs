//! Postgres persistence for campaigns, specs, changesets, and events.
//!
//! The [`Store`] is the single source of truth for all core state. Single-row
//! writes auto-commit; multi-row mutations run inside one transaction. The
//! worker queue (dequeue / heartbeat / stall reset) also lives here because
//! the row lock is the coordination point between reconciler workers.

mod campaign_specs;
mod campaigns;
mod changeset_specs;
mod changesets;
mod events;
mod queue;
mod rewirer_mappings;
mod status;
mod store;

pub use changeset_specs::ListChangesetSpecsOpts;
pub use changesets::{ChangesetSyncData, ListChangesetsOpts};
pub use rewirer_mappings::RewirerMapping;
pub use status::{CampaignStatus, GetCampaignStatusOpts};
pub use store::Store;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
