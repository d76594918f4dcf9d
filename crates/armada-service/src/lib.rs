//! The service layer: campaign/changeset spec intake, the apply pipeline
//! that rewires campaigns onto new specs, and the permission-aware read
//! paths the API surface builds on.

mod rewirer;
mod service;
mod spec;

pub use rewirer::{rewire, RewirerInput};
pub use service::Service;
pub use spec::{diff_stat_of, parse_spec_body, validate_branch};
