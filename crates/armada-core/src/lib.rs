pub mod error;
pub mod external;
pub mod types;

pub use error::{Error, Result};
pub use external::{Actor, AuthChecker, RepoStore};
pub use types::*;
