pub mod config;
pub mod error;
pub mod face;
pub mod liveness;
pub mod media;
pub mod model;
pub mod peer;
pub mod recording;
pub mod relay;
pub mod session;
pub mod store;
pub mod testing;

pub use config::Config;
pub use error::{ProctorError, Result};
pub use session::{SessionCoordinator, SessionDeps, SessionView};
