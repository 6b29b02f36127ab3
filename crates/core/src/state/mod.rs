pub mod db;
pub mod interaction;
pub mod io;
pub mod registry;
pub mod runs;

pub use db::FoundryDb;

pub use interaction::{Interaction, InteractionKind, InteractionManager, InteractionStatus};
pub use registry::{InMemoryRegistry, RegistryStore, SqliteRegistry};
pub use runs::{ArchivedRun, RunArchive};
