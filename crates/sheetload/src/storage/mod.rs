pub mod archive;

pub use archive::{ArchiveStorage, CleanupReport};
