pub mod archive;
pub mod config;
pub mod datasets;
pub mod error;
pub mod export;
pub mod pipeline;

pub use archive::{Archiver, ArchiverKind, CommandArchiver};
pub use config::Config;
pub use error::{Error, Result};
pub use export::ClassCounts;
pub use pipeline::{run, Summary};
