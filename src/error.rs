use crate::datasets::detect::Role;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure of a pipeline stage. The message names the stage, the source
/// carries the cause, so `{:#}` reads as `<stage>: <cause>`.
#[derive(Debug, Error)]
pub enum Error {
   #[error("load")]
   Load(#[from] LoadError),

   #[error("detect")]
   Detection(#[from] DetectionError),

   #[error("normalize")]
   Shape(#[from] ShapeError),

   #[error("export")]
   Export(#[from] ExportError),

   #[error("export: cannot write \"{}\"", path.display())]
   Io {
      path: PathBuf,
      #[source]
      source: io::Error,
   },

   #[error("archive")]
   Archive(#[from] ArchiveError),
}

#[derive(Debug, Error)]
pub enum LoadError {
   #[error("dataset file \"{}\" was not found", .0.display())]
   NotFound(PathBuf),

   #[error("could not read \"{}\"", path.display())]
   Io {
      path: PathBuf,
      #[source]
      source: io::Error,
   },

   #[error("could not decode \"{}\": {reason}", path.display())]
   Malformed { path: PathBuf, reason: String },

   #[error("top-level object in \"{}\" is {found}, not a mapping", path.display())]
   NotAMapping { path: PathBuf, found: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PickleError {
   #[error("pickle data ends early at byte {0}")]
   Truncated(usize),

   #[error("unknown opcode 0x{opcode:02x} at byte {offset}")]
   UnknownOpcode { opcode: u8, offset: usize },

   #[error("opcode {name} at byte {offset} is not supported")]
   Unsupported { name: &'static str, offset: usize },

   #[error("{what} at byte {offset}")]
   Invalid { what: &'static str, offset: usize },
}

#[derive(Debug, Error)]
pub enum DetectionError {
   #[error("cannot identify images and labels: no {missing} candidate among keys {keys:?}")]
   NotFound { missing: String, keys: Vec<String> },

   #[error("{role} are ambiguous: keys {candidates:?} all qualify, pass an explicit key")]
   Ambiguous { role: Role, candidates: Vec<String> },

   #[error("no entry named {key:?} for {role}")]
   MissingKey { role: Role, key: String },

   #[error("entry {key:?} cannot be used as {role}: {reason}")]
   Rejected {
      role: Role,
      key: String,
      reason: String,
   },

   #[error("found {images} images but {labels} labels")]
   LengthMismatch { images: usize, labels: usize },
}

#[derive(Debug, Error)]
#[error("unsupported image tensor shape {shape:?}, expected (N, 784), (N, 28, 28) or (N, 28, 28, 1)")]
pub struct ShapeError {
   pub shape: Vec<usize>,
}

#[derive(Debug, Error)]
pub enum ExportError {
   #[error("sample {index} has label {label}, expected a digit in 0..=9")]
   LabelOutOfRange { index: usize, label: i64 },
}

#[derive(Debug, Error)]
pub enum ArchiveError {
   #[error("archiver \"{}\" was not found", program.display())]
   ToolNotFound { program: PathBuf },

   #[error("could not start archiver \"{}\"", program.display())]
   Spawn {
      program: PathBuf,
      #[source]
      source: io::Error,
   },

   #[error("archiver exited with {}: {stderr}", describe_exit(*code))]
   Failed { code: Option<i32>, stderr: String },
}

fn describe_exit(code: Option<i32>) -> String {
   match code {
      Some(code) => format!("status {code}"),
      None => "a signal".to_owned(),
   }
}
