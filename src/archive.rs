//! Packs the exported directory into a single archive file.

use crate::error::ArchiveError;
use clap::ValueEnum;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};

pub trait Archiver {
   /// Archives `directory` recursively into `destination`, blocking until
   /// done.
   fn archive(&self, directory: &Path, destination: &Path) -> Result<(), ArchiveError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ArchiverKind {
   #[default]
   Rar,
   #[value(name = "7z")]
   SevenZip,
   Zip,
}

impl ArchiverKind {
   pub fn program(self) -> &'static str {
      match self {
         ArchiverKind::Rar => "rar",
         ArchiverKind::SevenZip => "7z",
         ArchiverKind::Zip => "zip",
      }
   }

   /// Flags placed before the destination and source paths.
   pub fn flags(self) -> &'static [&'static str] {
      match self {
         ArchiverKind::Rar | ArchiverKind::SevenZip => &["a", "-r"],
         ArchiverKind::Zip => &["-r"],
      }
   }
}

/// Runs an external archiver as `<program> <flags..> <destination> <directory>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandArchiver {
   program: PathBuf,
   flags: Vec<String>,
}

impl CommandArchiver {
   pub fn new<P, I, S>(program: P, flags: I) -> CommandArchiver
   where
      P: Into<PathBuf>,
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      CommandArchiver {
         program: program.into(),
         flags: flags.into_iter().map(Into::into).collect(),
      }
   }

   /// Preset for `kind`, optionally overriding where the executable lives.
   pub fn from_kind(kind: ArchiverKind, program: Option<PathBuf>) -> CommandArchiver {
      CommandArchiver::new(
         program.unwrap_or_else(|| PathBuf::from(kind.program())),
         kind.flags().iter().copied(),
      )
   }

   pub fn program(&self) -> &Path {
      &self.program
   }

   /// Resolves the executable. Paths with a directory part must exist as
   /// given; bare names are looked up on `PATH`.
   pub fn locate(&self) -> Result<PathBuf, ArchiveError> {
      let not_found = || ArchiveError::ToolNotFound {
         program: self.program.clone(),
      };

      if self.program.components().count() > 1 {
         if self.program.is_file() {
            return Ok(self.program.clone());
         }
         return Err(not_found());
      }

      let path = env::var_os("PATH").ok_or_else(not_found)?;
      env::split_paths(&path)
         .flat_map(|dir| {
            let plain = dir.join(&self.program);
            let exe = plain.with_extension(env::consts::EXE_EXTENSION);
            [plain, exe]
         })
         .find(|candidate| candidate.is_file())
         .ok_or_else(not_found)
   }
}

impl Archiver for CommandArchiver {
   fn archive(&self, directory: &Path, destination: &Path) -> Result<(), ArchiveError> {
      let program = self.locate()?;
      info!(
         program = %program.display(),
         flags = ?self.flags,
         destination = %destination.display(),
         directory = %directory.display(),
         "running archiver"
      );

      let output = Command::new(&program)
         .args(&self.flags)
         .arg(destination)
         .arg(directory)
         .stdin(Stdio::null())
         .output()
         .map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => ArchiveError::ToolNotFound {
               program: program.clone(),
            },
            _ => ArchiveError::Spawn {
               program: program.clone(),
               source,
            },
         })?;
      debug!(stdout = %String::from_utf8_lossy(&output.stdout), "archiver output");

      if !output.status.success() {
         return Err(ArchiveError::Failed {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
         });
      }
      Ok(())
   }
}
