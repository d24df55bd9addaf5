use crate::datasets::detect::DetectOptions;
use std::path::PathBuf;

pub const DEFAULT_INPUT: &str = "mnist_test_15percent.pkl";
pub const DEFAULT_OUTPUT_DIR: &str = "mnist_images_test";
pub const DEFAULT_ARCHIVE: &str = "mnist_images_test.rar";

/// Everything one run needs. The archiver backend is passed separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
   /// Dataset file to read.
   pub input: PathBuf,
   /// Root of the `<label>/img_<index>.png` tree.
   pub output_dir: PathBuf,
   /// Archive to create from `output_dir`. `None` skips archiving.
   pub archive: Option<PathBuf>,
   pub detect: DetectOptions,
   /// Print stage messages and a progress bar.
   pub show_progress: bool,
}

impl Config {
   pub fn new<I: Into<PathBuf>, O: Into<PathBuf>>(input: I, output_dir: O) -> Config {
      Config {
         input: input.into(),
         output_dir: output_dir.into(),
         ..Config::default()
      }
   }

   pub fn with_archive<P: Into<PathBuf>>(mut self, archive: Option<P>) -> Config {
      self.archive = archive.map(Into::into);
      self
   }
}

impl Default for Config {
   fn default() -> Config {
      Config {
         input: PathBuf::from(DEFAULT_INPUT),
         output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
         archive: Some(PathBuf::from(DEFAULT_ARCHIVE)),
         detect: DetectOptions::default(),
         show_progress: true,
      }
   }
}
