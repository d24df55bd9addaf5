//! Load, detect, export, archive.

use crate::archive::Archiver;
use crate::config::Config;
use crate::datasets::detect::detect;
use crate::datasets::loader;
use crate::error::Result;
use crate::export::{normalize_shape, ClassCounts, Exporter};
use std::fmt;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
   pub total: usize,
   pub counts: ClassCounts,
   pub output_dir: PathBuf,
   pub archive: Option<PathBuf>,
}

impl fmt::Display for Summary {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      writeln!(f, "Summary by class:")?;
      write!(f, "{}", self.counts)
   }
}

/// Runs every stage in order. The first failure aborts the run, leaving any
/// files already written in place.
pub fn run(config: &Config, archiver: &dyn Archiver) -> Result<Summary> {
   let say = |msg: String| {
      if config.show_progress {
         println!("{}", msg);
      }
   };

   say(format!("Loading {} ...", config.input.display()));
   let blob = loader::load(&config.input)?;
   say(format!("Keys: {:?}", blob.keys().collect::<Vec<_>>()));

   let detected = detect(blob, &config.detect)?;
   say(format!(
      "Images: {:?} ({:?}, {})",
      detected.images.shape(),
      detected.images_key,
      detected.images.dtype()
   ));
   say(format!("Labels: {:?} ({:?})", detected.labels.shape(), detected.labels_key));

   let images = normalize_shape(detected.images)?;

   say(format!("Saving images to {} ...", config.output_dir.display()));
   let counts = Exporter::new(&config.output_dir)
      .with_progress(config.show_progress)
      .export(&images, &detected.labels)?;
   info!(total = counts.total(), "images exported");

   let archive = match &config.archive {
      Some(destination) => {
         say(format!("Archiving into {} ...", destination.display()));
         archiver.archive(&config.output_dir, destination)?;
         say(format!("Archive created: {}", destination.display()));
         Some(destination.clone())
      }
      None => None,
   };

   Ok(Summary {
      total: counts.total(),
      counts,
      output_dir: config.output_dir.clone(),
      archive,
   })
}
