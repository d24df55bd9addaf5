use anyhow::Result;
use clap::Parser;
use mnist_export::config::{DEFAULT_ARCHIVE, DEFAULT_INPUT, DEFAULT_OUTPUT_DIR};
use mnist_export::datasets::detect::DetectOptions;
use mnist_export::{run, ArchiverKind, CommandArchiver, Config};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

// Export an MNIST-like dataset as PNG folders per digit, then archive them.

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
   /// Dataset file (.pkl, .npz, optionally gzipped)
   #[arg(default_value = DEFAULT_INPUT)]
   input: PathBuf,

   /// Directory receiving one subdirectory per digit
   #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
   output_dir: PathBuf,

   /// Archive file to create from the output directory
   #[arg(short, long, default_value = DEFAULT_ARCHIVE)]
   archive: PathBuf,

   /// Archiver to run
   #[arg(long, value_enum, default_value_t = ArchiverKind::Rar)]
   archiver: ArchiverKind,

   /// Path of the archiver executable, if it is not on PATH
   #[arg(long)]
   archiver_path: Option<PathBuf>,

   /// Only export the images, skip archiving
   #[arg(long)]
   no_archive: bool,

   /// Key of the image tensor, when more than one entry looks like images
   #[arg(long)]
   images_key: Option<String>,

   /// Key of the label vector, when more than one entry looks like labels
   #[arg(long)]
   labels_key: Option<String>,

   /// No progress output, only the final summary
   #[arg(short, long)]
   quiet: bool,
}

fn main() {
   tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
      .with_writer(std::io::stderr)
      .init();

   if let Err(e) = try_main(Args::parse()) {
      eprintln!("Error: {:#}", e);
      std::process::exit(1);
   }
}

fn try_main(args: Args) -> Result<()> {
   let config = Config {
      input: args.input,
      output_dir: args.output_dir,
      archive: (!args.no_archive).then_some(args.archive),
      detect: DetectOptions {
         images_key: args.images_key,
         labels_key: args.labels_key,
      },
      show_progress: !args.quiet,
   };
   let archiver = CommandArchiver::from_kind(args.archiver, args.archiver_path);

   let summary = run(&config, &archiver)?;

   println!();
   print!("{}", summary);
   Ok(())
}
