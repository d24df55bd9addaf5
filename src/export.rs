use crate::datasets::blob::ArrayValue;
use crate::datasets::detect::{IMAGE_PIXELS, IMAGE_SIDE, NUM_CLASSES};
use crate::error::{DetectionError, Error, ExportError, Result, ShapeError};
use image::{GrayImage, ImageError, ImageFormat, Luma};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array1, Array3, ArrayView2, Axis};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Reshapes a detected image tensor to (N, 28, 28).
pub fn normalize_shape(images: ArrayValue) -> Result<Array3<f64>, ShapeError> {
   let shape = images.shape().to_vec();
   let n = match shape.as_slice() {
      &[n, IMAGE_PIXELS] | &[n, IMAGE_SIDE, IMAGE_SIDE] | &[n, IMAGE_SIDE, IMAGE_SIDE, 1] => n,
      _ => return Err(ShapeError { shape: shape.clone() }),
   };

   let images = images.into_f64();
   // Logical (row-major) order, whatever the memory layout.
   let data = if images.is_standard_layout() {
      images.into_raw_vec()
   } else {
      images.iter().copied().collect()
   };
   Array3::from_shape_vec((n, IMAGE_SIDE, IMAGE_SIDE), data).map_err(|_| ShapeError { shape })
}

/// Converts one sample to 8-bit pixels. Samples whose maximum is at most 1.0
/// are treated as [0, 1] intensities and scaled by 255, anything else is cast
/// directly. The cast saturates outside [0, 255].
pub fn to_pixels(sample: ArrayView2<f64>) -> Vec<u8> {
   let max = sample.iter().copied().fold(f64::NEG_INFINITY, f64::max);
   if max <= 1.0 {
      sample.iter().map(|&v| (v * 255.0).round() as u8).collect()
   } else {
      sample.iter().map(|&v| v as u8).collect()
   }
}

pub struct Sample {
   pub rows: u32,
   pub cols: u32,
   pub data: Vec<u8>,
}

impl Sample {
   pub fn from_view(sample: ArrayView2<f64>) -> Sample {
      let (rows, cols) = sample.dim();
      Sample {
         rows: rows as u32,
         cols: cols as u32,
         data: to_pixels(sample),
      }
   }

   pub fn to_image(&self) -> GrayImage {
      let mut img = GrayImage::new(self.cols, self.rows);
      for (i, pixel) in self.data.iter().enumerate() {
         img.put_pixel(
            (i % self.cols as usize) as u32,
            (i / self.cols as usize) as u32,
            Luma([*pixel]),
         );
      }
      img
   }
}

pub fn file_name(index: usize) -> String {
   format!("img_{:05}.png", index)
}

/// Number of exported images per digit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassCounts([usize; NUM_CLASSES]);

impl ClassCounts {
   pub fn get(&self, digit: u8) -> usize {
      self.0.get(digit as usize).copied().unwrap_or(0)
   }

   pub fn total(&self) -> usize {
      self.0.iter().sum()
   }

   pub fn iter(&self) -> impl Iterator<Item = (u8, usize)> + '_ {
      self.0.iter().enumerate().map(|(digit, &n)| (digit as u8, n))
   }

   fn increment(&mut self, digit: u8) {
      self.0[digit as usize] += 1;
   }
}

impl fmt::Display for ClassCounts {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      for (digit, n) in self.iter() {
         writeln!(f, "  {}: {} images", digit, n)?;
      }
      Ok(())
   }
}

/// Writes samples as `<output_dir>/<label>/img_<index>.png`.
pub struct Exporter {
   output_dir: PathBuf,
   progress: bool,
}

impl Exporter {
   pub fn new<P: Into<PathBuf>>(output_dir: P) -> Exporter {
      Exporter {
         output_dir: output_dir.into(),
         progress: false,
      }
   }

   pub fn with_progress(mut self, progress: bool) -> Exporter {
      self.progress = progress;
      self
   }

   pub fn export(&self, images: &Array3<f64>, labels: &Array1<i64>) -> Result<ClassCounts> {
      let num_images = images.len_of(Axis(0));
      if num_images != labels.len() {
         return Err(DetectionError::LengthMismatch {
            images: num_images,
            labels: labels.len(),
         }
         .into());
      }

      create_dir(&self.output_dir)?;
      let pb = self.progress_bar(num_images as u64);
      let mut counts = ClassCounts::default();

      for (index, (sample, &label)) in images.outer_iter().zip(labels.iter()).enumerate() {
         let digit = u8::try_from(label)
            .ok()
            .filter(|&d| (d as usize) < NUM_CLASSES)
            .ok_or(ExportError::LabelOutOfRange { index, label })?;

         let class_dir = self.output_dir.join(digit.to_string());
         create_dir(&class_dir)?;

         let path = class_dir.join(file_name(index));
         Sample::from_view(sample)
            .to_image()
            .save_with_format(&path, ImageFormat::Png)
            .map_err(|e| write_error(&path, e))?;

         counts.increment(digit);
         pb.inc(1);
      }

      pb.finish_with_message(format!(
         "Saved {} images to {}",
         counts.total(),
         self.output_dir.display()
      ));
      debug!(?counts, "export finished");
      Ok(counts)
   }

   fn progress_bar(&self, len: u64) -> ProgressBar {
      if !self.progress {
         return ProgressBar::hidden();
      }
      let pb = ProgressBar::new(len);
      if let Ok(style) = ProgressStyle::default_bar()
         .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.green}] {pos}/{len} ({per_sec}, {eta})\n{msg}")
      {
         pb.set_style(style.progress_chars("#>-"));
      }
      pb
   }
}

fn create_dir(path: &Path) -> Result<()> {
   fs::create_dir_all(path).map_err(|source| Error::Io {
      path: path.to_path_buf(),
      source,
   })
}

fn write_error(path: &Path, err: ImageError) -> Error {
   let source = match err {
      ImageError::IoError(e) => e,
      other => io::Error::new(io::ErrorKind::Other, other),
   };
   Error::Io {
      path: path.to_path_buf(),
      source,
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use ndarray::{Array2, ArrayD, IxDyn, ShapeBuilder};
   use tempfile::tempdir;

   fn ramp(shape: &[usize]) -> ArrayD<i64> {
      let len: usize = shape.iter().product();
      ArrayD::from_shape_vec(IxDyn(shape), (0..len as i64).map(|v| v % 256).collect()).unwrap()
   }

   #[test]
   fn flat_and_square_tensors_normalize_alike() {
      let flat = normalize_shape(ramp(&[3, 784]).into()).unwrap();
      let square = normalize_shape(ramp(&[3, 28, 28]).into()).unwrap();
      let channel = normalize_shape(ramp(&[3, 28, 28, 1]).into()).unwrap();

      assert_eq!(flat.dim(), (3, 28, 28));
      assert_eq!(flat, square);
      assert_eq!(flat, channel);
      assert_eq!(flat[[0, 1, 0]], 28.0);
   }

   #[test]
   fn column_major_input_keeps_logical_order() {
      let standard = ArrayD::from_shape_vec(IxDyn(&[2, 784]), (0..1568).map(|v| v as f64).collect()).unwrap();
      let mut fortran = ArrayD::<f64>::zeros(IxDyn(&[2, 784]).f());
      fortran.assign(&standard);
      assert!(!fortran.is_standard_layout());

      let a = normalize_shape(ArrayValue::Float(standard)).unwrap();
      let b = normalize_shape(ArrayValue::Float(fortran)).unwrap();
      assert_eq!(a, b);
   }

   #[test]
   fn unsupported_shapes_are_rejected() {
      let shapes: [&[usize]; 4] = [&[3, 28, 28, 3], &[3, 783], &[3, 28, 27], &[784]];
      for shape in shapes {
         let err = normalize_shape(ramp(shape).into()).unwrap_err();
         assert_eq!(err.shape, shape.to_vec());
      }
   }

   #[test]
   fn unit_range_is_scaled_and_rounded() {
      let sample = Array2::from_shape_vec((1, 4), vec![0.0, 0.5, 128.0 / 255.0, 1.0]).unwrap();
      assert_eq!(to_pixels(sample.view()), vec![0, 128, 128, 255]);
   }

   #[test]
   fn byte_range_is_truncated() {
      let sample = Array2::from_shape_vec((1, 4), vec![0.0, 7.9, 128.5, 255.0]).unwrap();
      assert_eq!(to_pixels(sample.view()), vec![0, 7, 128, 255]);
   }

   #[test]
   fn sample_image_is_row_major() {
      let mut view = Array2::<f64>::zeros((28, 28));
      view[[2, 5]] = 200.0;
      let img = Sample::from_view(view.view()).to_image();
      assert_eq!(img.dimensions(), (28, 28));
      assert_eq!(img.get_pixel(5, 2).0, [200]);
      assert_eq!(img.get_pixel(2, 5).0, [0]);
   }

   #[test]
   fn export_counts_match_files_on_disk() {
      let dir = tempdir().unwrap();
      let out = dir.path().join("out");
      let images = Array3::<f64>::zeros((12, 28, 28));
      let labels = Array1::from((0..12).map(|i| i % 4).collect::<Vec<i64>>());

      let counts = Exporter::new(&out).export(&images, &labels).unwrap();
      assert_eq!(counts.total(), 12);
      for (digit, n) in counts.iter() {
         let class_dir = out.join(digit.to_string());
         let on_disk = fs::read_dir(&class_dir).map(|d| d.count()).unwrap_or(0);
         assert_eq!(on_disk, n, "digit {}", digit);
      }
      assert!(out.join("1").join(file_name(5)).is_file());
      assert!(!out.join("4").exists());
   }

   #[test]
   fn export_is_reproducible() {
      let dir = tempdir().unwrap();
      let images = normalize_shape(ramp(&[5, 784]).into()).unwrap();
      let labels = Array1::from(vec![9, 0, 9, 3, 3]);

      let first = dir.path().join("first");
      let second = dir.path().join("second");
      Exporter::new(&first).export(&images, &labels).unwrap();
      Exporter::new(&second).export(&images, &labels).unwrap();

      for (index, label) in labels.iter().enumerate() {
         let name = Path::new(&label.to_string()).join(file_name(index));
         assert_eq!(
            fs::read(first.join(&name)).unwrap(),
            fs::read(second.join(&name)).unwrap()
         );
      }
   }

   #[test]
   fn out_of_range_label_fails() {
      let dir = tempdir().unwrap();
      let images = Array3::<f64>::zeros((3, 28, 28));
      let labels = Array1::from(vec![1, 12, 2]);

      let err = Exporter::new(dir.path()).export(&images, &labels).unwrap_err();
      assert!(matches!(
         err,
         Error::Export(ExportError::LabelOutOfRange { index: 1, label: 12 })
      ));
   }

   #[test]
   fn summary_lists_every_digit() {
      let mut counts = ClassCounts::default();
      counts.increment(3);
      counts.increment(3);
      let text = counts.to_string();
      assert_eq!(text.lines().count(), 10);
      assert!(text.contains("  3: 2 images"));
      assert!(text.contains("  0: 0 images"));
   }
}
