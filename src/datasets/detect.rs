//! Picks the image tensor and the label vector out of a [`Blob`] by shape.

use super::blob::{ArrayValue, Blob, Value};
use crate::error::DetectionError;
use ndarray::{Array1, Ix1};
use std::fmt;
use tracing::debug;

pub const IMAGE_SIDE: usize = 28;
pub const IMAGE_PIXELS: usize = IMAGE_SIDE * IMAGE_SIDE;
pub const NUM_CLASSES: usize = 10;

/// An image tensor needs strictly more samples than this.
pub const MIN_SAMPLES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
   Images,
   Labels,
}

impl Role {
   /// Checks `array` against the shape rule of this role, returning why it
   /// does not qualify.
   pub fn check(self, array: &ArrayValue) -> Result<(), String> {
      match self {
         Role::Images => check_images(array),
         Role::Labels => check_labels(array),
      }
   }
}

impl fmt::Display for Role {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Role::Images => f.write_str("images"),
         Role::Labels => f.write_str("labels"),
      }
   }
}

fn check_images(array: &ArrayValue) -> Result<(), String> {
   let shape = array.shape();
   match shape {
      &[n, ..] if !(2..=4).contains(&shape.len()) || n <= MIN_SAMPLES => Err(format!(
         "shape {:?} needs rank 2 to 4 and more than {} samples",
         shape, MIN_SAMPLES
      )),
      &[_, IMAGE_PIXELS] | &[_, IMAGE_SIDE, IMAGE_SIDE, ..] => Ok(()),
      _ => Err(format!(
         "shape {:?} is neither (N, {}) nor (N, {}, {}, ...)",
         shape, IMAGE_PIXELS, IMAGE_SIDE, IMAGE_SIDE
      )),
   }
}

fn check_labels(array: &ArrayValue) -> Result<(), String> {
   let values = match array {
      ArrayValue::Int(a) if a.ndim() == 1 => a,
      ArrayValue::Int(a) => return Err(format!("rank {} is not 1", a.ndim())),
      ArrayValue::Float(_) => return Err("element type float64 is not integral".to_owned()),
   };
   match values.iter().max() {
      None => Err("label vector is empty".to_owned()),
      Some(&max) if max > (NUM_CLASSES - 1) as i64 => Err(format!("maximum value {} exceeds 9", max)),
      Some(_) => Ok(()),
   }
}

/// Keys that pin a role to a specific blob entry instead of scanning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectOptions {
   pub images_key: Option<String>,
   pub labels_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detected {
   pub images_key: String,
   pub images: ArrayValue,
   pub labels_key: String,
   pub labels: Array1<i64>,
}

impl Detected {
   pub fn len(&self) -> usize {
      self.labels.len()
   }

   pub fn is_empty(&self) -> bool {
      self.labels.is_empty()
   }
}

/// Selects exactly one image tensor and one label vector from `blob`.
///
/// Without explicit keys the whole blob is scanned and each role must match
/// exactly one entry. Multiple matches are an error rather than a guess, so
/// the result never depends on key order. A role with no match at all is
/// reported before ambiguity in the other role.
pub fn detect(mut blob: Blob, options: &DetectOptions) -> Result<Detected, DetectionError> {
   let images = select(&blob, Role::Images, options.images_key.as_deref())?;
   let labels = select(&blob, Role::Labels, options.labels_key.as_deref())?;

   let missing = match (images.is_empty(), labels.is_empty()) {
      (true, true) => Some("images and labels"),
      (true, false) => Some("images"),
      (false, true) => Some("labels"),
      (false, false) => None,
   };
   if let Some(missing) = missing {
      return Err(DetectionError::NotFound {
         missing: missing.to_owned(),
         keys: blob.keys().map(str::to_owned).collect(),
      });
   }
   let images_key = single(Role::Images, images)?;
   let labels_key = single(Role::Labels, labels)?;

   let images = take_array(&mut blob, Role::Images, &images_key)?;
   let labels = match take_array(&mut blob, Role::Labels, &labels_key)? {
      ArrayValue::Int(a) => a.into_dimensionality::<Ix1>().map_err(|e| DetectionError::Rejected {
         role: Role::Labels,
         key: labels_key.clone(),
         reason: e.to_string(),
      })?,
      ArrayValue::Float(_) => {
         return Err(DetectionError::Rejected {
            role: Role::Labels,
            key: labels_key,
            reason: "element type float64 is not integral".to_owned(),
         })
      }
   };

   let num_images = images.shape()[0];
   if num_images != labels.len() {
      return Err(DetectionError::LengthMismatch {
         images: num_images,
         labels: labels.len(),
      });
   }

   Ok(Detected {
      images_key,
      images,
      labels_key,
      labels,
   })
}

/// Keys that qualify for `role`: the explicit key alone, or every matching
/// entry.
fn select(blob: &Blob, role: Role, key: Option<&str>) -> Result<Vec<String>, DetectionError> {
   if let Some(key) = key {
      let reason = match blob.get(key) {
         None => {
            return Err(DetectionError::MissingKey {
               role,
               key: key.to_owned(),
            })
         }
         Some(Value::Unsupported { reason }) => Err(reason.clone()),
         Some(Value::Array(array)) => role.check(array),
      };
      return match reason {
         Ok(()) => Ok(vec![key.to_owned()]),
         Err(reason) => Err(DetectionError::Rejected {
            role,
            key: key.to_owned(),
            reason,
         }),
      };
   }

   Ok(blob
      .arrays()
      .filter(|(key, array)| match role.check(array) {
         Ok(()) => {
            debug!(key, %role, shape = ?array.shape(), "candidate");
            true
         }
         Err(reason) => {
            debug!(key, %role, reason = reason.as_str(), "not a candidate");
            false
         }
      })
      .map(|(key, _)| key.to_owned())
      .collect())
}

fn single(role: Role, mut candidates: Vec<String>) -> Result<String, DetectionError> {
   match candidates.len() {
      1 => Ok(candidates.remove(0)),
      _ => Err(DetectionError::Ambiguous { role, candidates }),
   }
}

fn take_array(blob: &mut Blob, role: Role, key: &str) -> Result<ArrayValue, DetectionError> {
   match blob.remove(key) {
      Some(Value::Array(array)) => Ok(array),
      _ => Err(DetectionError::MissingKey {
         role,
         key: key.to_owned(),
      }),
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use ndarray::{ArrayD, IxDyn};

   fn ints(shape: &[usize], value: i64) -> ArrayD<i64> {
      ArrayD::from_elem(IxDyn(shape), value)
   }

   fn floats(shape: &[usize]) -> ArrayD<f64> {
      ArrayD::zeros(IxDyn(shape))
   }

   #[test]
   fn image_rule() {
      let accepted: [&[usize]; 4] = [&[101, 784], &[500, 28, 28], &[500, 28, 28, 1], &[500, 28, 28, 3]];
      for shape in accepted {
         assert!(check_images(&floats(shape).into()).is_ok(), "{:?}", shape);
      }
      let rejected: [&[usize]; 5] = [&[100, 784], &[500, 783], &[500, 28, 27], &[500], &[2, 500, 28, 28, 1]];
      for shape in rejected {
         assert!(check_images(&floats(shape).into()).is_err(), "{:?}", shape);
      }
   }

   #[test]
   fn label_rule() {
      assert!(check_labels(&ints(&[5], 9).into()).is_ok());
      assert!(check_labels(&ints(&[5], 10).into()).is_err());
      assert!(check_labels(&ints(&[0], 0).into()).is_err());
      assert!(check_labels(&ints(&[5, 1], 0).into()).is_err());
      assert!(check_labels(&floats(&[5]).into()).is_err());
   }

   #[test]
   fn selects_matches_regardless_of_key_order() {
      let orders = [
         vec!["meta", "pixels", "targets"],
         vec!["targets", "meta", "pixels"],
         vec!["pixels", "targets", "meta"],
      ];
      for order in orders {
         let blob: Blob = order
            .iter()
            .map(|&key| {
               let value: Value = match key {
                  "pixels" => ints(&[150, 28, 28], 0).into(),
                  "targets" => ints(&[150], 4).into(),
                  _ => floats(&[3, 3]).into(),
               };
               (key, value)
            })
            .collect();

         let detected = detect(blob, &DetectOptions::default()).unwrap();
         assert_eq!(detected.images_key, "pixels");
         assert_eq!(detected.labels_key, "targets");
         assert_eq!(detected.images.shape(), &[150, 28, 28]);
         assert_eq!(detected.len(), 150);
      }
   }

   #[test]
   fn missing_images_is_not_found() {
      let blob: Blob = vec![("y_train", ints(&[150], 1)), ("y_test", ints(&[150], 2))]
         .into_iter()
         .collect();
      match detect(blob, &DetectOptions::default()).unwrap_err() {
         DetectionError::NotFound { missing, keys } => {
            assert_eq!(missing, "images");
            assert_eq!(keys, vec!["y_train", "y_test"]);
         }
         other => panic!("unexpected error {:?}", other),
      }
   }

   #[test]
   fn missing_role_wins_over_ambiguous_role() {
      let blob: Blob = vec![
         ("x_train", Value::from(floats(&[200, 784]))),
         ("x_test", Value::from(floats(&[150, 784]))),
         ("meta", Value::from(floats(&[3]))),
      ]
      .into_iter()
      .collect();
      match detect(blob, &DetectOptions::default()).unwrap_err() {
         DetectionError::NotFound { missing, .. } => assert_eq!(missing, "labels"),
         other => panic!("unexpected error {:?}", other),
      }
   }

   #[test]
   fn two_image_candidates_are_ambiguous() {
      let blob: Blob = vec![
         ("x_train", Value::from(floats(&[200, 784]))),
         ("x_test", Value::from(floats(&[150, 784]))),
         ("y_test", Value::from(ints(&[150], 1))),
      ]
      .into_iter()
      .collect();

      match detect(blob, &DetectOptions::default()).unwrap_err() {
         DetectionError::Ambiguous { role, candidates } => {
            assert_eq!(role, Role::Images);
            assert_eq!(candidates, vec!["x_train", "x_test"]);
         }
         other => panic!("unexpected error {:?}", other),
      }
   }

   #[test]
   fn explicit_keys_resolve_ambiguity() {
      let blob: Blob = vec![
         ("x_train", Value::from(floats(&[200, 784]))),
         ("x_test", Value::from(floats(&[150, 784]))),
         ("y_train", Value::from(ints(&[200], 1))),
         ("y_test", Value::from(ints(&[150], 1))),
      ]
      .into_iter()
      .collect();
      let options = DetectOptions {
         images_key: Some("x_test".to_owned()),
         labels_key: Some("y_test".to_owned()),
      };

      let detected = detect(blob, &options).unwrap();
      assert_eq!(detected.images.shape(), &[150, 784]);
      assert_eq!(detected.labels_key, "y_test");
   }

   #[test]
   fn explicit_key_must_exist_and_qualify() {
      let blob: Blob = vec![("x", Value::from(floats(&[200, 784])))].into_iter().collect();

      let options = DetectOptions {
         images_key: Some("pixels".to_owned()),
         labels_key: None,
      };
      assert!(matches!(
         detect(blob.clone(), &options).unwrap_err(),
         DetectionError::MissingKey { role: Role::Images, .. }
      ));

      let options = DetectOptions {
         images_key: None,
         labels_key: Some("x".to_owned()),
      };
      assert!(matches!(
         detect(blob, &options).unwrap_err(),
         DetectionError::Rejected { role: Role::Labels, .. }
      ));
   }

   #[test]
   fn explicit_key_on_unsupported_entry_is_rejected() {
      let blob: Blob = vec![
         ("x", Value::from(floats(&[200, 784]))),
         ("y", Value::from(ints(&[200], 1))),
         (
            "names",
            Value::Unsupported {
               reason: "a str is not numeric".to_owned(),
            },
         ),
      ]
      .into_iter()
      .collect();
      let options = DetectOptions {
         images_key: None,
         labels_key: Some("names".to_owned()),
      };
      match detect(blob, &options).unwrap_err() {
         DetectionError::Rejected { role, key, reason } => {
            assert_eq!(role, Role::Labels);
            assert_eq!(key, "names");
            assert_eq!(reason, "a str is not numeric");
         }
         other => panic!("unexpected error {:?}", other),
      }
   }

   #[test]
   fn label_count_must_match_image_count() {
      let blob: Blob = vec![
         ("images", Value::from(floats(&[150, 784]))),
         ("labels", Value::from(ints(&[149], 0))),
      ]
      .into_iter()
      .collect();
      assert!(matches!(
         detect(blob, &DetectOptions::default()).unwrap_err(),
         DetectionError::LengthMismatch {
            images: 150,
            labels: 149
         }
      ));
   }
}
