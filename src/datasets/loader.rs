//! Reads a dataset file into a [`Blob`].
//!
//! Two encodings are understood, told apart by their leading bytes:
//! - numpy `.npz` archives (zip of `.npy` members),
//! - Python pickles whose top-level object is a `dict` of numpy arrays or
//!   nested lists of numbers.
//!
//! Either may be gzip-compressed.

use super::blob::{ArrayValue, Blob, Value};
use super::numpy::{self, Elements};
use super::pickle::{self, Id, Object, Pickle};
use super::utils::{check_exists, decompress_gz, is_gzip, is_zip};
use crate::error::LoadError;
use ndarray::{ArrayD, IxDyn};
use ndarray_npy::{NpzReader, ReadableElement};
use std::fs;
use std::io::{Cursor, Read, Seek};
use std::path::Path;
use tracing::{info, warn};

pub fn load<P: AsRef<Path>>(path: P) -> Result<Blob, LoadError> {
   let path = path.as_ref();
   if !check_exists(&path) {
      return Err(LoadError::NotFound(path.to_path_buf()));
   }

   let mut data = fs::read(path).map_err(|source| LoadError::Io {
      path: path.to_path_buf(),
      source,
   })?;
   if is_gzip(&data) {
      data = decompress_gz(&data).map_err(|e| malformed(path, format!("bad gzip stream: {}", e)))?;
   }

   let blob = if is_zip(&data) {
      read_npz(path, data)?
   } else {
      read_pickle(path, &data)?
   };

   info!(path = %path.display(), keys = ?blob.keys().collect::<Vec<_>>(), "dataset loaded");
   for (key, value) in blob.iter() {
      if let Value::Unsupported { reason } = value {
         warn!(key, reason = reason.as_str(), "entry is not a numeric array");
      }
   }
   Ok(blob)
}

fn malformed(path: &Path, reason: String) -> LoadError {
   LoadError::Malformed {
      path: path.to_path_buf(),
      reason,
   }
}

fn read_pickle(path: &Path, data: &[u8]) -> Result<Blob, LoadError> {
   let pickle = pickle::parse(data).map_err(|e| malformed(path, e.to_string()))?;

   match pickle.get(pickle.root()) {
      Object::Dict(entries) => Ok(entries
         .iter()
         .map(|&(key, value)| (key_to_string(&pickle, key), object_to_value(&pickle, value)))
         .collect()),
      other => Err(LoadError::NotAMapping {
         path: path.to_path_buf(),
         found: other.kind().to_owned(),
      }),
   }
}

fn key_to_string(pickle: &Pickle, key: Id) -> String {
   match pickle.get(key) {
      Object::String(s) => s.clone(),
      Object::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
      Object::Int(i) => i.to_string(),
      other => format!("{:?}", other),
   }
}

enum Scalar {
   Int(i64),
   Float(f64),
}

fn object_to_value(pickle: &Pickle, id: Id) -> Value {
   let array = match pickle.get(id) {
      Object::Call { callable, args, state } if !numpy::is_scalar(pickle, *callable) => {
         numpy::array(pickle, *callable, *args, *state)
      }
      _ => list_to_array(pickle, id),
   };
   match array {
      Ok(array) => Value::Array(array),
      Err(reason) => Value::Unsupported { reason },
   }
}

/// Converts a scalar or a rectangular nested list into an array. Mixed int
/// and float elements promote to float.
fn list_to_array(pickle: &Pickle, id: Id) -> Result<ArrayValue, String> {
   let shape = infer_shape(pickle, id);
   let mut scalars = Vec::with_capacity(shape.iter().product());
   collect_scalars(pickle, id, &shape, &mut scalars)?;

   let array = if scalars.iter().any(|s| matches!(s, Scalar::Float(_))) {
      let data = scalars
         .into_iter()
         .map(|s| match s {
            Scalar::Int(i) => i as f64,
            Scalar::Float(f) => f,
         })
         .collect();
      ArrayValue::Float(ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| e.to_string())?)
   } else {
      let data = scalars
         .into_iter()
         .map(|s| match s {
            Scalar::Int(i) => i,
            Scalar::Float(f) => f as i64,
         })
         .collect();
      ArrayValue::Int(ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| e.to_string())?)
   };
   Ok(array)
}

// Shape along the first element at each depth.
fn infer_shape(pickle: &Pickle, id: Id) -> Vec<usize> {
   let mut shape = Vec::new();
   let mut current = id;
   while let Some(items) = pickle.sequence(current) {
      shape.push(items.len());
      match items.first() {
         Some(&first) => current = first,
         None => break,
      }
   }
   shape
}

fn collect_scalars(pickle: &Pickle, id: Id, shape: &[usize], out: &mut Vec<Scalar>) -> Result<(), String> {
   match (shape.split_first(), pickle.sequence(id)) {
      (Some((&len, rest)), Some(items)) => {
         if items.len() != len {
            return Err(format!(
               "ragged nested list (expected length {}, found {})",
               len,
               items.len()
            ));
         }
         items
            .iter()
            .try_for_each(|&item| collect_scalars(pickle, item, rest, out))
      }
      (None, None) => {
         out.push(to_scalar(pickle, id)?);
         Ok(())
      }
      _ => Err("ragged nested list (mixed nesting depth)".to_owned()),
   }
}

fn to_scalar(pickle: &Pickle, id: Id) -> Result<Scalar, String> {
   match pickle.get(id) {
      Object::Int(i) => Ok(Scalar::Int(*i)),
      Object::Float(f) => Ok(Scalar::Float(*f)),
      Object::BigInt => Err("integer does not fit in 64 bits".to_owned()),
      Object::Call { callable, args, .. } if numpy::is_scalar(pickle, *callable) => {
         let scalar = match numpy::scalar(pickle, *args)? {
            Elements::Int(v) => v.first().copied().map(Scalar::Int),
            Elements::Float(v) => v.first().copied().map(Scalar::Float),
         };
         scalar.ok_or_else(|| "numpy scalar without data".to_owned())
      }
      other => Err(format!("{} is not numeric", other.kind())),
   }
}

fn read_npz(path: &Path, data: Vec<u8>) -> Result<Blob, LoadError> {
   let mut npz = NpzReader::new(Cursor::new(data)).map_err(|e| malformed(path, e.to_string()))?;
   let names = npz.names().map_err(|e| malformed(path, e.to_string()))?;

   let mut blob = Blob::new();
   for name in names {
      let value = read_npz_entry(&mut npz, &name);
      let key = name.strip_suffix(".npy").unwrap_or(&name).to_owned();
      blob.insert(key, value);
   }
   Ok(blob)
}

fn try_read<R, T>(npz: &mut NpzReader<R>, name: &str) -> Option<ArrayD<T>>
where
   R: Read + Seek,
   T: ReadableElement,
{
   npz.by_name(name).ok()
}

// The npy header fixes the element type, so each supported type is tried in
// turn until one matches.
fn read_npz_entry<R: Read + Seek>(npz: &mut NpzReader<R>, name: &str) -> Value {
   if let Some(a) = try_read::<_, u8>(npz, name) {
      return ArrayValue::Int(a.mapv(i64::from)).into();
   }
   if let Some(a) = try_read::<_, i8>(npz, name) {
      return ArrayValue::Int(a.mapv(i64::from)).into();
   }
   if let Some(a) = try_read::<_, u16>(npz, name) {
      return ArrayValue::Int(a.mapv(i64::from)).into();
   }
   if let Some(a) = try_read::<_, i16>(npz, name) {
      return ArrayValue::Int(a.mapv(i64::from)).into();
   }
   if let Some(a) = try_read::<_, u32>(npz, name) {
      return ArrayValue::Int(a.mapv(i64::from)).into();
   }
   if let Some(a) = try_read::<_, i32>(npz, name) {
      return ArrayValue::Int(a.mapv(i64::from)).into();
   }
   if let Some(a) = try_read::<_, i64>(npz, name) {
      return ArrayValue::Int(a).into();
   }
   if let Some(a) = try_read::<_, u64>(npz, name) {
      if a.iter().any(|&v| i64::try_from(v).is_err()) {
         return Value::Unsupported {
            reason: "uint64 values exceed the int64 range".to_owned(),
         };
      }
      return ArrayValue::Int(a.mapv(|v| v as i64)).into();
   }
   if let Some(a) = try_read::<_, f32>(npz, name) {
      return ArrayValue::Float(a.mapv(f64::from)).into();
   }
   if let Some(a) = try_read::<_, f64>(npz, name) {
      return ArrayValue::Float(a).into();
   }
   Value::Unsupported {
      reason: "unreadable member or non-numeric dtype".to_owned(),
   }
}
