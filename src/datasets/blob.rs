use ndarray::ArrayD;

/// A numeric array decoded from a dataset file.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayValue {
   /// Signed or unsigned integer elements.
   Int(ArrayD<i64>),
   /// Floating point elements.
   Float(ArrayD<f64>),
}

impl ArrayValue {
   pub fn shape(&self) -> &[usize] {
      match self {
         ArrayValue::Int(a) => a.shape(),
         ArrayValue::Float(a) => a.shape(),
      }
   }

   pub fn is_integral(&self) -> bool {
      matches!(self, ArrayValue::Int(_))
   }

   pub fn dtype(&self) -> &'static str {
      match self {
         ArrayValue::Int(_) => "int64",
         ArrayValue::Float(_) => "float64",
      }
   }

   pub fn into_f64(self) -> ArrayD<f64> {
      match self {
         ArrayValue::Int(a) => a.mapv(|v| v as f64),
         ArrayValue::Float(a) => a,
      }
   }
}

impl From<ArrayD<i64>> for ArrayValue {
   fn from(array: ArrayD<i64>) -> Self {
      ArrayValue::Int(array)
   }
}

impl From<ArrayD<f64>> for ArrayValue {
   fn from(array: ArrayD<f64>) -> Self {
      ArrayValue::Float(array)
   }
}

/// One entry of a [`Blob`]. Entries that are not numeric arrays are kept so
/// they show up in diagnostics, but never take part in detection.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
   Array(ArrayValue),
   Unsupported { reason: String },
}

impl From<ArrayValue> for Value {
   fn from(array: ArrayValue) -> Self {
      Value::Array(array)
   }
}

impl From<ArrayD<i64>> for Value {
   fn from(array: ArrayD<i64>) -> Self {
      Value::Array(ArrayValue::Int(array))
   }
}

impl From<ArrayD<f64>> for Value {
   fn from(array: ArrayD<f64>) -> Self {
      Value::Array(ArrayValue::Float(array))
   }
}

/// Mapping of named values loaded from a dataset file, in the order the file
/// stores them: pickle dict insertion order, npz member order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Blob {
   entries: Vec<(String, Value)>,
}

impl Blob {
   pub fn new() -> Blob {
      Blob::default()
   }

   /// Inserts `value` under `key`, replacing any earlier entry with that key
   /// in place.
   pub fn insert<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) {
      let key = key.into();
      let value = value.into();
      match self.entries.iter_mut().find(|(k, _)| *k == key) {
         Some(entry) => entry.1 = value,
         None => self.entries.push((key, value)),
      }
   }

   pub fn get(&self, key: &str) -> Option<&Value> {
      self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
   }

   pub fn remove(&mut self, key: &str) -> Option<Value> {
      let index = self.entries.iter().position(|(k, _)| k == key)?;
      Some(self.entries.remove(index).1)
   }

   pub fn keys(&self) -> impl Iterator<Item = &str> {
      self.entries.iter().map(|(k, _)| k.as_str())
   }

   pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
      self.entries.iter().map(|(k, v)| (k.as_str(), v))
   }

   /// Entries holding numeric arrays.
   pub fn arrays(&self) -> impl Iterator<Item = (&str, &ArrayValue)> {
      self.iter().filter_map(|(k, v)| match v {
         Value::Array(a) => Some((k, a)),
         Value::Unsupported { .. } => None,
      })
   }

   pub fn len(&self) -> usize {
      self.entries.len()
   }

   pub fn is_empty(&self) -> bool {
      self.entries.is_empty()
   }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Blob {
   fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
      let mut blob = Blob::new();
      for (key, value) in iter {
         blob.insert(key, value);
      }
      blob
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use ndarray::{ArrayD, IxDyn};

   #[test]
   fn insert_replaces_in_place() {
      let mut blob = Blob::new();
      blob.insert("a", ArrayD::<i64>::zeros(IxDyn(&[2])));
      blob.insert("b", ArrayD::<f64>::zeros(IxDyn(&[3])));
      blob.insert("a", ArrayD::<f64>::zeros(IxDyn(&[4])));

      assert_eq!(blob.keys().collect::<Vec<_>>(), vec!["a", "b"]);
      match blob.get("a") {
         Some(Value::Array(a)) => assert_eq!(a.shape(), &[4]),
         other => panic!("unexpected entry {:?}", other),
      }
   }

   #[test]
   fn arrays_skips_unsupported_entries() {
      let mut blob = Blob::new();
      blob.insert(
         "name",
         Value::Unsupported {
            reason: "string".to_owned(),
         },
      );
      blob.insert("x", ArrayD::<i64>::zeros(IxDyn(&[1])));

      let keys: Vec<&str> = blob.arrays().map(|(k, _)| k).collect();
      assert_eq!(keys, vec!["x"]);
      assert_eq!(blob.len(), 2);
   }

   #[test]
   fn int_arrays_convert_to_f64() {
      let value = ArrayValue::Int(ArrayD::from_shape_vec(IxDyn(&[3]), vec![0, 7, 255]).unwrap());
      assert!(value.is_integral());
      assert_eq!(value.into_f64().into_raw_vec(), vec![0.0, 7.0, 255.0]);
   }
}
