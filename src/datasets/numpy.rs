//! numpy arrays as they appear in pickles.
//!
//! An array pickles as `_reconstruct(ndarray, (0,), b'b')` followed by a
//! BUILD with `(version, shape, dtype, fortran_order, raw_bytes)`. Protocol 5
//! writes `_frombuffer(buffer, dtype, shape, order)` instead. A dtype is
//! `dtype(type_code, align, copy)` built with `(version, byte_order, ...)`.

use super::blob::ArrayValue;
use super::pickle::{Id, Object, Pickle};
use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use std::borrow::Cow;

/// Decoded elements, before they get a shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Elements {
   Int(Vec<i64>),
   Float(Vec<f64>),
}

fn numpy_name(pickle: &Pickle, callable: Id) -> Option<&str> {
   let (module, name) = pickle.global(callable)?;
   (module == "numpy" || module.starts_with("numpy.")).then_some(name)
}

fn describe(pickle: &Pickle, callable: Id) -> String {
   match pickle.global(callable) {
      Some((module, name)) => format!("instance of {}.{}", module, name),
      None => "an object".to_owned(),
   }
}

/// Whether `callable` builds a numpy scalar such as `np.int64(3)`.
pub fn is_scalar(pickle: &Pickle, callable: Id) -> bool {
   numpy_name(pickle, callable) == Some("scalar")
}

/// Decodes the array that `callable(*args)` followed by a BUILD with `state`
/// produces, or says why it is not a numeric array.
pub fn array(pickle: &Pickle, callable: Id, args: Id, state: Option<Id>) -> Result<ArrayValue, String> {
   match numpy_name(pickle, callable) {
      Some("_reconstruct") => {
         let state = state.ok_or("numpy array without state")?;
         reconstruct(pickle, state)
      }
      Some("_frombuffer") => frombuffer(pickle, args),
      _ => Err(format!("{} is not a numeric array", describe(pickle, callable))),
   }
}

/// Elements of `scalar(dtype, raw_bytes)`.
pub fn scalar(pickle: &Pickle, args: Id) -> Result<Elements, String> {
   let &[dtype, data] = tuple(pickle, args, "scalar arguments")? else {
      return Err("numpy scalar needs a dtype and its data".to_owned());
   };
   Dtype::from_object(pickle, dtype)?.decode(&bytes(pickle, data)?)
}

fn reconstruct(pickle: &Pickle, state: Id) -> Result<ArrayValue, String> {
   let items = tuple(pickle, state, "array state")?;
   // Versioned states lead with the version number.
   let items = match items.len() {
      5 => &items[1..],
      4 => items,
      n => return Err(format!("array state has {} items, expected 4 or 5", n)),
   };
   let shape = shape(pickle, items[0])?;
   let dtype = Dtype::from_object(pickle, items[1])?;
   let fortran = match pickle.get(items[2]) {
      Object::Bool(flag) => *flag,
      Object::Int(flag) => *flag != 0,
      other => return Err(format!("fortran flag is {}", other.kind())),
   };
   let raw = bytes(pickle, items[3])?;
   build(&shape, fortran, dtype.decode(&raw)?)
}

fn frombuffer(pickle: &Pickle, args: Id) -> Result<ArrayValue, String> {
   let &[buffer, dtype, shape_id, order] = tuple(pickle, args, "_frombuffer arguments")? else {
      return Err("_frombuffer needs a buffer, a dtype, a shape and an order".to_owned());
   };
   let shape = shape(pickle, shape_id)?;
   let dtype = Dtype::from_object(pickle, dtype)?;
   let raw = bytes(pickle, buffer)?;
   build(&shape, pickle.str(order) == Some("F"), dtype.decode(&raw)?)
}

fn tuple<'p>(pickle: &'p Pickle, id: Id, what: &str) -> Result<&'p [Id], String> {
   pickle
      .sequence(id)
      .ok_or_else(|| format!("{} is {}, expected a tuple", what, pickle.get(id).kind()))
}

fn shape(pickle: &Pickle, id: Id) -> Result<Vec<usize>, String> {
   tuple(pickle, id, "array shape")?
      .iter()
      .map(|&dim| match pickle.get(dim) {
         Object::Int(n) => usize::try_from(*n).map_err(|_| format!("negative dimension {}", n)),
         other => Err(format!("dimension is {}", other.kind())),
      })
      .collect()
}

/// Raw data of an array, including the forms protocol 2 uses for `bytes`
/// written from Python 3.
fn bytes<'p>(pickle: &'p Pickle, id: Id) -> Result<Cow<'p, [u8]>, String> {
   match pickle.get(id) {
      Object::Bytes(data) => Ok(Cow::Borrowed(data)),
      Object::String(text) => latin1(text).map(Cow::Owned),
      Object::Call { callable, args, .. } => {
         let items = tuple(pickle, *args, "bytes arguments")?;
         match (pickle.global(*callable), items) {
            (Some(("_codecs", "encode")), &[text, _]) => {
               let text = pickle.str(text).ok_or("_codecs.encode of something that is not a str")?;
               latin1(text).map(Cow::Owned)
            }
            (Some(("builtins" | "__builtin__", "bytes" | "bytearray")), &[]) => Ok(Cow::Owned(Vec::new())),
            (Some(("builtins" | "__builtin__", "bytes" | "bytearray")), &[inner]) => bytes(pickle, inner),
            (Some(("builtins" | "__builtin__", "bytes" | "bytearray")), &[text, _]) => {
               let text = pickle.str(text).ok_or("bytes of something that is not a str")?;
               latin1(text).map(Cow::Owned)
            }
            _ => Err(format!("{} is not a byte buffer", describe(pickle, *callable))),
         }
      }
      other => Err(format!("array data is {}, expected bytes", other.kind())),
   }
}

fn latin1(text: &str) -> Result<Vec<u8>, String> {
   text
      .chars()
      .map(|c| u8::try_from(c).map_err(|_| format!("character {:?} is not latin-1", c)))
      .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Dtype {
   kind: char,
   size: usize,
   big_endian: bool,
}

impl Dtype {
   fn from_object(pickle: &Pickle, id: Id) -> Result<Dtype, String> {
      let (args, state) = match pickle.get(id) {
         Object::Call {
            callable,
            args,
            state,
         } if numpy_name(pickle, *callable) == Some("dtype") => (*args, *state),
         other => return Err(format!("dtype is {}", other.kind())),
      };
      let code = tuple(pickle, args, "dtype arguments")?
         .first()
         .and_then(|&code| pickle.str(code))
         .ok_or("dtype without a type code")?;
      // Second state item, `|` when byte order does not apply.
      let order = state
         .and_then(|state| pickle.sequence(state))
         .and_then(|items| items.get(1))
         .and_then(|&order| pickle.str(order));
      Dtype::parse(code, order)
   }

   fn parse(code: &str, order: Option<&str>) -> Result<Dtype, String> {
      let unsupported = || format!("dtype {} is not supported", code);
      let (prefix, rest) = match code.chars().next() {
         Some(c @ ('<' | '>' | '|' | '=')) => (Some(c), &code[1..]),
         _ => (None, code),
      };
      let mut chars = rest.chars();
      let kind = chars.next().ok_or_else(unsupported)?;
      let size = chars.as_str().parse().map_err(|_| unsupported())?;
      let big_endian = match order.and_then(|o| o.chars().next()).or(prefix) {
         Some('>') => true,
         Some('=') => cfg!(target_endian = "big"),
         _ => false,
      };
      Ok(Dtype {
         kind,
         size,
         big_endian,
      })
   }

   fn decode(self, raw: &[u8]) -> Result<Elements, String> {
      if self.size == 0 || raw.len() % self.size != 0 {
         return Err(format!(
            "{} bytes of data do not split into {}-byte elements",
            raw.len(),
            self.size
         ));
      }
      let big = self.big_endian;
      let elements = match (self.kind, self.size) {
         ('u', 1) => Elements::Int(raw.iter().map(|&b| i64::from(b)).collect()),
         ('i', 1) => Elements::Int(raw.iter().map(|&b| i64::from(b as i8)).collect()),
         ('u', 2) => Elements::Int(words::<2>(raw, big).map(|w| i64::from(u16::from_le_bytes(w))).collect()),
         ('i', 2) => Elements::Int(words::<2>(raw, big).map(|w| i64::from(i16::from_le_bytes(w))).collect()),
         ('u', 4) => Elements::Int(words::<4>(raw, big).map(|w| i64::from(u32::from_le_bytes(w))).collect()),
         ('i', 4) => Elements::Int(words::<4>(raw, big).map(|w| i64::from(i32::from_le_bytes(w))).collect()),
         ('i', 8) => Elements::Int(words::<8>(raw, big).map(i64::from_le_bytes).collect()),
         ('u', 8) => Elements::Int(
            words::<8>(raw, big)
               .map(|w| i64::try_from(u64::from_le_bytes(w)))
               .collect::<Result<Vec<i64>, _>>()
               .map_err(|_| "uint64 values exceed the int64 range".to_owned())?,
         ),
         ('f', 4) => Elements::Float(words::<4>(raw, big).map(|w| f64::from(f32::from_le_bytes(w))).collect()),
         ('f', 8) => Elements::Float(words::<8>(raw, big).map(f64::from_le_bytes).collect()),
         (kind, size) => return Err(format!("dtype {}{} is not numeric", kind, size)),
      };
      Ok(elements)
   }
}

/// Fixed-size elements of `raw`, reordered to little-endian.
fn words<const N: usize>(raw: &[u8], big_endian: bool) -> impl Iterator<Item = [u8; N]> + '_ {
   raw.chunks_exact(N).map(move |chunk| {
      let mut word = [0u8; N];
      word.copy_from_slice(chunk);
      if big_endian {
         word.reverse();
      }
      word
   })
}

fn build(shape: &[usize], fortran: bool, elements: Elements) -> Result<ArrayValue, String> {
   Ok(match elements {
      Elements::Int(data) => ArrayValue::Int(shaped(shape, fortran, data)?),
      Elements::Float(data) => ArrayValue::Float(shaped(shape, fortran, data)?),
   })
}

fn shaped<T>(shape: &[usize], fortran: bool, data: Vec<T>) -> Result<ArrayD<T>, String> {
   let dim = IxDyn(shape);
   let array = if fortran {
      ArrayD::from_shape_vec(dim.f(), data)
   } else {
      ArrayD::from_shape_vec(dim, data)
   };
   array.map_err(|e| format!("data does not fill shape {:?}: {}", shape, e))
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::datasets::pickle::op;
   use crate::datasets::pickle::testing::Ops;
   use crate::datasets::pickle::parse;

   fn decode(code: &str, order: &str, raw: &[u8]) -> Result<Elements, String> {
      Dtype::parse(code, Some(order)).unwrap().decode(raw)
   }

   #[test]
   fn type_codes() {
      assert_eq!(
         Dtype::parse("<f8", None).unwrap(),
         Dtype {
            kind: 'f',
            size: 8,
            big_endian: false
         }
      );
      assert!(Dtype::parse("i2", Some(">")).unwrap().big_endian);
      assert!(Dtype::parse("U", None).is_err());
      assert!(Dtype::parse("", None).is_err());
   }

   #[test]
   fn elements_follow_byte_order() {
      assert_eq!(decode("i2", "<", &[0x01, 0x02]), Ok(Elements::Int(vec![0x0201])));
      assert_eq!(decode("i2", ">", &[0x01, 0x02]), Ok(Elements::Int(vec![0x0102])));
      assert_eq!(decode("i1", "|", &[0xff]), Ok(Elements::Int(vec![-1])));
      assert_eq!(
         decode("f4", "<", &1.5f32.to_le_bytes()),
         Ok(Elements::Float(vec![1.5]))
      );
   }

   #[test]
   fn unusable_dtypes_are_rejected() {
      assert!(decode("u8", "<", &u64::MAX.to_le_bytes()).unwrap_err().contains("int64"));
      assert!(decode("b1", "|", &[1, 0]).unwrap_err().contains("not numeric"));
      assert!(decode("i4", "<", &[0, 0, 0]).is_err());
   }

   #[test]
   fn fortran_order_is_column_major() {
      let raw = [1u8, 2, 3, 4, 5, 6];
      let bytes = Ops::new(2)
         .ndarray(&[2, 3], |o| o.dtype("u1", "|"), true, &raw)
         .finish();
      let pickle = parse(&bytes).unwrap();
      let Object::Call {
         callable,
         args,
         state,
      } = *pickle.get(pickle.root())
      else {
         panic!("root is not an array");
      };

      match array(&pickle, callable, args, state).unwrap() {
         ArrayValue::Int(a) => {
            assert_eq!(a.shape(), &[2, 3]);
            assert_eq!(a[[0, 1]], 3);
            assert_eq!(a[[1, 0]], 2);
         }
         other => panic!("unexpected array {:?}", other),
      }
   }

   #[test]
   fn protocol_two_latin1_data() {
      // `_codecs.encode("\x00\xff", "latin1")`, how protocol 2 stores bytes.
      let bytes = Ops::new(2)
         .global("_codecs", "encode")
         .str("\u{0}\u{ff}")
         .str("latin1")
         .op(op::TUPLE2)
         .op(op::REDUCE)
         .finish();
      let pickle = parse(&bytes).unwrap();
      assert_eq!(bytes_of(&pickle), vec![0x00, 0xff]);
   }

   fn bytes_of(pickle: &Pickle) -> Vec<u8> {
      bytes(pickle, pickle.root()).unwrap().into_owned()
   }
}
