//! Reads Python pickles without running any Python.
//!
//! Objects land in an arena and refer to each other by [`Id`], so memo
//! references share one object just as they do in Python, and a BUILD seen
//! after an object was memoized is visible through every reference. Class
//! references stay [`Object::Global`] and constructor calls stay
//! [`Object::Call`]; the caller decides which ones it understands.

use crate::error::PickleError;
use std::collections::HashMap;

pub type Id = usize;

#[derive(Debug, Clone, PartialEq)]
pub enum Object {
   None,
   Bool(bool),
   Int(i64),
   /// Integer outside the `i64` range.
   BigInt,
   Float(f64),
   Bytes(Vec<u8>),
   String(String),
   List(Vec<Id>),
   Tuple(Vec<Id>),
   Set(Vec<Id>),
   Dict(Vec<(Id, Id)>),
   Global { module: String, name: String },
   /// `callable(*args)`, plus the state handed to BUILD, if any.
   Call {
      callable: Id,
      args: Id,
      state: Option<Id>,
   },
}

impl Object {
   /// Short description used in error messages.
   pub fn kind(&self) -> &'static str {
      match self {
         Object::None => "None",
         Object::Bool(_) => "a bool",
         Object::Int(_) | Object::BigInt => "an int",
         Object::Float(_) => "a float",
         Object::Bytes(_) => "bytes",
         Object::String(_) => "a str",
         Object::List(_) => "a list",
         Object::Tuple(_) => "a tuple",
         Object::Set(_) => "a set",
         Object::Dict(_) => "a dict",
         Object::Global { .. } => "a class",
         Object::Call { .. } => "an object",
      }
   }
}

#[derive(Debug, Clone)]
pub struct Pickle {
   objects: Vec<Object>,
   root: Id,
}

impl Pickle {
   pub fn root(&self) -> Id {
      self.root
   }

   pub fn get(&self, id: Id) -> &Object {
      &self.objects[id]
   }

   /// Items of a list or tuple.
   pub fn sequence(&self, id: Id) -> Option<&[Id]> {
      match self.get(id) {
         Object::List(items) | Object::Tuple(items) => Some(items),
         _ => None,
      }
   }

   pub fn str(&self, id: Id) -> Option<&str> {
      match self.get(id) {
         Object::String(s) => Some(s),
         _ => None,
      }
   }

   /// `(module, name)` of a class reference.
   pub fn global(&self, id: Id) -> Option<(&str, &str)> {
      match self.get(id) {
         Object::Global { module, name } => Some((module, name)),
         _ => None,
      }
   }
}

pub(crate) mod op {
   pub const MARK: u8 = b'(';
   pub const STOP: u8 = b'.';
   pub const POP: u8 = b'0';
   pub const POP_MARK: u8 = b'1';
   pub const DUP: u8 = b'2';
   pub const FLOAT: u8 = b'F';
   pub const INT: u8 = b'I';
   pub const BININT: u8 = b'J';
   pub const BININT1: u8 = b'K';
   pub const LONG: u8 = b'L';
   pub const BININT2: u8 = b'M';
   pub const NONE: u8 = b'N';
   pub const PERSID: u8 = b'P';
   pub const BINPERSID: u8 = b'Q';
   pub const REDUCE: u8 = b'R';
   pub const STRING: u8 = b'S';
   pub const BINSTRING: u8 = b'T';
   pub const SHORT_BINSTRING: u8 = b'U';
   pub const UNICODE: u8 = b'V';
   pub const BINUNICODE: u8 = b'X';
   pub const APPEND: u8 = b'a';
   pub const BUILD: u8 = b'b';
   pub const GLOBAL: u8 = b'c';
   pub const DICT: u8 = b'd';
   pub const EMPTY_DICT: u8 = b'}';
   pub const APPENDS: u8 = b'e';
   pub const GET: u8 = b'g';
   pub const BINGET: u8 = b'h';
   pub const INST: u8 = b'i';
   pub const LONG_BINGET: u8 = b'j';
   pub const LIST: u8 = b'l';
   pub const EMPTY_LIST: u8 = b']';
   pub const OBJ: u8 = b'o';
   pub const PUT: u8 = b'p';
   pub const BINPUT: u8 = b'q';
   pub const LONG_BINPUT: u8 = b'r';
   pub const SETITEM: u8 = b's';
   pub const TUPLE: u8 = b't';
   pub const EMPTY_TUPLE: u8 = b')';
   pub const SETITEMS: u8 = b'u';
   pub const BINFLOAT: u8 = b'G';

   pub const PROTO: u8 = 0x80;
   pub const NEWOBJ: u8 = 0x81;
   pub const EXT1: u8 = 0x82;
   pub const EXT2: u8 = 0x83;
   pub const EXT4: u8 = 0x84;
   pub const TUPLE1: u8 = 0x85;
   pub const TUPLE2: u8 = 0x86;
   pub const TUPLE3: u8 = 0x87;
   pub const NEWTRUE: u8 = 0x88;
   pub const NEWFALSE: u8 = 0x89;
   pub const LONG1: u8 = 0x8a;
   pub const LONG4: u8 = 0x8b;

   pub const BINBYTES: u8 = b'B';
   pub const SHORT_BINBYTES: u8 = b'C';

   pub const SHORT_BINUNICODE: u8 = 0x8c;
   pub const BINUNICODE8: u8 = 0x8d;
   pub const BINBYTES8: u8 = 0x8e;
   pub const EMPTY_SET: u8 = 0x8f;
   pub const ADDITEMS: u8 = 0x90;
   pub const FROZENSET: u8 = 0x91;
   pub const NEWOBJ_EX: u8 = 0x92;
   pub const STACK_GLOBAL: u8 = 0x93;
   pub const MEMOIZE: u8 = 0x94;
   pub const FRAME: u8 = 0x95;

   pub const BYTEARRAY8: u8 = 0x96;
   pub const NEXT_BUFFER: u8 = 0x97;
   pub const READONLY_BUFFER: u8 = 0x98;
}

/// Decodes one pickle, protocols 0 to 5, up to its STOP opcode.
pub fn parse(data: &[u8]) -> Result<Pickle, PickleError> {
   let mut machine = Machine {
      data,
      pos: 0,
      objects: Vec::new(),
      stack: Vec::new(),
      marks: Vec::new(),
      memo: HashMap::new(),
   };
   let root = machine.run()?;
   Ok(Pickle {
      objects: machine.objects,
      root,
   })
}

struct Machine<'a> {
   data: &'a [u8],
   pos: usize,
   objects: Vec<Object>,
   stack: Vec<Id>,
   /// Stack lengths at each MARK.
   marks: Vec<usize>,
   memo: HashMap<u32, Id>,
}

impl<'a> Machine<'a> {
   fn run(&mut self) -> Result<Id, PickleError> {
      loop {
         let offset = self.pos;
         let opcode = self.read_u8()?;
         match opcode {
            op::PROTO => {
               self.read_u8()?;
            }
            op::FRAME => {
               self.take(8)?;
            }
            op::STOP => return self.pop(offset),

            op::MARK => self.marks.push(self.stack.len()),
            op::POP => {
               if self.stack.len() > self.floor() {
                  self.pop(offset)?;
               } else {
                  self.pop_mark(offset)?;
               }
            }
            op::POP_MARK => {
               self.pop_mark(offset)?;
            }
            op::DUP => {
               let top = self.top(offset)?;
               self.stack.push(top);
            }

            op::NONE => self.push(Object::None),
            op::NEWTRUE => self.push(Object::Bool(true)),
            op::NEWFALSE => self.push(Object::Bool(false)),
            op::INT => {
               let object = match self.read_line()? {
                  "00" => Object::Bool(false),
                  "01" => Object::Bool(true),
                  text => parse_int(text, offset)?,
               };
               self.push(object);
            }
            op::LONG => {
               let text = self.read_line()?;
               let object = parse_int(text.trim_end_matches('L'), offset)?;
               self.push(object);
            }
            op::BININT => {
               let value = i32::from_le_bytes(self.read_array()?);
               self.push(Object::Int(i64::from(value)));
            }
            op::BININT1 => {
               let value = self.read_u8()?;
               self.push(Object::Int(i64::from(value)));
            }
            op::BININT2 => {
               let value = u16::from_le_bytes(self.read_array()?);
               self.push(Object::Int(i64::from(value)));
            }
            op::LONG1 => {
               let len = usize::from(self.read_u8()?);
               let bytes = self.take(len)?;
               self.push(decode_long(bytes));
            }
            op::LONG4 => {
               let len = i32::from_le_bytes(self.read_array()?);
               let len = usize::try_from(len).map_err(|_| invalid("negative LONG4 length", offset))?;
               let bytes = self.take(len)?;
               self.push(decode_long(bytes));
            }
            op::FLOAT => {
               let value = self
                  .read_line()?
                  .parse()
                  .map_err(|_| invalid("malformed FLOAT literal", offset))?;
               self.push(Object::Float(value));
            }
            op::BINFLOAT => {
               let value = f64::from_be_bytes(self.read_array()?);
               self.push(Object::Float(value));
            }

            op::SHORT_BINBYTES | op::SHORT_BINSTRING => {
               let len = usize::from(self.read_u8()?);
               let bytes = self.take(len)?.to_vec();
               self.push(Object::Bytes(bytes));
            }
            op::BINBYTES => {
               let len = self.read_u32_len()?;
               let bytes = self.take(len)?.to_vec();
               self.push(Object::Bytes(bytes));
            }
            op::BINSTRING => {
               let len = i32::from_le_bytes(self.read_array()?);
               let len = usize::try_from(len).map_err(|_| invalid("negative BINSTRING length", offset))?;
               let bytes = self.take(len)?.to_vec();
               self.push(Object::Bytes(bytes));
            }
            op::BINBYTES8 | op::BYTEARRAY8 => {
               let len = self.read_u64_len(offset)?;
               let bytes = self.take(len)?.to_vec();
               self.push(Object::Bytes(bytes));
            }
            op::UNICODE => {
               let text = self.read_line()?.to_owned();
               self.push(Object::String(text));
            }
            op::SHORT_BINUNICODE => {
               let len = usize::from(self.read_u8()?);
               let text = self.read_str(len, offset)?;
               self.push(Object::String(text));
            }
            op::BINUNICODE => {
               let len = self.read_u32_len()?;
               let text = self.read_str(len, offset)?;
               self.push(Object::String(text));
            }
            op::BINUNICODE8 => {
               let len = self.read_u64_len(offset)?;
               let text = self.read_str(len, offset)?;
               self.push(Object::String(text));
            }

            op::EMPTY_LIST => self.push(Object::List(Vec::new())),
            op::EMPTY_TUPLE => self.push(Object::Tuple(Vec::new())),
            op::EMPTY_DICT => self.push(Object::Dict(Vec::new())),
            op::EMPTY_SET => self.push(Object::Set(Vec::new())),
            op::LIST => {
               let items = self.pop_mark(offset)?;
               self.push(Object::List(items));
            }
            op::TUPLE => {
               let items = self.pop_mark(offset)?;
               self.push(Object::Tuple(items));
            }
            op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
               let len = usize::from(opcode - op::TUPLE1 + 1);
               let mut items = Vec::with_capacity(len);
               for _ in 0..len {
                  items.push(self.pop(offset)?);
               }
               items.reverse();
               self.push(Object::Tuple(items));
            }
            op::DICT => {
               let items = self.pop_mark(offset)?;
               let pairs = pairs(items, offset)?;
               self.push(Object::Dict(pairs));
            }
            op::FROZENSET => {
               let items = self.pop_mark(offset)?;
               self.push(Object::Set(items));
            }

            op::APPEND => {
               let item = self.pop(offset)?;
               self.extend(vec![item], offset)?;
            }
            op::APPENDS | op::ADDITEMS => {
               let items = self.pop_mark(offset)?;
               self.extend(items, offset)?;
            }
            op::SETITEM => {
               let value = self.pop(offset)?;
               let key = self.pop(offset)?;
               self.set_items(vec![(key, value)], offset)?;
            }
            op::SETITEMS => {
               let items = self.pop_mark(offset)?;
               let pairs = pairs(items, offset)?;
               self.set_items(pairs, offset)?;
            }

            op::GLOBAL => {
               let module = self.read_line()?.to_owned();
               let name = self.read_line()?.to_owned();
               self.push(Object::Global { module, name });
            }
            op::STACK_GLOBAL => {
               let name = self.pop(offset)?;
               let module = self.pop(offset)?;
               let (module, name) = match (self.get(module), self.get(name)) {
                  (Object::String(module), Object::String(name)) => (module.clone(), name.clone()),
                  _ => return Err(invalid("STACK_GLOBAL needs two strings", offset)),
               };
               self.push(Object::Global { module, name });
            }
            op::REDUCE | op::NEWOBJ => {
               let args = self.pop(offset)?;
               let callable = self.pop(offset)?;
               self.push(Object::Call {
                  callable,
                  args,
                  state: None,
               });
            }
            op::NEWOBJ_EX => {
               let _kwargs = self.pop(offset)?;
               let args = self.pop(offset)?;
               let callable = self.pop(offset)?;
               self.push(Object::Call {
                  callable,
                  args,
                  state: None,
               });
            }
            op::BUILD => {
               let new_state = self.pop(offset)?;
               let target = self.top(offset)?;
               match &mut self.objects[target] {
                  Object::Call { state, .. } => *state = Some(new_state),
                  _ => return Err(invalid("BUILD on an object without a constructor", offset)),
               }
            }

            op::PUT => {
               let key = self.read_line()?;
               let key = key.parse().map_err(|_| invalid("malformed PUT key", offset))?;
               self.put(key, offset)?;
            }
            op::BINPUT => {
               let key = self.read_u8()?;
               self.put(u32::from(key), offset)?;
            }
            op::LONG_BINPUT => {
               let key = u32::from_le_bytes(self.read_array()?);
               self.put(key, offset)?;
            }
            op::MEMOIZE => {
               let key = u32::try_from(self.memo.len()).map_err(|_| invalid("memo overflow", offset))?;
               self.put(key, offset)?;
            }
            op::GET => {
               let key = self.read_line()?;
               let key = key.parse().map_err(|_| invalid("malformed GET key", offset))?;
               self.get_memo(key, offset)?;
            }
            op::BINGET => {
               let key = self.read_u8()?;
               self.get_memo(u32::from(key), offset)?;
            }
            op::LONG_BINGET => {
               let key = u32::from_le_bytes(self.read_array()?);
               self.get_memo(key, offset)?;
            }

            op::STRING => return Err(unsupported("STRING", offset)),
            op::PERSID | op::BINPERSID => return Err(unsupported("PERSID", offset)),
            op::EXT1 | op::EXT2 | op::EXT4 => return Err(unsupported("EXT", offset)),
            op::INST | op::OBJ => return Err(unsupported("INST", offset)),
            op::NEXT_BUFFER | op::READONLY_BUFFER => return Err(unsupported("NEXT_BUFFER", offset)),
            _ => return Err(PickleError::UnknownOpcode { opcode, offset }),
         }
      }
   }

   fn get(&self, id: Id) -> &Object {
      &self.objects[id]
   }

   fn push(&mut self, object: Object) {
      self.objects.push(object);
      self.stack.push(self.objects.len() - 1);
   }

   fn floor(&self) -> usize {
      self.marks.last().copied().unwrap_or(0)
   }

   fn top(&self, offset: usize) -> Result<Id, PickleError> {
      match self.stack.last() {
         Some(&id) if self.stack.len() > self.floor() => Ok(id),
         _ => Err(invalid("stack underflow", offset)),
      }
   }

   fn pop(&mut self, offset: usize) -> Result<Id, PickleError> {
      let id = self.top(offset)?;
      self.stack.pop();
      Ok(id)
   }

   fn pop_mark(&mut self, offset: usize) -> Result<Vec<Id>, PickleError> {
      let mark = self.marks.pop().ok_or(invalid("no MARK to pop", offset))?;
      Ok(self.stack.split_off(mark))
   }

   fn extend(&mut self, items: Vec<Id>, offset: usize) -> Result<(), PickleError> {
      let target = self.top(offset)?;
      match &mut self.objects[target] {
         Object::List(list) | Object::Set(list) => {
            list.extend(items);
            Ok(())
         }
         _ => Err(invalid("APPEND to something that is not a list", offset)),
      }
   }

   fn set_items(&mut self, items: Vec<(Id, Id)>, offset: usize) -> Result<(), PickleError> {
      let target = self.top(offset)?;
      match &mut self.objects[target] {
         Object::Dict(dict) => {
            dict.extend(items);
            Ok(())
         }
         _ => Err(invalid("SETITEM on something that is not a dict", offset)),
      }
   }

   fn put(&mut self, key: u32, offset: usize) -> Result<(), PickleError> {
      let top = self.top(offset)?;
      self.memo.insert(key, top);
      Ok(())
   }

   fn get_memo(&mut self, key: u32, offset: usize) -> Result<(), PickleError> {
      let id = *self.memo.get(&key).ok_or(invalid("memo key was never stored", offset))?;
      self.stack.push(id);
      Ok(())
   }

   fn take(&mut self, len: usize) -> Result<&'a [u8], PickleError> {
      let data: &'a [u8] = self.data;
      let end = self
         .pos
         .checked_add(len)
         .filter(|&end| end <= data.len())
         .ok_or(PickleError::Truncated(data.len()))?;
      let bytes = &data[self.pos..end];
      self.pos = end;
      Ok(bytes)
   }

   fn read_u8(&mut self) -> Result<u8, PickleError> {
      Ok(self.take(1)?[0])
   }

   fn read_array<const N: usize>(&mut self) -> Result<[u8; N], PickleError> {
      let mut buf = [0u8; N];
      buf.copy_from_slice(self.take(N)?);
      Ok(buf)
   }

   fn read_u32_len(&mut self) -> Result<usize, PickleError> {
      Ok(u32::from_le_bytes(self.read_array()?) as usize)
   }

   fn read_u64_len(&mut self, offset: usize) -> Result<usize, PickleError> {
      let len = u64::from_le_bytes(self.read_array()?);
      usize::try_from(len).map_err(|_| invalid("length does not fit in memory", offset))
   }

   fn read_str(&mut self, len: usize, offset: usize) -> Result<String, PickleError> {
      let bytes = self.take(len)?;
      String::from_utf8(bytes.to_vec()).map_err(|_| invalid("string is not valid UTF-8", offset))
   }

   /// Text up to the next newline, which is consumed.
   fn read_line(&mut self) -> Result<&'a str, PickleError> {
      let offset = self.pos;
      let rest = &self.data[self.pos..];
      let len = rest
         .iter()
         .position(|&b| b == b'\n')
         .ok_or(PickleError::Truncated(self.data.len()))?;
      let line = self.take(len + 1)?;
      let line = line[..len].strip_suffix(b"\r").unwrap_or(&line[..len]);
      std::str::from_utf8(line).map_err(|_| invalid("line is not valid UTF-8", offset))
   }
}

fn invalid(what: &'static str, offset: usize) -> PickleError {
   PickleError::Invalid { what, offset }
}

fn unsupported(name: &'static str, offset: usize) -> PickleError {
   PickleError::Unsupported { name, offset }
}

fn pairs(items: Vec<Id>, offset: usize) -> Result<Vec<(Id, Id)>, PickleError> {
   if items.len() % 2 != 0 {
      return Err(invalid("odd number of items for a dict", offset));
   }
   Ok(items.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect())
}

fn parse_int(text: &str, offset: usize) -> Result<Object, PickleError> {
   match text.parse::<i64>() {
      Ok(value) => Ok(Object::Int(value)),
      Err(_) if !text.is_empty() && text.trim_start_matches('-').bytes().all(|b| b.is_ascii_digit()) => {
         Ok(Object::BigInt)
      }
      Err(_) => Err(invalid("malformed INT literal", offset)),
   }
}

/// Little-endian two's complement, as LONG1 and LONG4 store it.
fn decode_long(bytes: &[u8]) -> Object {
   match bytes.last() {
      None => Object::Int(0),
      Some(_) if bytes.len() > 8 => Object::BigInt,
      Some(&last) => {
         let mut buf = if last & 0x80 != 0 { [0xff; 8] } else { [0; 8] };
         buf[..bytes.len()].copy_from_slice(bytes);
         Object::Int(i64::from_le_bytes(buf))
      }
   }
}

#[cfg(test)]
pub(crate) mod testing {
   use super::op;

   /// Assembles a pickle opcode by opcode.
   pub struct Ops(Vec<u8>);

   impl Ops {
      pub fn new(protocol: u8) -> Ops {
         Ops(vec![op::PROTO, protocol])
      }

      pub fn op(mut self, opcode: u8) -> Ops {
         self.0.push(opcode);
         self
      }

      pub fn int(mut self, value: i32) -> Ops {
         self.0.push(op::BININT);
         self.0.extend_from_slice(&value.to_le_bytes());
         self
      }

      pub fn str(mut self, text: &str) -> Ops {
         self.0.push(op::BINUNICODE);
         self.0.extend_from_slice(&(text.len() as u32).to_le_bytes());
         self.0.extend_from_slice(text.as_bytes());
         self
      }

      pub fn bytes(mut self, data: &[u8]) -> Ops {
         self.0.push(op::BINBYTES);
         self.0.extend_from_slice(&(data.len() as u32).to_le_bytes());
         self.0.extend_from_slice(data);
         self
      }

      pub fn global(mut self, module: &str, name: &str) -> Ops {
         self.0.push(op::GLOBAL);
         self.0.extend_from_slice(format!("{}\n{}\n", module, name).as_bytes());
         self
      }

      pub fn put(self, key: u8) -> Ops {
         self.op(op::BINPUT).op(key)
      }

      pub fn get(self, key: u8) -> Ops {
         self.op(op::BINGET).op(key)
      }

      /// `numpy.dtype(code, False, True)` built with byte order `order`.
      pub fn dtype(self, code: &str, order: &str) -> Ops {
         self.dtype_reduce(code).dtype_state(order)
      }

      /// Like [`Ops::dtype`], memoized under `key` before its state is set.
      pub fn dtype_memo(self, code: &str, order: &str, key: u8) -> Ops {
         self.dtype_reduce(code).put(key).dtype_state(order)
      }

      fn dtype_reduce(self, code: &str) -> Ops {
         self
            .global("numpy", "dtype")
            .str(code)
            .op(op::NEWFALSE)
            .op(op::NEWTRUE)
            .op(op::TUPLE3)
            .op(op::REDUCE)
      }

      fn dtype_state(self, order: &str) -> Ops {
         self
            .op(op::MARK)
            .int(3)
            .str(order)
            .op(op::NONE)
            .op(op::NONE)
            .op(op::NONE)
            .int(-1)
            .int(-1)
            .int(0)
            .op(op::TUPLE)
            .op(op::BUILD)
      }

      /// An array as numpy pickles it: `_reconstruct(ndarray, (0,), b'b')`
      /// built with `(1, shape, dtype, fortran, raw)`.
      pub fn ndarray(self, shape: &[i32], dtype: impl FnOnce(Ops) -> Ops, fortran: bool, raw: &[u8]) -> Ops {
         let ops = self
            .global("numpy.core.multiarray", "_reconstruct")
            .global("numpy", "ndarray")
            .int(0)
            .op(op::TUPLE1)
            .bytes(b"b")
            .op(op::TUPLE3)
            .op(op::REDUCE)
            .op(op::MARK)
            .int(1)
            .op(op::MARK);
         let ops = shape.iter().fold(ops, |ops, &dim| ops.int(dim));
         dtype(ops.op(op::TUPLE))
            .op(if fortran { op::NEWTRUE } else { op::NEWFALSE })
            .bytes(raw)
            .op(op::TUPLE)
            .op(op::BUILD)
      }

      pub fn finish(self) -> Vec<u8> {
         self.op(op::STOP).0
      }
   }
}
