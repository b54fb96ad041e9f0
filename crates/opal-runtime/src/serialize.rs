//! Bytecode file format
//!
//! A compiled program can be written to disk and reloaded without its
//! source. The container is:
//!
//! - magic/version byte (`0xB1` = format 1; the high nibble is the magic)
//! - tool version string (u16 length + UTF-8 bytes)
//! - source filename (u16 length + UTF-8 bytes)
//! - FNV-1a (32-bit, big-endian) of the source bytes
//! - the closure graph: the top-level function record, with nested function
//!   constants serialized recursively
//! - crc32 (big-endian) of the graph bytes
//!
//! Reading reconstructs the entire reachable object graph — every string is
//! re-interned and every function reallocated — before execution begins.

use thiserror::Error;

use crate::chunk::Chunk;
use crate::heap::{fnv1a, Heap, ObjRef};
use crate::object::{FunctionObj, Obj};
use crate::value::Value;

/// Magic nibble + format version
pub const MAGIC_VERSION: u8 = 0xB1;
const MAGIC_NIBBLE: u8 = 0xB0;

// Constant tags
const TAG_NIL: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_NUMBER: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_FUNCTION: u8 = 5;

/// Errors from writing or reading a bytecode file
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SerializeError {
    /// The input does not start with the magic byte
    #[error("not an Opal bytecode file")]
    BadMagic,
    /// The format version is not the one this build writes
    #[error("unsupported bytecode version {0:#04x} (expected {MAGIC_VERSION:#04x})")]
    VersionMismatch(u8),
    /// The input ended mid-record
    #[error("truncated bytecode file")]
    Truncated,
    /// The graph bytes do not match their checksum
    #[error("bytecode checksum mismatch")]
    ChecksumMismatch,
    /// Structurally invalid content
    #[error("corrupt bytecode: {0}")]
    Corrupt(String),
    /// The object graph holds a value the format cannot carry
    #[error("unsupported constant in function '{0}'")]
    Unsupported(String),
}

/// Metadata and entry point recovered from a bytecode file
#[derive(Debug)]
pub struct LoadedProgram {
    /// The reconstructed top-level function
    pub function: ObjRef,
    /// Version of the tool that wrote the file
    pub tool_version: String,
    /// Name of the source file the program was compiled from
    pub source_name: String,
    /// FNV-1a of the original source bytes
    pub source_hash: u32,
}

/// Serialize a compiled top-level function
pub fn write_program(
    heap: &Heap,
    function: ObjRef,
    source: &str,
    source_name: &str,
) -> Result<Vec<u8>, SerializeError> {
    let mut bytes = vec![MAGIC_VERSION];
    write_str(&mut bytes, crate::VERSION);
    write_str(&mut bytes, source_name);
    bytes.extend_from_slice(&fnv1a(source.as_bytes()).to_be_bytes());

    let mut graph = Vec::new();
    write_function(heap, function, &mut graph)?;
    let checksum = crc32fast::hash(&graph);
    bytes.extend_from_slice(&graph);
    bytes.extend_from_slice(&checksum.to_be_bytes());
    Ok(bytes)
}

/// Reconstruct a program from bytecode file contents
pub fn read_program(heap: &mut Heap, bytes: &[u8]) -> Result<LoadedProgram, SerializeError> {
    let mut reader = Reader::new(bytes);
    match reader.u8()? {
        MAGIC_VERSION => {}
        byte if byte & 0xF0 == MAGIC_NIBBLE => return Err(SerializeError::VersionMismatch(byte)),
        _ => return Err(SerializeError::BadMagic),
    }
    let tool_version = reader.string()?;
    let source_name = reader.string()?;
    let source_hash = reader.u32()?;

    let graph_start = reader.offset;
    if bytes.len() < graph_start + 4 {
        return Err(SerializeError::Truncated);
    }
    let graph_end = bytes.len() - 4;
    let stored = u32::from_be_bytes([
        bytes[graph_end],
        bytes[graph_end + 1],
        bytes[graph_end + 2],
        bytes[graph_end + 3],
    ]);
    if crc32fast::hash(&bytes[graph_start..graph_end]) != stored {
        return Err(SerializeError::ChecksumMismatch);
    }

    let mut reader = Reader::new(&bytes[..graph_end]);
    reader.offset = graph_start;
    let function = read_function(heap, &mut reader)?;
    if reader.offset != graph_end {
        return Err(SerializeError::Corrupt(
            "trailing bytes after closure graph".to_string(),
        ));
    }

    Ok(LoadedProgram {
        function,
        tool_version,
        source_name,
        source_hash,
    })
}

/// Does this byte begin a bytecode file (any version)?
pub fn is_bytecode(bytes: &[u8]) -> bool {
    bytes.first().is_some_and(|&byte| byte & 0xF0 == MAGIC_NIBBLE)
}

// ===== Writing =====

fn write_str(out: &mut Vec<u8>, text: &str) {
    out.extend_from_slice(&(text.len() as u16).to_be_bytes());
    out.extend_from_slice(text.as_bytes());
}

fn write_function(heap: &Heap, handle: ObjRef, out: &mut Vec<u8>) -> Result<(), SerializeError> {
    let Some(function) = heap.as_function(handle) else {
        return Err(SerializeError::Corrupt(
            "closure graph node is not a function".to_string(),
        ));
    };
    let name = function
        .name
        .and_then(|n| heap.as_str(n))
        .unwrap_or("<script>")
        .to_string();

    out.push(function.arity);
    out.extend_from_slice(&(function.upvalue_count as u16).to_be_bytes());
    match function.name.and_then(|n| heap.as_str(n)) {
        Some(text) => {
            out.push(1);
            write_str(out, text);
        }
        None => out.push(0),
    }

    let chunk = &function.chunk;
    out.extend_from_slice(&(chunk.code.len() as u32).to_be_bytes());
    out.extend_from_slice(&chunk.code);
    for &line in &chunk.lines {
        out.extend_from_slice(&line.to_be_bytes());
    }

    out.extend_from_slice(&(chunk.constants.len() as u16).to_be_bytes());
    for &constant in &chunk.constants {
        match constant {
            Value::Nil => out.push(TAG_NIL),
            Value::Bool(false) => out.push(TAG_FALSE),
            Value::Bool(true) => out.push(TAG_TRUE),
            Value::Number(n) => {
                out.push(TAG_NUMBER);
                out.extend_from_slice(&n.to_bits().to_be_bytes());
            }
            Value::Obj(obj) => match heap.get(obj) {
                Obj::Str(s) => {
                    out.push(TAG_STRING);
                    write_str(out, &s.chars);
                }
                Obj::Function(_) => {
                    out.push(TAG_FUNCTION);
                    write_function(heap, obj, out)?;
                }
                _ => return Err(SerializeError::Unsupported(name)),
            },
        }
    }
    Ok(())
}

// ===== Reading =====

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], SerializeError> {
        if self.offset + count > self.bytes.len() {
            return Err(SerializeError::Truncated);
        }
        let slice = &self.bytes[self.offset..self.offset + count];
        self.offset += count;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, SerializeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SerializeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, SerializeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f64(&mut self) -> Result<f64, SerializeError> {
        let b = self.take(8)?;
        let bits = u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
        Ok(f64::from_bits(bits))
    }

    fn string(&mut self) -> Result<String, SerializeError> {
        let length = self.u16()? as usize;
        let bytes = self.take(length)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| SerializeError::Corrupt("invalid UTF-8 in string".to_string()))
    }
}

fn read_function(heap: &mut Heap, reader: &mut Reader) -> Result<ObjRef, SerializeError> {
    let arity = reader.u8()?;
    let upvalue_count = reader.u16()? as usize;
    let name = match reader.u8()? {
        0 => None,
        1 => {
            let text = reader.string()?;
            Some(heap.intern(&text))
        }
        _ => {
            return Err(SerializeError::Corrupt(
                "invalid name marker in function record".to_string(),
            ))
        }
    };

    let code_len = reader.u32()? as usize;
    let code = reader.take(code_len)?.to_vec();
    let mut lines = Vec::with_capacity(code_len);
    for _ in 0..code_len {
        lines.push(reader.u32()?);
    }

    let constant_count = reader.u16()? as usize;
    let mut constants = Vec::with_capacity(constant_count);
    for _ in 0..constant_count {
        let value = match reader.u8()? {
            TAG_NIL => Value::Nil,
            TAG_FALSE => Value::Bool(false),
            TAG_TRUE => Value::Bool(true),
            TAG_NUMBER => Value::Number(reader.f64()?),
            TAG_STRING => {
                let text = reader.string()?;
                Value::Obj(heap.intern(&text))
            }
            TAG_FUNCTION => Value::Obj(read_function(heap, reader)?),
            tag => {
                return Err(SerializeError::Corrupt(format!(
                    "unknown constant tag {}",
                    tag
                )))
            }
        };
        constants.push(value);
    }

    Ok(heap.alloc(Obj::Function(FunctionObj {
        arity,
        upvalue_count,
        chunk: Chunk {
            code,
            lines,
            constants,
        },
        name,
    })))
}
