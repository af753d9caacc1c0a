//! In-memory GGUF writer for building test fixtures.

#![allow(dead_code)]

use std::io::Write;
use tempfile::NamedTempFile;

const MAGIC: u32 = 0x46554747;
const ALIGNMENT: usize = 32;

enum Value {
    U32(u32),
    Str(String),
    Strings(Vec<String>),
}

struct Tensor {
    name: String,
    dims: Vec<u64>,
    kind: u32,
    data: Vec<u8>,
}

pub struct GgufBuilder {
    version: u32,
    kv: Vec<(String, Value)>,
    tensors: Vec<Tensor>,
}

impl Default for GgufBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GgufBuilder {
    pub fn new() -> Self {
        Self {
            version: 3,
            kv: Vec::new(),
            tensors: Vec::new(),
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn u32(mut self, key: &str, value: u32) -> Self {
        self.kv.push((key.to_string(), Value::U32(value)));
        self
    }

    pub fn string(mut self, key: &str, value: &str) -> Self {
        self.kv.push((key.to_string(), Value::Str(value.to_string())));
        self
    }

    pub fn strings(mut self, key: &str, values: &[&str]) -> Self {
        let values = values.iter().map(|s| s.to_string()).collect();
        self.kv.push((key.to_string(), Value::Strings(values)));
        self
    }

    /// Adds a tensor with raw payload bytes of ggml kind `kind`.
    pub fn tensor(mut self, name: &str, dims: &[u64], kind: u32, data: Vec<u8>) -> Self {
        self.tensors.push(Tensor {
            name: name.to_string(),
            dims: dims.to_vec(),
            kind,
            data,
        });
        self
    }

    pub fn f32_tensor(self, name: &str, values: &[f32]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.tensor(name, &[values.len() as u64], 0, data)
    }

    /// llama hyperparameter keys.
    pub fn llama(self, vocab: u32, embd: u32, heads: u32, layers: u32) -> Self {
        self.string("general.architecture", "llama")
            .u32("llama.vocab_size", vocab)
            .u32("llama.embedding_length", embd)
            .u32("llama.attention.head_count", heads)
            .u32("llama.block_count", layers)
            .u32("llama.context_length", 128)
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(MAGIC.to_le_bytes());
        out.extend(self.version.to_le_bytes());
        out.extend((self.tensors.len() as u64).to_le_bytes());
        out.extend((self.kv.len() as u64).to_le_bytes());

        for (key, value) in &self.kv {
            put_str(&mut out, key);
            match value {
                Value::U32(v) => {
                    out.extend(4u32.to_le_bytes());
                    out.extend(v.to_le_bytes());
                }
                Value::Str(s) => {
                    out.extend(8u32.to_le_bytes());
                    put_str(&mut out, s);
                }
                Value::Strings(items) => {
                    out.extend(9u32.to_le_bytes());
                    out.extend(8u32.to_le_bytes());
                    out.extend((items.len() as u64).to_le_bytes());
                    for s in items {
                        put_str(&mut out, s);
                    }
                }
            }
        }

        let mut offset = 0usize;
        let mut offsets = Vec::new();
        for t in &self.tensors {
            put_str(&mut out, &t.name);
            out.extend((t.dims.len() as u32).to_le_bytes());
            for d in &t.dims {
                out.extend(d.to_le_bytes());
            }
            out.extend(t.kind.to_le_bytes());
            out.extend((offset as u64).to_le_bytes());
            offsets.push(offset);
            offset = align(offset + t.data.len());
        }

        out.resize(align(out.len()), 0);
        let data_start = out.len();
        for (t, off) in self.tensors.iter().zip(offsets) {
            out.resize(data_start + off, 0);
            out.extend(&t.data);
        }

        // Keep every fixture above the minimum file size.
        if out.len() < 128 {
            out.resize(128, 0);
        }
        out
    }

    pub fn write(&self) -> NamedTempFile {
        write_bytes(&self.build())
    }
}

pub fn write_bytes(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

/// Small model that runs fast under the placeholder pipeline.
pub fn tiny_model() -> NamedTempFile {
    GgufBuilder::new()
        .llama(64, 16, 2, 2)
        .string("general.name", "tiny")
        .f32_tensor("token_embd.weight", &[0.5; 64])
        .f32_tensor("output.weight", &[0.25; 32])
        .write()
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend((s.len() as u64).to_le_bytes());
    out.extend(s.as_bytes());
}

fn align(n: usize) -> usize {
    n.div_ceil(ALIGNMENT) * ALIGNMENT
}
