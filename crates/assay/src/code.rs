//! The compiled instruction graph: blocks of chunks addressed by packed refs.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::checksum;
use crate::error::{Error, Result};
use crate::types::Type;
use crate::wire::TypedValue;

mod builder;

pub use builder::CodeBuilder;

const CHUNK_MASK: u64 = 0xFFFF_FFFF;

/// A packed reference: `(block_index + 1) << 32 | (chunk_index + 1)`.
///
/// A chunk part of zero addresses the block itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ref(u64);

impl Ref {
    /// Ref of chunk `chunk` (zero based) in block `block` (zero based).
    pub fn new(block: u32, chunk: u32) -> Self {
        Ref(((u64::from(block) + 1) << 32) | (u64::from(chunk) + 1))
    }

    /// Ref of block `block` (zero based) itself.
    pub fn block(block: u32) -> Self {
        Ref((u64::from(block) + 1) << 32)
    }

    pub fn from_raw(raw: u64) -> Self {
        Ref(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn block_index(self) -> Option<usize> {
        let part = self.0 >> 32;
        (part > 0).then(|| (part - 1) as usize)
    }

    pub fn chunk_index(self) -> Option<usize> {
        let part = self.0 & CHUNK_MASK;
        (part > 0).then(|| (part - 1) as usize)
    }

    /// The block this ref lives in.
    pub fn block_ref(self) -> Ref {
        Ref(self.0 & !CHUNK_MASK)
    }

    pub fn is_block(self) -> bool {
        self.0 & CHUNK_MASK == 0
    }

    /// Ref of the chunk `chunk` (zero based) in the same block.
    pub fn with_chunk(self, chunk: u32) -> Ref {
        Ref((self.0 & !CHUNK_MASK) | (u64::from(chunk) + 1))
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0 >> 32, self.0 & CHUNK_MASK)
    }
}

/// A call: result type, optional bound receiver and ordered arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    #[serde(rename = "type")]
    pub typ: Type,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<Ref>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<TypedValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Call {
    Primitive(TypedValue),
    Function(Function),
    /// Named value supplied to the executor at construction.
    Property(Type),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub call: Call,
}

impl Chunk {
    pub fn primitive(id: impl Into<String>, value: TypedValue) -> Self {
        Self {
            id: id.into(),
            call: Call::Primitive(value),
        }
    }

    pub fn function(
        id: impl Into<String>,
        typ: Type,
        binding: Option<Ref>,
        args: Vec<TypedValue>,
    ) -> Self {
        Self {
            id: id.into(),
            call: Call::Function(Function { typ, binding, args }),
        }
    }

    pub fn property(name: impl Into<String>, typ: Type) -> Self {
        Self {
            id: name.into(),
            call: Call::Property(typ),
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match &self.call {
            Call::Function(func) => Some(func),
            _ => None,
        }
    }

    pub fn as_primitive(&self) -> Option<&TypedValue> {
        match &self.call {
            Call::Primitive(value) => Some(value),
            _ => None,
        }
    }

    pub fn binding(&self) -> Option<Ref> {
        self.as_function().and_then(|func| func.binding)
    }

    pub fn args(&self) -> &[TypedValue] {
        match &self.call {
            Call::Function(func) => &func.args,
            _ => &[],
        }
    }

    /// Literal chunks that do not point elsewhere.
    pub fn is_static(&self) -> bool {
        matches!(&self.call, Call::Primitive(value) if value.is_static())
    }

    /// Declared type, without following refs.
    pub fn typ(&self) -> &Type {
        match &self.call {
            Call::Primitive(value) => &value.typ,
            Call::Function(func) => &func.typ,
            Call::Property(typ) => typ,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub entrypoints: Vec<Ref>,
    #[serde(default)]
    pub datapoints: Vec<Ref>,
    #[serde(default)]
    pub parameters: u32,
    /// The first reported entrypoint is the value of the whole block.
    #[serde(default)]
    pub single_value: bool,
}

impl Block {
    pub fn tail_ref(&self, block_ref: Ref) -> Ref {
        Ref::from_raw(block_ref.block_ref().raw() | self.chunks.len() as u64)
    }

    /// Refs whose values are reported: entrypoints, then datapoints.
    pub fn callback_points(&self) -> impl Iterator<Item = Ref> + '_ {
        self.entrypoints.iter().chain(self.datapoints.iter()).copied()
    }
}

/// The last chunk removed from a block and the roles it held.
#[derive(Debug, Clone, PartialEq)]
pub struct PoppedChunk {
    pub chunk: Chunk,
    pub was_entrypoint: bool,
    pub was_datapoint: bool,
}

/// Compiled code. Immutable once handed to an executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Code {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub checksums: BTreeMap<Ref, String>,
}

impl Code {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(input: &str) -> Result<Self> {
        serde_json::from_str(input).map_err(|err| Error::Decode(format!("code: {err}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|err| Error::Decode(format!("code: {err}")))
    }

    /// Appends an empty block and returns its ref.
    pub fn add_block(&mut self) -> Ref {
        self.blocks.push(Block::default());
        Ref::block((self.blocks.len() - 1) as u32)
    }

    pub fn block(&self, target: Ref) -> Result<&Block> {
        target
            .block_index()
            .and_then(|idx| self.blocks.get(idx))
            .ok_or(Error::MissingBlock(target.block_ref()))
    }

    pub fn block_mut(&mut self, target: Ref) -> Result<&mut Block> {
        target
            .block_index()
            .and_then(|idx| self.blocks.get_mut(idx))
            .ok_or(Error::MissingBlock(target.block_ref()))
    }

    pub fn chunk(&self, target: Ref) -> Result<&Chunk> {
        let block = self.block(target)?;
        target
            .chunk_index()
            .and_then(|idx| block.chunks.get(idx))
            .ok_or(Error::InvalidRef(target))
    }

    pub fn tail_ref(&self, block_ref: Ref) -> Result<Ref> {
        Ok(self.block(block_ref)?.tail_ref(block_ref))
    }

    /// Appends `chunk` to the block, records its checksum and returns its ref.
    pub fn add_chunk(&mut self, block_ref: Ref, chunk: Chunk) -> Result<Ref> {
        let sum = checksum::chunk_checksum(self, &chunk)?;
        let block = self.block_mut(block_ref)?;
        block.chunks.push(chunk);
        let target = block.tail_ref(block_ref);
        self.checksums.insert(target, sum);
        Ok(target)
    }

    /// Adds a parameter slot seeded by the caller, with a caller-chosen checksum.
    pub fn add_argument_placeholder(
        &mut self,
        block_ref: Ref,
        typ: Type,
        sum: impl Into<String>,
    ) -> Result<Ref> {
        let block = self.block_mut(block_ref)?;
        block
            .chunks
            .push(Chunk::primitive("", TypedValue::scalar(typ, Vec::new())));
        block.parameters += 1;
        let target = block.tail_ref(block_ref);
        self.checksums.insert(target, sum.into());
        Ok(target)
    }

    /// Removes the last chunk of the block along with its checksum and roles.
    pub fn pop_chunk(&mut self, block_ref: Ref) -> Result<Option<PoppedChunk>> {
        let block = self.block_mut(block_ref)?;
        if block.chunks.is_empty() {
            return Ok(None);
        }
        let tail = block.tail_ref(block_ref);
        let was_entrypoint = block.entrypoints.last() == Some(&tail);
        if was_entrypoint {
            block.entrypoints.pop();
        }
        let was_datapoint = block.datapoints.last() == Some(&tail);
        if was_datapoint {
            block.datapoints.pop();
        }
        let Some(chunk) = block.chunks.pop() else {
            return Ok(None);
        };
        self.checksums.remove(&tail);
        Ok(Some(PoppedChunk {
            chunk,
            was_entrypoint,
            was_datapoint,
        }))
    }

    pub fn add_entrypoint(&mut self, target: Ref) -> Result<()> {
        self.chunk(target)?;
        self.block_mut(target)?.entrypoints.push(target);
        Ok(())
    }

    pub fn add_datapoint(&mut self, target: Ref) -> Result<()> {
        self.chunk(target)?;
        self.block_mut(target)?.datapoints.push(target);
        Ok(())
    }

    pub fn checksum_of(&self, target: Ref) -> Result<&str> {
        self.checksums
            .get(&target)
            .map(String::as_str)
            .ok_or(Error::MissingChecksum(target))
    }

    /// Entrypoints of the root block.
    pub fn entrypoints(&self) -> &[Ref] {
        self.blocks
            .first()
            .map(|block| block.entrypoints.as_slice())
            .unwrap_or(&[])
    }

    /// Datapoints of the root block.
    pub fn datapoints(&self) -> &[Ref] {
        self.blocks
            .first()
            .map(|block| block.datapoints.as_slice())
            .unwrap_or(&[])
    }

    pub fn block_checksum(&self, block_ref: Ref) -> Result<String> {
        let block = self.block(block_ref)?;
        let mut sum = checksum::Fast::new();
        for entrypoint in &block.entrypoints {
            sum = sum.add(self.checksum_of(*entrypoint)?);
        }
        Ok(sum.to_string())
    }

    /// Recomputes the code id from the block checksums.
    pub fn update_id(&mut self) -> Result<()> {
        let mut sum = checksum::Fast::new();
        for idx in 0..self.blocks.len() {
            sum = sum.add(&self.block_checksum(Ref::block(idx as u32))?);
        }
        self.id = sum.to_string();
        Ok(())
    }

    /// Type of the value at `target`, following literal refs.
    pub fn chunk_type(&self, target: Ref) -> Result<Type> {
        let mut current = target;
        // Bounded by the chunk count: a longer chain must be a cycle.
        let limit: usize = self.blocks.iter().map(|block| block.chunks.len()).sum();
        for _ in 0..=limit {
            let chunk = self.chunk(current)?;
            match &chunk.call {
                Call::Primitive(value) if value.is_ref() => match value.as_ref() {
                    Some(next) => current = next,
                    None => return Err(Error::InvalidRef(current)),
                },
                _ => return Ok(chunk.typ().clone()),
            }
        }
        Err(Error::InvalidRef(target))
    }

    /// A single-value block takes the type of its only entrypoint.
    pub fn dereferenced_block_type(&self, block: &Block) -> Type {
        match block.entrypoints.as_slice() {
            [only] => self.chunk_type(*only).unwrap_or(Type::Block),
            _ => Type::Block,
        }
    }

    /// Refs whose values explain the result at `target` when it fails.
    pub fn ref_datapoints(&self, target: Ref) -> Vec<Ref> {
        let Ok(mut chunk) = self.chunk(target) else {
            return Vec::new();
        };
        if chunk.id == "if" {
            let Some(condition) = chunk.args().first().and_then(TypedValue::as_ref) else {
                return Vec::new();
            };
            let Ok(next) = self.chunk(condition) else {
                return Vec::new();
            };
            chunk = next;
        }
        let Some(func) = chunk.as_function() else {
            return Vec::new();
        };
        match chunk.id.as_str() {
            "" => return Vec::new(),
            "$all" | "$one" | "$any" | "$none" => {
                return func.binding.into_iter().collect();
            }
            _ => {}
        }
        if crate::assessment::comparable_label(&chunk.id).is_none() {
            return Vec::new();
        }

        let mut refs = Vec::new();
        if let Some(left) = func.binding {
            if self.chunk(left).map(|c| !c.is_static()).unwrap_or(false) {
                refs.push(left);
            }
        }
        if let Some(right) = func.args.first().filter(|arg| arg.is_ref()) {
            if let Some(right) = right.as_ref() {
                refs.push(right);
            }
        }
        refs
    }
}

#[cfg(test)]
mod tests;
