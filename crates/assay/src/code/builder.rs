//! Typed construction of [`Code`] graphs.
//!
//! The builder appends chunks to a current block and picks builtin
//! signatures from the dispatch table, so callers write `op(left, "==",
//! right)` rather than spelling out `int==[]int`.

use super::{Chunk, Code, Ref};
use crate::builtins;
use crate::checksum::Fast;
use crate::error::{Error, Result};
use crate::types::Type;
use crate::wire::TypedValue;

pub struct CodeBuilder {
    code: Code,
    block: Ref,
}

impl Default for CodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeBuilder {
    /// Starts with an empty root block.
    pub fn new() -> Self {
        let mut code = Code::new();
        let block = code.add_block();
        Self { code, block }
    }

    pub fn code(&self) -> &Code {
        &self.code
    }

    /// The block chunks are currently appended to.
    pub fn current_block(&self) -> Ref {
        self.block
    }

    /// Type of an argument, following refs into the graph.
    pub fn type_of(&self, value: &TypedValue) -> Result<Type> {
        match value.typ {
            Type::Ref => {
                let target = value.as_ref().ok_or_else(|| Error::Decode("malformed ref".into()))?;
                self.code.chunk_type(target)
            }
            _ => Ok(value.typ.clone()),
        }
    }

    pub fn literal(&mut self, value: TypedValue) -> Result<Ref> {
        self.code.add_chunk(self.block, Chunk::primitive("", value))
    }

    pub fn call(
        &mut self,
        id: impl Into<String>,
        typ: Type,
        binding: Option<Ref>,
        args: Vec<TypedValue>,
    ) -> Result<Ref> {
        self.code
            .add_chunk(self.block, Chunk::function(id, typ, binding, args))
    }

    /// `left op right`.
    pub fn op(&mut self, left: Ref, op: &str, right: TypedValue) -> Result<Ref> {
        let left_type = self.code.chunk_type(left)?;
        let right_type = self.type_of(&right)?;
        let (signature, typ) = builtins::resolve_operator(&left_type, op, &right_type)?;
        self.call(signature, typ, Some(left), vec![right])
    }

    /// A builtin method on `receiver`. Resource fields go through [`Self::field`].
    pub fn method(&mut self, receiver: Ref, name: &str, args: Vec<TypedValue>) -> Result<Ref> {
        let receiver_type = self.code.chunk_type(receiver)?;
        let arg_types = args
            .iter()
            .map(|arg| self.type_of(arg))
            .collect::<Result<Vec<_>>>()?;
        let typ = builtins::method_type(&receiver_type, name, &arg_types)
            .ok_or_else(|| Error::unsupported(name, receiver_type.label()))?;
        self.call(name, typ, Some(receiver), args)
    }

    pub fn global(&mut self, name: &str, typ: Type, args: Vec<TypedValue>) -> Result<Ref> {
        self.call(name, typ, None, args)
    }

    /// Constructs resource `name` from named init arguments.
    pub fn resource(&mut self, name: &str, args: Vec<(&str, TypedValue)>) -> Result<Ref> {
        let args = args
            .into_iter()
            .flat_map(|(field, value)| [TypedValue::string(field), value])
            .collect();
        self.call(name, Type::resource(name), None, args)
    }

    pub fn field(&mut self, resource: Ref, field: &str, typ: Type) -> Result<Ref> {
        self.call(field, typ, Some(resource), Vec::new())
    }

    pub fn property(&mut self, name: &str, typ: Type) -> Result<Ref> {
        self.code.add_chunk(self.block, Chunk::property(name, typ))
    }

    pub fn entrypoint(&mut self, target: Ref) -> Result<()> {
        self.code.add_entrypoint(target)
    }

    pub fn datapoint(&mut self, target: Ref) -> Result<()> {
        self.code.add_datapoint(target)
    }

    /// Builds a nested block whose body declares its own entrypoints. Its
    /// value is the map of everything it reports.
    ///
    /// Parameter checksums derive from `source`, the value the block is
    /// run against.
    pub fn function_block<F>(
        &mut self,
        source: Option<Ref>,
        parameters: &[Type],
        body: F,
    ) -> Result<TypedValue>
    where
        F: FnOnce(&mut CodeBuilder, &[Ref]) -> Result<()>,
    {
        let block = self.nested(source, parameters, body)?;
        Ok(TypedValue::function(block, Type::Block))
    }

    /// Builds a nested block whose value is the ref `body` returns.
    pub fn value_block<F>(
        &mut self,
        source: Option<Ref>,
        parameters: &[Type],
        body: F,
    ) -> Result<TypedValue>
    where
        F: FnOnce(&mut CodeBuilder, &[Ref]) -> Result<Ref>,
    {
        let block = self.nested(source, parameters, |builder, params| {
            let value = body(builder, params)?;
            builder.entrypoint(value)
        })?;
        let nested = self.code.block_mut(block)?;
        nested.single_value = true;
        let typ = self.code.dereferenced_block_type(self.code.block(block)?);
        Ok(TypedValue::function(block, typ))
    }

    fn nested<F>(&mut self, source: Option<Ref>, parameters: &[Type], body: F) -> Result<Ref>
    where
        F: FnOnce(&mut CodeBuilder, &[Ref]) -> Result<()>,
    {
        let seed = match source {
            Some(source) => self.code.checksum_of(source)?.to_string(),
            None => String::new(),
        };
        let block = self.code.add_block();
        let mut params = Vec::with_capacity(parameters.len());
        for (idx, typ) in parameters.iter().enumerate() {
            let sum = Fast::new().add(&seed).add(&idx.to_string()).to_string();
            params.push(self.code.add_argument_placeholder(block, typ.clone(), sum)?);
        }

        let outer = std::mem::replace(&mut self.block, block);
        let built = body(self, &params);
        self.block = outer;
        built?;
        Ok(block)
    }

    /// `list.where(predicate)`. For arrays and maps `receiver` is the list
    /// itself; for resources it is the resource owning the `list` field.
    pub fn filter<F>(&mut self, receiver: Ref, list: Ref, predicate: F) -> Result<Ref>
    where
        F: FnOnce(&mut CodeBuilder, &[Ref]) -> Result<Ref>,
    {
        self.combinator("where", receiver, list, predicate)
    }

    /// The complement of [`Self::filter`], the basis of `all`.
    pub fn filter_not<F>(&mut self, receiver: Ref, list: Ref, predicate: F) -> Result<Ref>
    where
        F: FnOnce(&mut CodeBuilder, &[Ref]) -> Result<Ref>,
    {
        self.combinator("$whereNot", receiver, list, predicate)
    }

    /// `list.map(mapping)`.
    pub fn map<F>(&mut self, receiver: Ref, list: Ref, mapping: F) -> Result<Ref>
    where
        F: FnOnce(&mut CodeBuilder, &[Ref]) -> Result<Ref>,
    {
        self.combinator("map", receiver, list, mapping)
    }

    /// The elements of `list` whose `field` value is shared with another
    /// element.
    pub fn field_duplicates<F>(&mut self, receiver: Ref, list: Ref, field: F) -> Result<Ref>
    where
        F: FnOnce(&mut CodeBuilder, &[Ref]) -> Result<Ref>,
    {
        self.combinator("fieldDuplicates", receiver, list, field)
    }

    /// `list${ body }`: the body runs once with the whole list bound.
    pub fn call_block<F>(&mut self, list: Ref, body: F) -> Result<Ref>
    where
        F: FnOnce(&mut CodeBuilder, &[Ref]) -> Result<()>,
    {
        let typ = self.code.chunk_type(list)?;
        let function = self.function_block(Some(list), &[typ], body)?;
        self.method(list, "${}", vec![function])
    }

    /// `list.all(predicate)`: true when nothing fails the predicate.
    pub fn all<F>(&mut self, receiver: Ref, list: Ref, predicate: F) -> Result<Ref>
    where
        F: FnOnce(&mut CodeBuilder, &[Ref]) -> Result<Ref>,
    {
        let failing = self.filter_not(receiver, list, predicate)?;
        self.quantifier(failing, "$all")
    }

    /// `list.any(predicate)`, `list.none(predicate)` or `list.one(predicate)`.
    pub fn count_where<F>(&mut self, receiver: Ref, list: Ref, name: &str, predicate: F) -> Result<Ref>
    where
        F: FnOnce(&mut CodeBuilder, &[Ref]) -> Result<Ref>,
    {
        let matching = self.filter(receiver, list, predicate)?;
        self.quantifier(matching, &format!("${name}"))
    }

    fn quantifier(&mut self, filtered: Ref, name: &str) -> Result<Ref> {
        let filtered_type = self.code.chunk_type(filtered)?;
        if !filtered_type.is_array() && filtered_type != Type::Dict {
            return Err(Error::unsupported(name, filtered_type.label()));
        }
        self.call(name, Type::Bool, Some(filtered), Vec::new())
    }

    /// `receiver { body }`: the body runs once per element of an array or
    /// once against a map or resource.
    pub fn each<F>(&mut self, receiver: Ref, body: F) -> Result<Ref>
    where
        F: FnOnce(&mut CodeBuilder, &[Ref]) -> Result<()>,
    {
        let receiver_type = self.code.chunk_type(receiver)?;
        let parameter = match &receiver_type {
            Type::Array(child) => (**child).clone(),
            other => other.clone(),
        };
        let function = self.function_block(Some(receiver), &[parameter], body)?;
        self.method(receiver, "{}", vec![function])
    }

    /// `if`/`else if` chains: `(condition, block)` pairs and an optional
    /// `else` block, all built with [`Self::value_block`] or
    /// [`Self::function_block`] without parameters.
    pub fn if_chain(
        &mut self,
        branches: Vec<(Ref, TypedValue)>,
        otherwise: Option<TypedValue>,
    ) -> Result<Ref> {
        let typ = branches
            .first()
            .map(|(_, function)| function.typ.child())
            .ok_or_else(|| Error::eval("`if` needs at least one branch"))?;
        let no_args = || TypedValue::array(Vec::new(), Type::Ref);
        let mut args = Vec::with_capacity(branches.len() * 3 + 2);
        for (condition, function) in branches {
            args.extend([TypedValue::reference(condition), function, no_args()]);
        }
        if let Some(function) = otherwise {
            args.extend([function, no_args()]);
        }
        self.global("if", typ, args)
    }

    fn combinator<F>(&mut self, name: &str, receiver: Ref, list: Ref, body: F) -> Result<Ref>
    where
        F: FnOnce(&mut CodeBuilder, &[Ref]) -> Result<Ref>,
    {
        let parameters = match self.code.chunk_type(list)? {
            Type::Map(_, value) => vec![Type::String, *value],
            Type::Array(child) => vec![*child],
            Type::Dict => vec![Type::Dict],
            other => return Err(Error::unsupported(name, other.label())),
        };
        let function = self.value_block(Some(list), &parameters, body)?;
        self.method(receiver, name, vec![TypedValue::reference(list), function])
    }

    /// Computes the code id and hands the code over.
    pub fn finish(mut self) -> Result<Code> {
        self.code.update_id()?;
        Ok(self.code)
    }
}
