//! Structure-parameter model (component G): typed, named values attached
//! to a group, resolved through a fixed load order and round-tripped
//! through binary, XML, and config-file representations.
//!
//! Grounded in `tStructureParameterBase.cpp`'s `UpdateAndPossiblyLoad`: a
//! parameter's active value comes from the first of (CLI override, config
//! override, XML inline value, constructor default) that's actually
//! present — and, per spec §4.G, a save never writes a CLI- or
//! config-sourced value back into the XML; [`StructureParameter::xml_serialization_value`]
//! only ever reflects the inline/default value.
//!
//! Outer attachment (spec §4.G `AttachTo`) is modeled as a small enum rather
//! than a raw pointer swap: a parameter either owns its value or proxies to
//! another `StructureParameter` of the same type, exactly as
//! `tStructureParameterBase::outer_parameter_attachment` does, without the
//! aliasing a raw-pointer version would need `unsafe` for.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use df_error::{CoreError, CoreResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// `--key=value` pairs collected from the CLI (spec §6 "external
/// interfaces"); deliberately just a flat map rather than a `clap`
/// dependency here — `df-cli` owns argument parsing and hands the
/// resolved map down.
#[derive(Debug, Default, Clone)]
pub struct CommandLineValues(HashMap<String, String>);

impl CommandLineValues {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// Path-keyed config values (e.g. `/robot/speed`), bound via `df-structure`
/// independent of how the config file itself was parsed (`df-cli`/
/// `df-runtime` flatten a `toml::Value` document into this before handing
/// it to parameters).
#[derive(Debug, Default, Clone)]
pub struct ConfigValues(HashMap<String, String>);

impl ConfigValues {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn set(&mut self, path: impl Into<String>, value: impl Into<String>) {
        self.0.insert(path.into(), value.into());
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }
}

/// Wire shape for a structure parameter (spec §6 "Binary serialization of a
/// structure parameter"). Values travel as their serialized string form so
/// this record doesn't need to be generic over `T`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureParameterRecord {
    pub name: String,
    pub type_name: String,
    pub cmdline: String,
    pub attach_outer: String,
    pub create_outer: bool,
    pub config_entry: String,
    pub config_set_by_wiring: bool,
    pub has_value: bool,
    pub value: String,
}

enum Storage<T> {
    Own(T),
    /// No value of its own; reads and writes redirect to another parameter
    /// of the same type (spec §4.G "outer proxy").
    Proxy(Arc<StructureParameter<T>>),
}

/// A single named, typed structure parameter.
pub struct StructureParameter<T> {
    name: String,
    cmdline_key: Option<String>,
    config_key: Option<String>,
    attach_outer_name: RwLock<Option<String>>,
    create_outer: bool,
    is_constructor_prototype: bool,
    config_set_by_wiring: RwLock<bool>,
    xml_value: RwLock<Option<T>>,
    default: T,
    storage: RwLock<Storage<T>>,
}

impl<T> StructureParameter<T>
where
    T: Clone + Send + Sync + 'static + FromStr + Display,
    <T as FromStr>::Err: Display,
{
    pub fn new(name: impl Into<String>, default: T) -> Self {
        Self {
            name: name.into(),
            cmdline_key: None,
            config_key: None,
            attach_outer_name: RwLock::new(None),
            create_outer: false,
            is_constructor_prototype: false,
            config_set_by_wiring: RwLock::new(false),
            xml_value: RwLock::new(None),
            default: default.clone(),
            storage: RwLock::new(Storage::Own(default)),
        }
    }

    /// A prototype used only to describe a parameter's shape at construction
    /// time; it holds no buffer of its own (spec §4.G: "A prototype holds
    /// no buffer").
    pub fn new_constructor_prototype(name: impl Into<String>, default: T) -> Self {
        let mut p = Self::new(name, default);
        p.is_constructor_prototype = true;
        p
    }

    pub fn is_constructor_prototype(&self) -> bool {
        self.is_constructor_prototype
    }

    pub fn with_cmdline_key(mut self, key: impl Into<String>) -> Self {
        self.cmdline_key = Some(key.into());
        self
    }

    pub fn with_config_key(mut self, key: impl Into<String>) -> Self {
        self.config_key = Some(key.into());
        self
    }

    /// Marks this parameter as wanting attachment to a same-named parameter
    /// on the enclosing finstructable group (spec §4.G "outer attachment").
    /// `create_if_absent` mirrors `create_outer_parameter`: if the outer
    /// group has no such parameter, the caller (`df-finstruct`) creates a
    /// proxy there instead of failing.
    pub fn with_outer_attachment(mut self, outer_name: impl Into<String>, create_if_absent: bool) -> Self {
        *self.attach_outer_name.get_mut() = Some(outer_name.into());
        self.create_outer = create_if_absent;
        self
    }

    pub fn outer_attachment_name(&self) -> Option<String> {
        self.attach_outer_name.read().clone()
    }

    pub fn creates_outer_if_absent(&self) -> bool {
        self.create_outer
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The CLI option name this parameter binds to, if any (spec §6
    /// `cmdline`). Exposed so a `<parameter>` can be reconstructed on
    /// `save` instead of losing the binding.
    pub fn cmdline_key(&self) -> Option<&str> {
        self.cmdline_key.as_deref()
    }

    /// The config-file path this parameter binds to, if any (spec §6
    /// `config`). Same round-trip purpose as [`Self::cmdline_key`].
    pub fn config_key(&self) -> Option<&str> {
        self.config_key.as_deref()
    }

    /// Reads through any proxy chain to the owning parameter's value.
    pub fn get(&self) -> T {
        match &*self.storage.read() {
            Storage::Own(v) => v.clone(),
            Storage::Proxy(other) => other.get(),
        }
    }

    fn set_owned(&self, value: T) {
        match &mut *self.storage.write() {
            Storage::Own(slot) => *slot = value,
            Storage::Proxy(_) => {
                // Writes always land on whoever ultimately owns the value;
                // resolve the proxy chain before assigning.
                let owner = self.resolve_owner();
                owner.set_owned(value);
            }
        }
    }

    fn resolve_owner(&self) -> Arc<StructureParameter<T>> {
        match &*self.storage.read() {
            Storage::Own(_) => unreachable!("resolve_owner only called on a proxy"),
            Storage::Proxy(other) => match &*other.storage.read() {
                Storage::Own(_) => other.clone(),
                Storage::Proxy(_) => other.resolve_owner(),
            },
        }
    }

    /// Redirects reads/writes to `other`'s buffer; `Arc::ptr_eq(self,
    /// other)` detaches back to an owned buffer holding whatever value was
    /// last visible through the proxy (spec §4.G `AttachTo`).
    pub fn attach_to(self: &Arc<Self>, other: &Arc<StructureParameter<T>>) {
        if Arc::ptr_eq(self, other) {
            let current = self.get();
            *self.storage.write() = Storage::Own(current);
        } else {
            *self.storage.write() = Storage::Proxy(other.clone());
        }
    }

    pub fn is_outer_proxy(&self) -> bool {
        matches!(&*self.storage.read(), Storage::Proxy(_))
    }

    fn parse(raw: &str) -> CoreResult<T> {
        raw.parse::<T>()
            .map_err(|e| CoreError::malformed_input("parameter value", e.to_string()))
    }

    /// Records the value declared inline in a group's saved XML. Doesn't
    /// become the active value until [`Self::update_and_possibly_load`]
    /// runs the full load order.
    pub fn set_xml_value(&self, raw: &str) -> CoreResult<()> {
        *self.xml_value.write() = Some(Self::parse(raw)?);
        Ok(())
    }

    /// Marks this parameter's current value as set by a wiring tool rather
    /// than hand-edited XML (spec §6 `config_set_by_wiring`).
    pub fn mark_set_by_wiring(&self, value: bool) {
        *self.config_set_by_wiring.write() = value;
    }

    pub fn is_set_by_wiring(&self) -> bool {
        *self.config_set_by_wiring.read()
    }

    /// Resolves the active value: CLI override, then config override,
    /// then the XML inline value, then the constructor default (spec §4.G
    /// `UpdateAndPossiblyLoad`, scenario S5).
    pub fn update_and_possibly_load(
        &self,
        cli: &CommandLineValues,
        config: &ConfigValues,
    ) -> CoreResult<()> {
        if let Some(raw) = self.cmdline_key.as_deref().and_then(|k| cli.get(k)) {
            self.set_owned(Self::parse(raw)?);
            return Ok(());
        }
        if let Some(raw) = self.config_key.as_deref().and_then(|k| config.get(k)) {
            self.set_owned(Self::parse(raw)?);
            return Ok(());
        }
        if let Some(xml) = self.xml_value.read().clone() {
            self.set_owned(xml);
            return Ok(());
        }
        self.set_owned(self.default.clone());
        Ok(())
    }

    /// What a save writes back to XML: the inline/default value, never a
    /// CLI- or config-sourced override.
    pub fn xml_serialization_value(&self) -> String {
        match self.xml_value.read().clone() {
            Some(v) => v.to_string(),
            None => self.default.to_string(),
        }
    }

    /// Wire record for binary/XML serialization (spec §6). `type_name` is
    /// supplied by the caller since `T` itself carries no name at runtime.
    pub fn to_record(&self, type_name: impl Into<String>) -> StructureParameterRecord {
        StructureParameterRecord {
            name: self.name.clone(),
            type_name: type_name.into(),
            cmdline: self.cmdline_key.clone().unwrap_or_default(),
            attach_outer: self.attach_outer_name.read().clone().unwrap_or_default(),
            create_outer: self.create_outer,
            config_entry: self.config_key.clone().unwrap_or_default(),
            config_set_by_wiring: self.is_set_by_wiring(),
            has_value: !self.is_constructor_prototype,
            value: self.xml_serialization_value(),
        }
    }

    /// Rebuilds a parameter from a wire record. The record's `value` is
    /// only consulted when `has_value` is set, matching the wire format's
    /// `bool has_value` discriminant (spec §6).
    pub fn from_record(record: &StructureParameterRecord) -> CoreResult<Self> {
        let default = if record.has_value {
            Self::parse(&record.value)?
        } else {
            return Err(CoreError::malformed_input(
                "structure parameter",
                "record has no value and no default to substitute",
            ));
        };
        let mut param = Self::new(record.name.clone(), default.clone());
        if !record.cmdline.is_empty() {
            param = param.with_cmdline_key(record.cmdline.clone());
        }
        if !record.config_entry.is_empty() {
            param = param.with_config_key(record.config_entry.clone());
        }
        if !record.attach_outer.is_empty() {
            param = param.with_outer_attachment(record.attach_outer.clone(), record.create_outer);
        }
        param.mark_set_by_wiring(record.config_set_by_wiring);
        param.set_xml_value(&record.value)?;
        Ok(param)
    }

    pub fn serialize_binary(&self, type_name: impl Into<String>) -> CoreResult<Vec<u8>> {
        let record = self.to_record(type_name);
        bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| CoreError::malformed_input("structure parameter", e.to_string()))
    }

    pub fn deserialize_binary(bytes: &[u8]) -> CoreResult<Self> {
        let (record, _): (StructureParameterRecord, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| CoreError::malformed_input("structure parameter", e.to_string()))?;
        Self::from_record(&record)
    }
}

/// A group carries one parameter *of each name*, but `FrameworkElement`'s
/// annotation chain (`df-tree`) only finds the first annotation of a given
/// concrete type. [`ParameterList`] is the one annotation a group attaches,
/// holding as many named parameters as it needs — analogous to how
/// `tFinstructableGroup` keeps a `tStructureParameterList` rather than
/// attaching each parameter as its own loosely-typed member.
#[derive(Default)]
pub struct ParameterList {
    params: RwLock<Vec<Arc<StructureParameter<String>>>>,
}

impl ParameterList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, param: Arc<StructureParameter<String>>) {
        self.params.write().push(param);
    }

    pub fn find(&self, name: &str) -> Option<Arc<StructureParameter<String>>> {
        self.params.read().iter().find(|p| p.name() == name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<StructureParameter<String>>> {
        self.params.read().clone()
    }
}
