//! Port-creation list (component F): the list of ports a group's
//! structure requires, reconciled positionally against whatever ports
//! actually exist on the group as a child element.
//!
//! Grounded in `tPortCreationList.cpp`: `Add`/`ApplyChanges`/`CheckPort`
//! reconcile by *position*, not by name — a list entry at index `i` is
//! matched against the group's `i`-th port child, and mismatches (wrong
//! name, wrong type, wrong direction) cause that port to be torn down and
//! recreated rather than patched in place.

use std::io::Cursor;

use df_error::{CoreError, CoreResult};
use df_port::{AbstractPort, PortFlags};
use df_tree::{FrameworkElement, Tree};
use df_types::TypeRegistry;
use parking_lot::RwLock;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCreationEntry {
    pub name: String,
    pub type_name: String,
    pub output: bool,
}

/// The structure a group's ports should have, independent of whether those
/// ports currently exist.
pub struct PortCreationList {
    entries: RwLock<Vec<PortCreationEntry>>,
}

impl Default for PortCreationList {
    fn default() -> Self {
        Self::new()
    }
}

impl PortCreationList {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, entry: PortCreationEntry) {
        self.entries.write().push(entry);
    }

    pub fn entries(&self) -> Vec<PortCreationEntry> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walks `parent`'s existing port children against this list position
    /// by position: matching entries are left alone, mismatches are
    /// deleted and recreated, missing entries are created, and trailing
    /// ports beyond the list's length are deleted (spec §4.F
    /// `ApplyChanges`).
    pub fn apply_changes(
        &self,
        tree: &Tree,
        parent: &FrameworkElement,
        types: &TypeRegistry,
    ) -> CoreResult<Vec<AbstractPort>> {
        let entries = self.entries.read().clone();
        let existing: Vec<AbstractPort> = parent
            .ports()
            .into_iter()
            .filter_map(AbstractPort::from_element)
            .collect();

        let mut result = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let reuse = existing.get(i).filter(|p| Self::check_port(p, entry));
            if let Some(port) = reuse {
                result.push(port.clone());
                continue;
            }
            if let Some(stale) = existing.get(i) {
                stale.element().managed_delete();
            }
            let data_type = types
                .find_type(&entry.type_name)
                .ok_or_else(|| CoreError::lookup_miss(format!("type `{}`", entry.type_name)))
                .map_err(|e| e.with_context(parent.qualified_name()))?;
            let port = AbstractPort::create(
                tree,
                parent,
                entry.name.clone(),
                data_type,
                PortFlags {
                    output: entry.output,
                    ..Default::default()
                },
            )?;
            tracing::debug!(
                target: "df.structure.port_list",
                group = %parent.qualified_name(),
                port = %entry.name,
                "port (re)created to match creation list"
            );
            result.push(port);
        }

        for stale in existing.iter().skip(entries.len()) {
            stale.element().managed_delete();
        }

        Ok(result)
    }

    fn check_port(port: &AbstractPort, entry: &PortCreationEntry) -> bool {
        port.element().name() == entry.name
            && port.data_type().name() == entry.type_name
            && port.is_output() == entry.output
    }

    pub fn serialize_binary(&self) -> CoreResult<Vec<u8>> {
        let entries = self.entries.read();
        bincode::serde::encode_to_vec(&*entries, bincode::config::standard())
            .map_err(|e| CoreError::malformed_input("port_creation_list", e.to_string()))
    }

    pub fn deserialize_binary(bytes: &[u8]) -> CoreResult<Self> {
        let (entries, _): (Vec<PortCreationEntry>, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| CoreError::malformed_input("port_creation_list", e.to_string()))?;
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    pub fn serialize_xml(&self) -> CoreResult<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer
            .write_event(Event::Start(BytesStart::new("port-creation-list")))
            .map_err(xml_err)?;
        for entry in self.entries.read().iter() {
            let mut tag = BytesStart::new("port");
            tag.push_attribute(("name", entry.name.as_str()));
            tag.push_attribute(("type", entry.type_name.as_str()));
            tag.push_attribute(("output", if entry.output { "true" } else { "false" }));
            writer.write_event(Event::Empty(tag)).map_err(xml_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("port-creation-list")))
            .map_err(xml_err)?;
        String::from_utf8(writer.into_inner().into_inner())
            .map_err(|e| CoreError::malformed_input("port_creation_list", e.to_string()))
    }

    pub fn deserialize_xml(xml: &str) -> CoreResult<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut entries = Vec::new();
        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Empty(tag) | Event::Start(tag) if tag.name().as_ref() == b"port" => {
                    let mut name = None;
                    let mut type_name = None;
                    let mut output = false;
                    for attr in tag.attributes().flatten() {
                        let value = String::from_utf8_lossy(&attr.value).into_owned();
                        match attr.key.as_ref() {
                            b"name" => name = Some(value),
                            b"type" => type_name = Some(value),
                            b"output" => output = value == "true",
                            _ => {}
                        }
                    }
                    let name = name.ok_or_else(|| {
                        CoreError::malformed_input("port", "missing `name` attribute")
                    })?;
                    let type_name = type_name.ok_or_else(|| {
                        CoreError::malformed_input("port", "missing `type` attribute")
                    })?;
                    entries.push(PortCreationEntry {
                        name,
                        type_name,
                        output,
                    });
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }
}

fn xml_err(e: quick_xml::Error) -> CoreError {
    CoreError::malformed_input("port_creation_list", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::Arc;

    struct Counter {
        name: &'static str,
        uid: u64,
    }

    impl df_types::TypeDescriptor for Counter {
        fn name(&self) -> &str {
            self.name
        }
        fn uid(&self) -> u64 {
            self.uid
        }
        fn is_trivially_copyable(&self) -> bool {
            true
        }
        fn is_bit_stable(&self) -> bool {
            true
        }
        fn size_bytes(&self) -> usize {
            8
        }
        fn create_default(&self) -> Box<dyn Any + Send + Sync> {
            Box::new(0i64)
        }
    }

    fn registry() -> TypeRegistry {
        let reg = TypeRegistry::new();
        reg.register(Arc::new(Counter {
            name: "Int",
            uid: 1,
        }))
        .unwrap();
        reg.register(Arc::new(Counter {
            name: "Other",
            uid: 2,
        }))
        .unwrap();
        reg
    }

    #[test]
    fn apply_changes_creates_missing_ports() {
        let tree = Tree::new();
        let types = registry();
        let list = PortCreationList::new();
        list.add(PortCreationEntry {
            name: "in".into(),
            type_name: "Int".into(),
            output: false,
        });
        list.add(PortCreationEntry {
            name: "out".into(),
            type_name: "Int".into(),
            output: true,
        });

        let ports = list.apply_changes(&tree, tree.root(), &types).unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(tree.root().ports().len(), 2);
    }

    #[test]
    fn apply_changes_is_idempotent_when_nothing_changed() {
        let tree = Tree::new();
        let types = registry();
        let list = PortCreationList::new();
        list.add(PortCreationEntry {
            name: "in".into(),
            type_name: "Int".into(),
            output: false,
        });
        let first = list.apply_changes(&tree, tree.root(), &types).unwrap();
        let second = list.apply_changes(&tree, tree.root(), &types).unwrap();
        assert_eq!(first[0].handle(), second[0].handle());
    }

    #[test]
    fn apply_changes_recreates_port_with_mismatched_type() {
        let tree = Tree::new();
        let types = registry();
        let list = PortCreationList::new();
        list.add(PortCreationEntry {
            name: "p".into(),
            type_name: "Int".into(),
            output: false,
        });
        let first = list.apply_changes(&tree, tree.root(), &types).unwrap();
        let first_handle = first[0].handle();

        let list2 = PortCreationList::new();
        list2.add(PortCreationEntry {
            name: "p".into(),
            type_name: "Other".into(),
            output: false,
        });
        let second = list2.apply_changes(&tree, tree.root(), &types).unwrap();
        assert_ne!(second[0].handle(), first_handle);
        assert_eq!(tree.root().ports().len(), 1);
    }

    #[test]
    fn apply_changes_deletes_trailing_ports_beyond_list_length() {
        let tree = Tree::new();
        let types = registry();
        let list = PortCreationList::new();
        list.add(PortCreationEntry {
            name: "a".into(),
            type_name: "Int".into(),
            output: false,
        });
        list.add(PortCreationEntry {
            name: "b".into(),
            type_name: "Int".into(),
            output: false,
        });
        list.apply_changes(&tree, tree.root(), &types).unwrap();
        assert_eq!(tree.root().ports().len(), 2);

        let shorter = PortCreationList::new();
        shorter.add(PortCreationEntry {
            name: "a".into(),
            type_name: "Int".into(),
            output: false,
        });
        shorter.apply_changes(&tree, tree.root(), &types).unwrap();
        assert_eq!(tree.root().ports().len(), 1);
    }

    #[test]
    fn reconcile_keeps_matching_recreates_mismatched_drops_trailing_s6() {
        let tree = Tree::new();
        let types = registry();
        let initial = PortCreationList::new();
        initial.add(PortCreationEntry {
            name: "a".into(),
            type_name: "Int".into(),
            output: false,
        });
        initial.add(PortCreationEntry {
            name: "b".into(),
            type_name: "Other".into(),
            output: false,
        });
        let before = initial.apply_changes(&tree, tree.root(), &types).unwrap();
        let a_handle = before[0].handle();

        let next = PortCreationList::new();
        next.add(PortCreationEntry {
            name: "a".into(),
            type_name: "Int".into(),
            output: false,
        });
        next.add(PortCreationEntry {
            name: "c".into(),
            type_name: "Int".into(),
            output: false,
        });
        let after = next.apply_changes(&tree, tree.root(), &types).unwrap();

        assert_eq!(after.len(), 2);
        assert_eq!(after[0].handle(), a_handle, "`a` is kept, not recreated");
        assert_eq!(after[1].element().name(), "c");
        let names: Vec<&str> = tree.root().ports().iter().map(|p| p.name()).collect();
        assert!(!names.contains(&"b"), "former `b` must be destroyed");
        assert_eq!(tree.root().ports().len(), 2);
    }

    #[test]
    fn binary_round_trip_preserves_entries() {
        let list = PortCreationList::new();
        list.add(PortCreationEntry {
            name: "in".into(),
            type_name: "Int".into(),
            output: false,
        });
        let bytes = list.serialize_binary().unwrap();
        let restored = PortCreationList::deserialize_binary(&bytes).unwrap();
        assert_eq!(restored.entries(), list.entries());
    }

    #[test]
    fn xml_round_trip_preserves_entries() {
        let list = PortCreationList::new();
        list.add(PortCreationEntry {
            name: "in".into(),
            type_name: "Int".into(),
            output: false,
        });
        list.add(PortCreationEntry {
            name: "out".into(),
            type_name: "Int".into(),
            output: true,
        });
        let xml = list.serialize_xml().unwrap();
        let restored = PortCreationList::deserialize_xml(&xml).unwrap();
        assert_eq!(restored.entries(), list.entries());
    }
}
