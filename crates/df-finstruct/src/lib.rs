//! Finstructable-group serializer (component H): the XML format that
//! assembles and reassembles an element subtree, plus command-line
//! argument discovery and deferred link-edge resolution.
//!
//! Grounded in spec §4.H and §6's XML shape (`<FinstructableGroup>` /
//! `<element>` / `<port>` / `<edge>` / `<parameter>`); `quick-xml`'s
//! streaming event API is used rather than a DOM crate, matching the
//! teacher's general preference for streaming/structured parsers over
//! full-DOM ones (also the choice the pack's `ulikoehler-rustylink`
//! manifest makes for XML).

use std::io::Cursor;
use std::sync::Arc;

use df_error::{CoreError, CoreResult};
use df_port::{AbstractPort, PortFlags};
use df_structure::{
    CommandLineValues, ConfigValues, ParameterList, PortCreationEntry, StructureParameter,
};
use df_tree::{FrameworkElement, Tree};
use df_types::TypeRegistry;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

/// One `<parameter>` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterDeclaration {
    pub name: String,
    pub cmdline: Option<String>,
    pub config: Option<String>,
    pub attach_outer: Option<String>,
    /// Mirrors `create_outer_parameter` (spec §4.G): if the enclosing group
    /// has no same-named parameter, create a proxy there instead of failing.
    pub create_outer: bool,
    pub value: String,
}

/// One `<edge>` declaration; `source`/`target` are qualified names,
/// resolved against the whole tree at instantiation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeDeclaration {
    pub source: String,
    pub target: String,
}

/// The parsed (but not yet instantiated) content of a finstructable group
/// or one of its nested `<element>` children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupDescription {
    pub name: String,
    pub ports: Vec<PortCreationEntry>,
    pub parameters: Vec<ParameterDeclaration>,
    pub edges: Vec<EdgeDeclaration>,
    pub children: Vec<GroupDescription>,
}

impl GroupDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn parse_xml(xml: &str) -> CoreResult<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut stack: Vec<GroupDescription> = Vec::new();
        let mut root: Option<GroupDescription> = None;
        let mut pending_param: Option<ParameterDeclaration> = None;

        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(tag) => match tag.name().as_ref() {
                    b"FinstructableGroup" => {
                        let name = attr(&tag, "defaultname")?.unwrap_or_default();
                        stack.push(GroupDescription::new(name));
                    }
                    b"element" => {
                        let name = attr(&tag, "name")?
                            .ok_or_else(|| CoreError::malformed_input("element", "missing `name`"))?;
                        stack.push(GroupDescription::new(name));
                    }
                    b"parameter" => {
                        let name = attr(&tag, "name")?
                            .ok_or_else(|| CoreError::malformed_input("parameter", "missing `name`"))?;
                        pending_param = Some(ParameterDeclaration {
                            name,
                            cmdline: attr(&tag, "cmdline")?,
                            config: attr(&tag, "config")?,
                            attach_outer: attr(&tag, "attachouter")?,
                            create_outer: attr(&tag, "createouter")?.as_deref() == Some("true"),
                            value: String::new(),
                        });
                    }
                    other => {
                        return Err(CoreError::malformed_input(
                            "finstructable group xml",
                            format!("unexpected open tag `{}`", String::from_utf8_lossy(other)),
                        ))
                    }
                },
                Event::Empty(tag) => match tag.name().as_ref() {
                    b"port" => {
                        let name = attr(&tag, "name")?
                            .ok_or_else(|| CoreError::malformed_input("port", "missing `name`"))?;
                        let type_name = attr(&tag, "type")?
                            .ok_or_else(|| CoreError::malformed_input("port", "missing `type`"))?;
                        let output = attr(&tag, "output")?.as_deref() == Some("true");
                        current_mut(&mut stack)?.ports.push(PortCreationEntry {
                            name,
                            type_name,
                            output,
                        });
                    }
                    b"edge" => {
                        let source = attr(&tag, "source")?
                            .ok_or_else(|| CoreError::malformed_input("edge", "missing `source`"))?;
                        let target = attr(&tag, "target")?
                            .ok_or_else(|| CoreError::malformed_input("edge", "missing `target`"))?;
                        current_mut(&mut stack)?.edges.push(EdgeDeclaration { source, target });
                    }
                    b"parameter" => {
                        let name = attr(&tag, "name")?
                            .ok_or_else(|| CoreError::malformed_input("parameter", "missing `name`"))?;
                        current_mut(&mut stack)?.parameters.push(ParameterDeclaration {
                            name,
                            cmdline: attr(&tag, "cmdline")?,
                            config: attr(&tag, "config")?,
                            attach_outer: attr(&tag, "attachouter")?,
                            create_outer: attr(&tag, "createouter")?.as_deref() == Some("true"),
                            value: String::new(),
                        });
                    }
                    _ => {}
                },
                Event::Text(text) => {
                    if let Some(param) = pending_param.as_mut() {
                        param.value = text.unescape().map_err(xml_err)?.into_owned();
                    }
                }
                Event::End(tag) => match tag.name().as_ref() {
                    b"parameter" => {
                        if let Some(param) = pending_param.take() {
                            current_mut(&mut stack)?.parameters.push(param);
                        }
                    }
                    b"element" => {
                        let finished = stack.pop().ok_or_else(|| {
                            CoreError::malformed_input("finstructable group xml", "unbalanced `</element>`")
                        })?;
                        current_mut(&mut stack)?.children.push(finished);
                    }
                    b"FinstructableGroup" => {
                        root = Some(stack.pop().ok_or_else(|| {
                            CoreError::malformed_input(
                                "finstructable group xml",
                                "unbalanced `</FinstructableGroup>`",
                            )
                        })?);
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        root.ok_or_else(|| CoreError::malformed_input("finstructable group xml", "missing root element"))
    }

    pub fn to_xml(&self) -> CoreResult<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        let mut root = BytesStart::new("FinstructableGroup");
        if !self.name.is_empty() {
            root.push_attribute(("defaultname", self.name.as_str()));
        }
        writer.write_event(Event::Start(root)).map_err(xml_err)?;
        self.write_body(&mut writer)?;
        writer
            .write_event(Event::End(BytesEnd::new("FinstructableGroup")))
            .map_err(xml_err)?;
        String::from_utf8(writer.into_inner().into_inner())
            .map_err(|e| CoreError::malformed_input("finstructable group xml", e.to_string()))
    }

    fn write_body(&self, writer: &mut Writer<Cursor<Vec<u8>>>) -> CoreResult<()> {
        for port in &self.ports {
            let mut tag = BytesStart::new("port");
            tag.push_attribute(("name", port.name.as_str()));
            tag.push_attribute(("type", port.type_name.as_str()));
            tag.push_attribute(("output", if port.output { "true" } else { "false" }));
            writer.write_event(Event::Empty(tag)).map_err(xml_err)?;
        }
        for param in &self.parameters {
            let mut tag = BytesStart::new("parameter");
            tag.push_attribute(("name", param.name.as_str()));
            if let Some(c) = &param.cmdline {
                tag.push_attribute(("cmdline", c.as_str()));
            }
            if let Some(c) = &param.config {
                tag.push_attribute(("config", c.as_str()));
            }
            if let Some(c) = &param.attach_outer {
                tag.push_attribute(("attachouter", c.as_str()));
                tag.push_attribute(("createouter", if param.create_outer { "true" } else { "false" }));
            }
            writer.write_event(Event::Start(tag)).map_err(xml_err)?;
            writer
                .write_event(Event::Text(BytesText::new(&param.value)))
                .map_err(xml_err)?;
            writer
                .write_event(Event::End(BytesEnd::new("parameter")))
                .map_err(xml_err)?;
        }
        for edge in &self.edges {
            let mut tag = BytesStart::new("edge");
            tag.push_attribute(("source", edge.source.as_str()));
            tag.push_attribute(("target", edge.target.as_str()));
            writer.write_event(Event::Empty(tag)).map_err(xml_err)?;
        }
        for child in &self.children {
            let mut tag = BytesStart::new("element");
            tag.push_attribute(("name", child.name.as_str()));
            writer.write_event(Event::Start(tag)).map_err(xml_err)?;
            child.write_body(writer)?;
            writer
                .write_event(Event::End(BytesEnd::new("element")))
                .map_err(xml_err)?;
        }
        Ok(())
    }

    /// Declared `cmdline` option names, without instantiating anything
    /// (spec §4.H `ScanForCommandLineArgs`).
    pub fn scan_for_command_line_args(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .parameters
            .iter()
            .filter_map(|p| p.cmdline.clone())
            .collect();
        for child in &self.children {
            names.extend(child.scan_for_command_line_args());
        }
        names
    }
}

fn current_mut<'a>(stack: &'a mut [GroupDescription]) -> CoreResult<&'a mut GroupDescription> {
    stack
        .last_mut()
        .ok_or_else(|| CoreError::malformed_input("finstructable group xml", "tag outside any group"))
}

fn attr(tag: &BytesStart, key: &str) -> CoreResult<Option<String>> {
    for a in tag.attributes() {
        let a = a.map_err(|e| CoreError::malformed_input("finstructable group xml", e.to_string()))?;
        if a.key.as_ref() == key.as_bytes() {
            return Ok(Some(String::from_utf8_lossy(&a.value).into_owned()));
        }
    }
    Ok(None)
}

fn xml_err(e: quick_xml::Error) -> CoreError {
    CoreError::malformed_input("finstructable group xml", e.to_string())
}

/// A link edge whose target wasn't resolvable yet when its group was
/// instantiated — retried after each subsequent `Init` (spec §4.H).
struct PendingEdge {
    source: String,
    target: String,
}

/// Runtime counterpart of a [`GroupDescription`]: a live `FrameworkElement`
/// subtree, instantiated from or saved back to one.
pub struct FinstructableGroup {
    element: FrameworkElement,
    tree: Tree,
    pending: parking_lot::Mutex<Vec<PendingEdge>>,
}

impl FinstructableGroup {
    /// Parses `xml` and instantiates it as a child of `parent`.
    pub fn instantiate(
        tree: &Tree,
        parent: &FrameworkElement,
        types: &TypeRegistry,
        xml: &str,
        cli: &CommandLineValues,
        config: &ConfigValues,
    ) -> CoreResult<FinstructableGroup> {
        let desc = GroupDescription::parse_xml(xml)?;
        let element = tree.create_child(parent, desc.name.clone(), false)?;
        element.mark_finstructable_group();
        let group = FinstructableGroup {
            element: element.clone(),
            tree: tree.clone(),
            pending: parking_lot::Mutex::new(Vec::new()),
        };
        group.build(&desc, &element, types, cli, config)?;
        group.resolve_edges();
        element.init();
        group.retry_pending_link_edges();
        Ok(group)
    }

    fn build(
        &self,
        desc: &GroupDescription,
        element: &FrameworkElement,
        types: &TypeRegistry,
        cli: &CommandLineValues,
        config: &ConfigValues,
    ) -> CoreResult<()> {
        for port in &desc.ports {
            let data_type = types
                .find_type(&port.type_name)
                .ok_or_else(|| CoreError::lookup_miss(format!("type `{}`", port.type_name)))
                .map_err(|e| e.with_context(element.qualified_name()))?;
            AbstractPort::create(
                &self.tree,
                element,
                port.name.clone(),
                data_type,
                PortFlags {
                    output: port.output,
                    ..Default::default()
                },
            )
            .map_err(|e| e.with_context(element.qualified_name()))?;
        }

        let params = element.annotation_or_create(ParameterList::new);
        for param_decl in &desc.parameters {
            let param = StructureParameter::new(param_decl.name.clone(), param_decl.value.clone());
            let param = if let Some(key) = &param_decl.cmdline {
                param.with_cmdline_key(key.clone())
            } else {
                param
            };
            let param = if let Some(key) = &param_decl.config {
                param.with_config_key(key.clone())
            } else {
                param
            };
            let param = if let Some(outer) = &param_decl.attach_outer {
                param.with_outer_attachment(outer.clone(), param_decl.create_outer)
            } else {
                param
            };
            param
                .set_xml_value(&param_decl.value)
                .map_err(|e| e.with_context(element.qualified_name()))?;
            param
                .update_and_possibly_load(cli, config)
                .map_err(|e| e.with_context(element.qualified_name()))?;
            let param = Arc::new(param);

            if let Some(outer_name) = param.outer_attachment_name() {
                attach_to_outer_parameter(element, &param, &outer_name);
            }
            params.push(param);
        }

        for edge in &desc.edges {
            self.pending.lock().push(PendingEdge {
                source: qualify(element, &edge.source),
                target: qualify(element, &edge.target),
            });
        }

        for child_desc in &desc.children {
            let child_element = self.tree.create_child(element, child_desc.name.clone(), false)?;
            self.build(child_desc, &child_element, types, cli, config)?;
        }
        Ok(())
    }

    fn resolve_edges(&self) {
        let mut still_pending = Vec::new();
        for edge in self.pending.lock().drain(..) {
            let source = find_port_by_qualified_name(&self.tree, &edge.source);
            let target = find_port_by_qualified_name(&self.tree, &edge.target);
            match (source, target) {
                (Some(s), Some(t)) => {
                    let _ = s.connect(&t);
                }
                _ => still_pending.push(edge),
            }
        }
        *self.pending.lock() = still_pending;
    }

    /// Re-attempts any edges whose target wasn't resolvable at
    /// instantiation time. Returns how many are still unresolved.
    pub fn retry_pending_link_edges(&self) -> usize {
        self.resolve_edges();
        self.pending.lock().len()
    }

    pub fn element(&self) -> &FrameworkElement {
        &self.element
    }

    /// Walks this group's primary children in (creation) order, emitting
    /// the reverse of [`Self::instantiate`] (spec §4.H `Save`).
    pub fn save(&self) -> GroupDescription {
        Self::save_element(&self.element)
    }

    fn save_element(element: &FrameworkElement) -> GroupDescription {
        let mut desc = GroupDescription::new(element.name());
        for port in element.ports().into_iter().filter_map(AbstractPort::from_element) {
            desc.ports.push(PortCreationEntry {
                name: port.element().name().to_string(),
                type_name: port.data_type().name().to_string(),
                output: port.is_output(),
            });
            for target in port.outgoing_edges() {
                desc.edges.push(EdgeDeclaration {
                    source: unqualify(element, &port.element().qualified_name()),
                    target: unqualify(element, &target.element().qualified_name()),
                });
            }
        }
        if let Some(params) = element.annotation::<ParameterList>() {
            for param in params.all() {
                desc.parameters.push(ParameterDeclaration {
                    name: param.name().to_string(),
                    cmdline: param.cmdline_key().map(str::to_string),
                    config: param.config_key().map(str::to_string),
                    attach_outer: param.outer_attachment_name(),
                    create_outer: param.creates_outer_if_absent(),
                    value: param.xml_serialization_value(),
                });
            }
        }
        for child in element.children() {
            if child.is_port() {
                continue;
            }
            desc.children.push(Self::save_element(&child));
        }
        desc
    }
}

/// Resolves a `<parameter attachouter="...">` declaration (spec §4.G):
/// finds the enclosing `FinstructableGroup`'s same-named parameter and
/// attaches to it, creating a proxy there first if absent and the
/// declaration allows it (`createouter="true"`). Silently does nothing if
/// there's no enclosing group or the outer parameter is missing and
/// creation wasn't requested — matching `AttachToOuterParameter`'s
/// best-effort contract rather than failing the whole instantiation.
fn attach_to_outer_parameter(
    element: &FrameworkElement,
    param: &Arc<StructureParameter<String>>,
    outer_name: &str,
) {
    let Some(outer_group) = element.parent_finstructable_group() else {
        return;
    };
    let outer_params = outer_group.annotation_or_create(ParameterList::new);
    let outer_param = match outer_params.find(outer_name) {
        Some(existing) => existing,
        None if param.creates_outer_if_absent() => {
            let created = Arc::new(StructureParameter::new(outer_name.to_string(), param.get()));
            outer_params.push(created.clone());
            created
        }
        None => return,
    };
    param.attach_to(&outer_param);
}

fn qualify(element: &FrameworkElement, name: &str) -> String {
    if name.contains('.') {
        name.to_string()
    } else {
        format!("{}.{}", element.qualified_name(), name)
    }
}

/// Inverse of [`qualify`]: strips `element`'s own qualified-name prefix so a
/// name re-qualified against the same `element` on the next load round-trips
/// to the same target. A name outside `element`'s subtree is left fully
/// qualified, which `qualify` already passes through unchanged.
fn unqualify(element: &FrameworkElement, qualified_name: &str) -> String {
    let prefix = format!("{}.", element.qualified_name());
    qualified_name
        .strip_prefix(prefix.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| qualified_name.to_string())
}

fn find_port_by_qualified_name(tree: &Tree, qualified_name: &str) -> Option<AbstractPort> {
    tree.root()
        .descendants()
        .into_iter()
        .find(|e| e.is_port() && e.qualified_name() == qualified_name)
        .and_then(AbstractPort::from_element)
}
