// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! In-memory XML trees for manifest documents.

Manifests are small, so they are loaded completely into a tree of
[Element] and [Node] values, mutated in place and written back out.
Every element and attribute records the namespace URI it resolved to at
parse time (or was created with). This allows canonicalization and
serialization to work without re-resolving prefixes against ancestors.
*/

use {
    crate::error::ClickOnceCodesignError,
    std::{
        borrow::Cow,
        collections::BTreeMap,
        io::{Read, Write},
        path::Path,
    },
    xml::{
        attribute::Attribute as XmlAttribute,
        common::XmlVersion,
        name::Name,
        namespace::Namespace as XmlNamespace,
        reader::{EventReader, ParserConfig, XmlEvent},
        writer::{EmitterConfig, EventWriter, XmlEvent as WriterEvent},
    },
};

/// Namespace URI reserved for the `xml` prefix.
pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// An attribute on an element.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attribute {
    pub prefix: Option<String>,
    pub local_name: String,
    pub namespace: Option<String>,
    pub value: String,
}

impl Attribute {
    /// Construct an attribute without a namespace.
    pub fn new(local_name: impl ToString, value: impl ToString) -> Self {
        Self {
            prefix: None,
            local_name: local_name.to_string(),
            namespace: None,
            value: value.to_string(),
        }
    }

    /// The name of the attribute as written in a document.
    pub fn qualified_name(&self) -> String {
        qualified_name(self.prefix.as_deref(), &self.local_name)
    }
}

/// A node in the tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
    CData(String),
    Comment(String),
    ProcessingInstruction { target: String, data: Option<String> },
}

impl From<Element> for Node {
    fn from(e: Element) -> Self {
        Self::Element(e)
    }
}

/// An XML element.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Element {
    pub prefix: Option<String>,
    pub local_name: String,
    pub namespace: Option<String>,
    /// Namespace declarations appearing on this element. `None` is the default namespace.
    pub namespace_declarations: Vec<(Option<String>, String)>,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
}

impl Element {
    /// Construct an element in no namespace.
    pub fn new(local_name: impl ToString) -> Self {
        Self {
            local_name: local_name.to_string(),
            ..Default::default()
        }
    }

    /// Construct an element in a namespace, optionally bound to a prefix.
    pub fn new_ns(prefix: Option<&str>, local_name: impl ToString, namespace: &str) -> Self {
        Self {
            prefix: prefix.map(|x| x.to_string()),
            local_name: local_name.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }
    }

    /// The name of the element as written in a document.
    pub fn qualified_name(&self) -> String {
        qualified_name(self.prefix.as_deref(), &self.local_name)
    }

    /// Whether this element has the given local name and one of the given namespaces.
    pub fn is(&self, namespaces: &[&str], local_name: &str) -> bool {
        self.local_name == local_name
            && match &self.namespace {
                Some(ns) => namespaces.contains(&ns.as_str()),
                None => namespaces.is_empty(),
            }
    }

    /// Declare a namespace on this element, replacing an existing declaration of the prefix.
    pub fn declare_namespace(&mut self, prefix: Option<&str>, uri: impl ToString) {
        let prefix = prefix.map(|x| x.to_string());
        self.namespace_declarations.retain(|(p, _)| p != &prefix);
        self.namespace_declarations.push((prefix, uri.to_string()));
    }

    pub fn with_namespace_declaration(mut self, prefix: Option<&str>, uri: impl ToString) -> Self {
        self.declare_namespace(prefix, uri);
        self
    }

    /// Obtain the value of an attribute in no namespace.
    pub fn attribute(&self, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.namespace.is_none() && a.local_name == local_name)
            .map(|a| a.value.as_str())
    }

    /// Obtain the value of a namespaced attribute.
    pub fn attribute_ns(&self, namespace: &str, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.namespace.as_deref() == Some(namespace) && a.local_name == local_name)
            .map(|a| a.value.as_str())
    }

    /// Set an attribute in no namespace, replacing any existing value.
    pub fn set_attribute(&mut self, local_name: &str, value: impl ToString) {
        if let Some(attr) = self
            .attributes
            .iter_mut()
            .find(|a| a.namespace.is_none() && a.local_name == local_name)
        {
            attr.value = value.to_string();
        } else {
            self.attributes.push(Attribute::new(local_name, value));
        }
    }

    pub fn with_attribute(mut self, local_name: &str, value: impl ToString) -> Self {
        self.set_attribute(local_name, value);
        self
    }

    /// Set a namespaced attribute, replacing any existing value.
    pub fn set_attribute_ns(
        &mut self,
        prefix: &str,
        local_name: &str,
        namespace: &str,
        value: impl ToString,
    ) {
        if let Some(attr) = self.attributes.iter_mut().find(|a| {
            a.namespace.as_deref() == Some(namespace) && a.local_name == local_name
        }) {
            attr.value = value.to_string();
        } else {
            self.attributes.push(Attribute {
                prefix: Some(prefix.to_string()),
                local_name: local_name.to_string(),
                namespace: Some(namespace.to_string()),
                value: value.to_string(),
            });
        }
    }

    pub fn remove_attribute(&mut self, local_name: &str) -> Option<String> {
        let index = self
            .attributes
            .iter()
            .position(|a| a.namespace.is_none() && a.local_name == local_name)?;

        Some(self.attributes.remove(index).value)
    }

    /// Append a child node.
    pub fn push(&mut self, node: impl Into<Node>) {
        self.children.push(node.into());
    }

    pub fn with_child(mut self, node: impl Into<Node>) -> Self {
        self.push(node);
        self
    }

    /// Append text, merging it with a directly preceding text node.
    pub fn push_text(&mut self, text: &str) {
        if let Some(Node::Text(existing)) = self.children.last_mut() {
            existing.push_str(text);
        } else {
            self.children.push(Node::Text(text.to_string()));
        }
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.push_text(text);
        self
    }

    /// Replace all children with a single text node.
    pub fn set_text(&mut self, text: &str) {
        self.children = vec![Node::Text(text.to_string())];
    }

    /// The concatenated text content of this element and its descendants.
    pub fn text(&self) -> String {
        let mut s = String::new();
        collect_text(self, &mut s);
        s
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    pub fn child_elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    /// Find the first child element with a name.
    pub fn child(&self, namespaces: &[&str], local_name: &str) -> Option<&Element> {
        self.child_elements()
            .find(|e| e.is(namespaces, local_name))
    }

    pub fn child_mut(&mut self, namespaces: &[&str], local_name: &str) -> Option<&mut Element> {
        self.child_elements_mut()
            .find(|e| e.is(namespaces, local_name))
    }

    /// Iterate over child elements with a name.
    pub fn children_named<'a>(
        &'a self,
        namespaces: &'a [&'a str],
        local_name: &'a str,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        self.child_elements()
            .filter(move |e| e.is(namespaces, local_name))
    }

    /// Index into `children` of the first child element with a name.
    pub fn child_position(&self, namespaces: &[&str], local_name: &str) -> Option<usize> {
        self.children.iter().position(|n| match n {
            Node::Element(e) => e.is(namespaces, local_name),
            _ => false,
        })
    }

    /// Find the first descendant element with a name, in document order.
    pub fn descendant(&self, namespaces: &[&str], local_name: &str) -> Option<&Element> {
        for child in self.child_elements() {
            if child.is(namespaces, local_name) {
                return Some(child);
            }
            if let Some(found) = child.descendant(namespaces, local_name) {
                return Some(found);
            }
        }

        None
    }

    /// Find the first descendant element carrying an ID attribute with a value.
    pub fn descendant_with_id(&self, id_attributes: &[&str], id: &str) -> Option<&Element> {
        for child in self.child_elements() {
            if id_attributes
                .iter()
                .any(|name| child.attribute(name) == Some(id))
            {
                return Some(child);
            }
            if let Some(found) = child.descendant_with_id(id_attributes, id) {
                return Some(found);
            }
        }

        None
    }

    /// Remove child elements matching a name. Returns the number removed.
    pub fn remove_children(&mut self, namespaces: &[&str], local_name: &str) -> usize {
        let before = self.children.len();
        self.children.retain(|n| match n {
            Node::Element(e) => !e.is(namespaces, local_name),
            _ => true,
        });

        before - self.children.len()
    }
}

fn collect_text(element: &Element, s: &mut String) {
    for child in &element.children {
        match child {
            Node::Text(t) | Node::CData(t) => s.push_str(t),
            Node::Element(e) => collect_text(e, s),
            _ => {}
        }
    }
}

fn qualified_name(prefix: Option<&str>, local_name: &str) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{}:{}", prefix, local_name),
        _ => local_name.to_string(),
    }
}

/// The `<?xml ...?>` declaration of a document.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct XmlDeclaration {
    pub version: String,
    pub standalone: Option<bool>,
}

/// A parsed XML document.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Document {
    pub declaration: Option<XmlDeclaration>,
    /// Comments and processing instructions preceding the root element.
    pub prolog: Vec<Node>,
    pub root: Element,
    /// Comments and processing instructions following the root element.
    pub epilog: Vec<Node>,
}

impl Document {
    /// Construct a document from a root element, without an XML declaration.
    pub fn from_root(root: Element) -> Self {
        Self {
            declaration: None,
            prolog: vec![],
            root,
            epilog: vec![],
        }
    }

    /// Parse a document, preserving all whitespace.
    ///
    /// Line endings in text, attribute values and markup content are
    /// normalized to LF.
    pub fn parse(data: impl Read) -> Result<Self, ClickOnceCodesignError> {
        Self::parse_with_options(data, true)
    }

    /// Parse a document, optionally discarding whitespace-only text.
    pub fn parse_with_options(
        data: impl Read,
        preserve_whitespace: bool,
    ) -> Result<Self, ClickOnceCodesignError> {
        let config = ParserConfig::new()
            .trim_whitespace(false)
            .whitespace_to_characters(false)
            .cdata_to_characters(false)
            .ignore_comments(false)
            .coalesce_characters(true)
            .ignore_root_level_whitespace(true);

        let reader = EventReader::new_with_config(data, config);

        let mut declaration = None;
        let mut prolog = vec![];
        let mut epilog = vec![];
        let mut root = None;
        // Open elements and the namespace bindings in scope for each.
        let mut stack: Vec<(Element, BTreeMap<String, String>)> = vec![];

        for event in reader {
            match event? {
                XmlEvent::StartDocument {
                    version,
                    standalone,
                    ..
                } => {
                    declaration = Some(XmlDeclaration {
                        version: version.to_string(),
                        standalone,
                    });
                }
                XmlEvent::EndDocument => break,
                XmlEvent::StartElement {
                    name,
                    attributes,
                    namespace,
                } => {
                    let empty = BTreeMap::new();
                    let parent_scope = stack.last().map(|(_, scope)| scope).unwrap_or(&empty);

                    let mut element = Element {
                        prefix: name.prefix.filter(|p| !p.is_empty()),
                        local_name: name.local_name,
                        namespace: name.namespace.filter(|ns| !ns.is_empty()),
                        ..Default::default()
                    };

                    for (prefix, uri) in namespace.0.iter() {
                        if prefix == "xml" || prefix == "xmlns" {
                            continue;
                        }

                        let inherited = parent_scope.get(prefix).map(|x| x.as_str());
                        let changed = match inherited {
                            Some(existing) => existing != uri,
                            None => !(prefix.is_empty() && uri.is_empty()),
                        };

                        if changed {
                            let prefix = if prefix.is_empty() {
                                None
                            } else {
                                Some(prefix.clone())
                            };
                            element.namespace_declarations.push((prefix, uri.clone()));
                        }
                    }

                    element.attributes = attributes
                        .into_iter()
                        .map(|a| Attribute {
                            prefix: a.name.prefix.filter(|p| !p.is_empty()),
                            local_name: a.name.local_name,
                            namespace: a.name.namespace.filter(|ns| !ns.is_empty()),
                            value: normalize_line_endings(a.value),
                        })
                        .collect();

                    stack.push((element, namespace.0));
                }
                XmlEvent::EndElement { .. } => {
                    let (element, _) = stack.pop().ok_or_else(|| {
                        ClickOnceCodesignError::ManifestMalformed("unbalanced end element".into())
                    })?;

                    if let Some((parent, _)) = stack.last_mut() {
                        parent.push(element);
                    } else {
                        root = Some(element);
                    }
                }
                XmlEvent::Characters(text) => {
                    if let Some((parent, _)) = stack.last_mut() {
                        parent.push_text(&normalize_line_endings(text));
                    }
                }
                XmlEvent::Whitespace(text) => {
                    if preserve_whitespace {
                        if let Some((parent, _)) = stack.last_mut() {
                            parent.push_text(&normalize_line_endings(text));
                        }
                    }
                }
                XmlEvent::CData(text) => {
                    if let Some((parent, _)) = stack.last_mut() {
                        parent.push(Node::CData(normalize_line_endings(text)));
                    }
                }
                XmlEvent::Comment(text) => {
                    let node = Node::Comment(normalize_line_endings(text));
                    match (stack.last_mut(), &root) {
                        (Some((parent, _)), _) => parent.push(node),
                        (None, None) => prolog.push(node),
                        (None, Some(_)) => epilog.push(node),
                    }
                }
                XmlEvent::ProcessingInstruction { name, data } => {
                    let node = Node::ProcessingInstruction {
                        target: name,
                        data: data.map(normalize_line_endings),
                    };
                    match (stack.last_mut(), &root) {
                        (Some((parent, _)), _) => parent.push(node),
                        (None, None) => prolog.push(node),
                        (None, Some(_)) => epilog.push(node),
                    }
                }
            }
        }

        let root = root.ok_or_else(|| {
            ClickOnceCodesignError::ManifestMalformed("document has no root element".into())
        })?;

        Ok(Self {
            declaration,
            prolog,
            root,
            epilog,
        })
    }

    /// Parse a document from a filesystem path.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ClickOnceCodesignError> {
        let data = std::fs::read(path.as_ref())?;
        Self::parse(data.as_slice())
    }

    /// Serialize this document to XML bytes.
    ///
    /// An XML declaration is only written if the document was parsed with one.
    /// Namespace declarations are written where the tree records them, plus any
    /// binding a name needs that is not in scope at that point.
    pub fn to_xml(&self) -> Result<Vec<u8>, ClickOnceCodesignError> {
        let mut writer = EmitterConfig::new()
            .perform_indent(false)
            .write_document_declaration(false)
            .autopad_comments(false)
            .pad_self_closing(true)
            .create_writer(Vec::new());

        if let Some(decl) = &self.declaration {
            writer.write(WriterEvent::StartDocument {
                version: if decl.version == "1.1" {
                    XmlVersion::Version11
                } else {
                    XmlVersion::Version10
                },
                encoding: Some("utf-8"),
                standalone: decl.standalone,
            })?;
            writer.write(WriterEvent::characters("\n"))?;
        }

        for node in &self.prolog {
            write_node(node, &mut vec![], &mut writer)?;
            writer.write(WriterEvent::characters("\n"))?;
        }

        write_element(&self.root, &mut vec![], &mut writer)?;

        for node in &self.epilog {
            writer.write(WriterEvent::characters("\n"))?;
            write_node(node, &mut vec![], &mut writer)?;
        }

        Ok(writer.into_inner())
    }

    /// Serialize and parse again with whitespace preserved.
    ///
    /// The result is the form a consumer reading the written file sees, with
    /// line endings normalized and bindings made explicit.
    pub fn reparsed(&self) -> Result<Self, ClickOnceCodesignError> {
        Self::parse(self.to_xml()?.as_slice())
    }

    /// Write this document to a filesystem path.
    pub fn write_to_path(&self, path: impl AsRef<Path>) -> Result<(), ClickOnceCodesignError> {
        std::fs::write(path.as_ref(), self.to_xml()?)?;
        Ok(())
    }
}

/// Turn CRLF pairs and lone CRs into LF, as an XML processor must on input.
pub fn normalize_line_endings(s: String) -> String {
    if !s.contains('\r') {
        return s;
    }

    s.replace("\r\n", "\n").replace('\r', "\n")
}

/// Resolve a prefix against a stack of bindings. Innermost bindings win.
fn lookup<'a>(scope: &'a [(Option<String>, String)], prefix: Option<&str>) -> Option<&'a str> {
    scope
        .iter()
        .rev()
        .find(|(p, _)| p.as_deref() == prefix)
        .map(|(_, uri)| uri.as_str())
}

fn write_node<W: Write>(
    node: &Node,
    scope: &mut Vec<(Option<String>, String)>,
    writer: &mut EventWriter<W>,
) -> xml::writer::Result<()> {
    match node {
        Node::Element(e) => write_element(e, scope, writer),
        Node::Text(t) => writer.write(WriterEvent::characters(t)),
        Node::CData(t) => writer.write(WriterEvent::cdata(t)),
        Node::Comment(t) => writer.write(WriterEvent::comment(t)),
        Node::ProcessingInstruction { target, data } => {
            writer.write(WriterEvent::processing_instruction(target, data.as_deref()))
        }
    }
}

fn write_element<W: Write>(
    element: &Element,
    scope: &mut Vec<(Option<String>, String)>,
    writer: &mut EventWriter<W>,
) -> xml::writer::Result<()> {
    let scope_len = scope.len();

    let mut declarations = element.namespace_declarations.clone();
    scope.extend(declarations.iter().cloned());

    // Bindings required by the names used on this element that are not in scope.
    let mut required = vec![(element.prefix.clone(), element.namespace.clone())];
    required.extend(
        element
            .attributes
            .iter()
            .filter(|a| a.namespace.is_some())
            .map(|a| (a.prefix.clone(), a.namespace.clone())),
    );

    for (prefix, namespace) in required {
        if prefix.as_deref() == Some("xml") {
            continue;
        }

        let current = lookup(scope, prefix.as_deref()).unwrap_or("");
        let wanted = namespace.unwrap_or_default();

        if current != wanted {
            declarations.push((prefix.clone(), wanted.clone()));
            scope.push((prefix, wanted));
        }
    }

    // Declarations are emitted as plain attributes so that undeclaring the
    // default namespace (xmlns="") survives. The emitter's own namespace stack
    // is left empty.
    let mut attributes = declarations
        .iter()
        .map(|(prefix, uri)| XmlAttribute {
            name: match prefix {
                Some(prefix) => Name::prefixed(prefix.as_str(), "xmlns"),
                None => Name::local("xmlns"),
            },
            value: uri.as_str(),
        })
        .collect::<Vec<_>>();
    attributes.extend(element.attributes.iter().map(|a| XmlAttribute {
        name: match &a.prefix {
            Some(prefix) => Name::prefixed(a.local_name.as_str(), prefix.as_str()),
            None => Name::local(a.local_name.as_str()),
        },
        value: a.value.as_str(),
    }));

    writer.write(WriterEvent::StartElement {
        name: match &element.prefix {
            Some(prefix) => Name::prefixed(element.local_name.as_str(), prefix.as_str()),
            None => Name::local(element.local_name.as_str()),
        },
        attributes: Cow::Owned(attributes),
        namespace: Cow::Owned(XmlNamespace::empty()),
    })?;

    for child in &element.children {
        write_node(child, scope, writer)?;
    }

    writer.write(WriterEvent::end_element())?;

    scope.truncate(scope_len);

    Ok(())
}
