// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Exclusive XML canonicalization.

This implements Exclusive XML Canonicalization 1.0 without comments
(`http://www.w3.org/2001/10/xml-exc-c14n#`) over [Document] and [Element]
trees. No inclusive namespace prefix list is supported, as manifests never
use one.
*/

use {
    crate::document::{Document, Element, Node, XML_NAMESPACE},
    std::collections::BTreeMap,
};

/// Algorithm URI of exclusive canonicalization without comments.
pub const EXC_C14N_ALGORITHM: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";

/// Canonicalize a whole document.
pub fn canonicalize_document(document: &Document) -> Vec<u8> {
    let mut out = String::new();

    for node in &document.prolog {
        if let Node::ProcessingInstruction { target, data } = node {
            write_processing_instruction(target, data.as_deref(), &mut out);
            out.push('\n');
        }
    }

    write_element(&document.root, &BTreeMap::new(), &mut out);

    for node in &document.epilog {
        if let Node::ProcessingInstruction { target, data } = node {
            out.push('\n');
            write_processing_instruction(target, data.as_deref(), &mut out);
        }
    }

    out.into_bytes()
}

/// Canonicalize an element subtree as the apex of the output node-set.
pub fn canonicalize_element(element: &Element) -> Vec<u8> {
    let mut out = String::new();
    write_element(element, &BTreeMap::new(), &mut out);
    out.into_bytes()
}

fn write_element(element: &Element, rendered: &BTreeMap<String, String>, out: &mut String) {
    // Namespaces visibly utilized by this element, keyed by prefix. The
    // default namespace uses the empty prefix.
    let mut utilized = BTreeMap::new();
    utilized.insert(
        element.prefix.clone().unwrap_or_default(),
        element.namespace.clone().unwrap_or_default(),
    );
    for attr in &element.attributes {
        if let (Some(prefix), Some(namespace)) = (&attr.prefix, &attr.namespace) {
            if namespace != XML_NAMESPACE {
                utilized.insert(prefix.clone(), namespace.clone());
            }
        }
    }

    let mut in_output = rendered.clone();
    let mut declarations = vec![];

    for (prefix, uri) in utilized {
        let current = rendered.get(&prefix).map(|x| x.as_str());

        let emit = if prefix.is_empty() {
            current.unwrap_or("") != uri
        } else {
            current != Some(uri.as_str())
        };

        if emit {
            in_output.insert(prefix.clone(), uri.clone());
            declarations.push((prefix, uri));
        }
    }

    let mut attributes = element.attributes.iter().collect::<Vec<_>>();
    attributes.sort_by(|a, b| {
        let a_key = (a.namespace.as_deref().unwrap_or(""), a.local_name.as_str());
        let b_key = (b.namespace.as_deref().unwrap_or(""), b.local_name.as_str());
        a_key.cmp(&b_key)
    });

    let name = element.qualified_name();
    out.push('<');
    out.push_str(&name);

    // Sorted by prefix with the default namespace first.
    for (prefix, uri) in &declarations {
        if prefix.is_empty() {
            out.push_str(" xmlns=\"");
        } else {
            out.push_str(" xmlns:");
            out.push_str(prefix);
            out.push_str("=\"");
        }
        escape_attribute(uri, out);
        out.push('"');
    }

    for attr in attributes {
        out.push(' ');
        out.push_str(&attr.qualified_name());
        out.push_str("=\"");
        escape_attribute(&attr.value, out);
        out.push('"');
    }

    out.push('>');

    for child in &element.children {
        match child {
            Node::Element(e) => write_element(e, &in_output, out),
            Node::Text(t) | Node::CData(t) => escape_text(t, out),
            Node::ProcessingInstruction { target, data } => {
                write_processing_instruction(target, data.as_deref(), out)
            }
            Node::Comment(_) => {}
        }
    }

    out.push_str("</");
    out.push_str(&name);
    out.push('>');
}

fn write_processing_instruction(target: &str, data: Option<&str>, out: &mut String) {
    out.push_str("<?");
    out.push_str(target);
    if let Some(data) = data.filter(|x| !x.is_empty()) {
        out.push(' ');
        out.push_str(data);
    }
    out.push_str("?>");
}

fn escape_text(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

fn escape_attribute(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}
