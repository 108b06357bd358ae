//! Tag lookup in UPnP description documents.
//!
//! Descriptions are expected in the UPnP device or service namespace, but
//! devices in the wild omit or misspell it. A lookup first collects the
//! matching elements in the expected namespace and, when there are none,
//! falls back to matching the local name in any namespace.

use xmltree::{Element, XMLNode};

pub(crate) const DEVICE_NAMESPACE: &str = "urn:schemas-upnp-org:device-1-0";
pub(crate) const SERVICE_NAMESPACE: &str = "urn:schemas-upnp-org:service-1-0";

/// Lookup rooted in one expected namespace
#[derive(Debug, Clone, Copy)]
pub(crate) struct Namespace(&'static str);

/// Device description lookups
pub(crate) const DEVICE: Namespace = Namespace(DEVICE_NAMESPACE);
/// Service description lookups
pub(crate) const SERVICE: Namespace = Namespace(SERVICE_NAMESPACE);

impl Namespace {
    /// Descendants of `node` named `tag`, in document order.
    pub(crate) fn elements<'a>(self, node: &'a Element, tag: &str) -> Vec<&'a Element> {
        let mut found = Vec::new();
        collect_matching(
            node,
            &|e: &Element| e.name == tag && e.namespace.as_deref() == Some(self.0),
            &mut found,
        );
        if found.is_empty() {
            collect_matching(node, &|e: &Element| e.name == tag, &mut found);
        }
        found
    }

    pub(crate) fn first<'a>(self, node: &'a Element, tag: &str) -> Option<&'a Element> {
        self.elements(node, tag).into_iter().next()
    }

    /// Text of the first descendant named `tag`.
    pub(crate) fn text(self, node: &Element, tag: &str) -> Option<String> {
        self.first(node, tag).map(text)
    }
}

fn collect_matching<'a>(node: &'a Element, matches: &dyn Fn(&Element) -> bool, found: &mut Vec<&'a Element>) {
    for child in child_elements(node) {
        if matches(child) {
            found.push(child);
        }
        collect_matching(child, matches, found);
    }
}

pub(crate) fn child_elements(node: &Element) -> impl Iterator<Item = &Element> {
    node.children.iter().filter_map(|child| match child {
        XMLNode::Element(element) => Some(element),
        _ => None,
    })
}

/// Concatenated text children of `node`, without descending.
pub(crate) fn text(node: &Element) -> String {
    node.children
        .iter()
        .filter_map(|child| match child {
            XMLNode::Text(text) | XMLNode::CData(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaced_lookup_wins() {
        let xml = r#"<root xmlns="urn:schemas-upnp-org:device-1-0" xmlns:x="urn:other">
            <x:friendlyName>Spoof</x:friendlyName>
            <device><friendlyName>Living Room</friendlyName></device>
        </root>"#;
        let root = Element::parse(xml.as_bytes()).unwrap();
        assert_eq!(DEVICE.text(&root, "friendlyName").as_deref(), Some("Living Room"));
        assert_eq!(DEVICE.elements(&root, "friendlyName").len(), 1);
    }

    #[test]
    fn test_wildcard_fallback() {
        let xml = r#"<root xmlns:x="urn:other"><x:device><x:UDN>uuid:1234</x:UDN></x:device></root>"#;
        let root = Element::parse(xml.as_bytes()).unwrap();
        assert_eq!(DEVICE.text(&root, "UDN").as_deref(), Some("uuid:1234"));
        assert!(DEVICE.first(&root, "missing").is_none());
    }

    #[test]
    fn test_elements_in_document_order() {
        let xml = r#"<scpd xmlns="urn:schemas-upnp-org:service-1-0">
            <actionList>
              <action><name>Play</name></action>
              <action><name>Stop</name></action>
            </actionList>
        </scpd>"#;
        let root = Element::parse(xml.as_bytes()).unwrap();
        let names: Vec<String> = SERVICE
            .elements(&root, "action")
            .into_iter()
            .filter_map(|action| SERVICE.text(action, "name"))
            .collect();
        assert_eq!(names, vec!["Play", "Stop"]);
    }

    #[test]
    fn test_text_ignores_nested_elements() {
        let root = Element::parse("<a>one<b>two</b>three</a>".as_bytes()).unwrap();
        assert_eq!(text(&root), "onethree");
        assert_eq!(child_elements(&root).count(), 1);
    }
}
