//! GENA property-set parsing.

use xmltree::{Element, XMLNode};

use crate::error::{CallbackError, Result};

/// Extract the properties of a GENA notification body.
///
/// Every element child of every `<property>` element below the root becomes
/// one `(local name, text)` pair, in document order.
pub fn parse_property_set(body: &[u8]) -> Result<Vec<(String, String)>> {
    let root = Element::parse(body).map_err(|e| CallbackError::PropertySet(e.to_string()))?;
    let properties = root
        .children
        .iter()
        .filter_map(as_element)
        .filter(|node| node.name.eq_ignore_ascii_case("property"))
        .flat_map(|property| property.children.iter().filter_map(as_element))
        .map(|variable| (variable.name.clone(), text_of(variable)))
        .collect();
    Ok(properties)
}

fn as_element(node: &XMLNode) -> Option<&Element> {
    match node {
        XMLNode::Element(element) => Some(element),
        _ => None,
    }
}

fn text_of(element: &Element) -> String {
    element
        .children
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
    fn test_parse_property_set() {
        let body = br#"<?xml version="1.0"?>
<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0">
  <e:property><Volume>25</Volume></e:property>
  <e:property><Mute>0</Mute><PresetNameList>FactoryDefaults</PresetNameList></e:property>
</e:propertyset>"#;

        let properties = parse_property_set(body).unwrap();
        assert_eq!(
            properties,
            vec![
                ("Volume".to_string(), "25".to_string()),
                ("Mute".to_string(), "0".to_string()),
                ("PresetNameList".to_string(), "FactoryDefaults".to_string()),
            ]
        );
    }

    #[test]
    fn test_escaped_last_change_is_unescaped() {
        let body = br#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><LastChange>&lt;Event&gt;&lt;InstanceID val="0"/&gt;&lt;/Event&gt;</LastChange></e:property></e:propertyset>"#;

        let properties = parse_property_set(body).unwrap();
        assert_eq!(properties[0].0, "LastChange");
        assert_eq!(properties[0].1, r#"<Event><InstanceID val="0"/></Event>"#);
    }

    #[test]
    fn test_other_children_are_ignored() {
        let body = br#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:other><A>1</A></e:other><e:property><B/></e:property></e:propertyset>"#;
        let properties = parse_property_set(body).unwrap();
        assert_eq!(properties, vec![("B".to_string(), String::new())]);
    }

    #[test]
    fn test_invalid_xml() {
        assert!(matches!(
            parse_property_set(b"<e:propertyset><unclosed>"),
            Err(CallbackError::PropertySet(_))
        ));
    }
}
