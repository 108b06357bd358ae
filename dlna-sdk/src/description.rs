//! Device and service description parsing.
//!
//! A device description is checked in two steps. [`identify`] validates the
//! device type and extracts the UDN, which is all the registry needs to tell
//! whether the device is already known. [`describe`] then builds the complete
//! record, fetching each service description through the supplied closure.

use std::sync::Arc;

use url::Url;
use xmltree::Element;

use crate::device::{Action, Argument, Device, DeviceKind, DeviceStatus, Direction, Service};
use crate::error::{DlnaError, Result};
use crate::xml::{self, DEVICE, SERVICE};

/// Host part of an absolute URL, without port.
pub(crate) fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(str::to_string)
}

fn join(base: &str, reference: &str) -> Option<String> {
    Url::parse(base)
        .ok()?
        .join(reference.trim())
        .ok()
        .map(String::from)
}

pub(crate) fn parse_document(body: &[u8]) -> Result<Element> {
    Element::parse(body).map_err(|e| DlnaError::Description(e.to_string()))
}

/// Check the declared device type against `kind` and return the UDN.
pub(crate) fn identify(root: &Element, kind: DeviceKind) -> Result<String> {
    let device_type = DEVICE
        .text(root, "deviceType")
        .ok_or_else(|| DlnaError::Description("missing deviceType".to_string()))?;
    if !kind.matches_type(&device_type) {
        return Err(DlnaError::Description(format!(
            "device type {} is not a media {}",
            device_type.trim(),
            kind.label().to_ascii_lowercase()
        )));
    }
    DEVICE
        .text(root, "UDN")
        .map(|udn| udn.trim().to_string())
        .ok_or_else(|| DlnaError::Description("missing UDN".to_string()))
}

/// Build the complete record of an identified device.
///
/// `fetch` retrieves a service description; a service whose description
/// cannot be fetched or parsed, or whose URLs point to another host, is left
/// out. A declared `URLBase` on another host rejects the whole device.
pub(crate) fn describe<F>(
    root: &Element,
    kind: DeviceKind,
    desc_url: &str,
    udn: String,
    status: DeviceStatus,
    mut fetch: F,
) -> Result<Device>
where
    F: FnMut(&str) -> Option<Vec<u8>>,
{
    let ip = host_of(desc_url)
        .ok_or_else(|| DlnaError::Description(format!("invalid description URL {}", desc_url)))?;

    let base_url = match DEVICE.text(root, "URLBase") {
        Some(declared) => {
            let declared = declared.trim().to_string();
            if host_of(&declared).as_deref() != Some(ip.as_str()) {
                return Err(DlnaError::Description(format!(
                    "URLBase {} is not on host {}",
                    declared, ip
                )));
            }
            declared
        }
        None => desc_url.to_string(),
    };

    let mut services = Vec::new();
    for node in DEVICE.elements(root, "service") {
        match describe_service(node, &base_url, &ip, &mut fetch) {
            Some(service) => services.push(Arc::new(service)),
            None => tracing::trace!(%desc_url, "service skipped"),
        }
    }

    Ok(Device {
        kind,
        udn,
        desc_url: desc_url.to_string(),
        base_url: Some(base_url.clone()),
        icon_url: icon_url(root, &base_url, &ip),
        friendly_name: DEVICE.text(root, "friendlyName").unwrap_or_default(),
        manufacturer: DEVICE.text(root, "manufacturer"),
        model_name: DEVICE.text(root, "modelName"),
        model_description: DEVICE.text(root, "modelDescription"),
        model_number: DEVICE.text(root, "modelNumber"),
        serial_number: DEVICE.text(root, "serialNumber"),
        ip,
        services,
        status,
    })
}

/// First PNG icon in document order, else the last icon; dropped when it
/// lives on another host.
fn icon_url(root: &Element, base_url: &str, ip: &str) -> Option<String> {
    let icons = DEVICE.elements(root, "icon");
    let chosen = icons
        .iter()
        .find(|icon| {
            DEVICE
                .text(icon, "mimetype")
                .is_some_and(|mime| mime.to_ascii_lowercase().contains("png"))
        })
        .or_else(|| icons.last())?;
    let url = join(base_url, &DEVICE.text(chosen, "url")?)?;
    if host_of(&url).as_deref() == Some(ip) {
        Some(url)
    } else {
        tracing::trace!(%url, "icon on foreign host dropped");
        None
    }
}

fn describe_service<F>(node: &Element, base_url: &str, ip: &str, fetch: &mut F) -> Option<Service>
where
    F: FnMut(&str) -> Option<Vec<u8>>,
{
    let local_url = |tag: &str| {
        let url = join(base_url, &DEVICE.text(node, tag)?)?;
        (host_of(&url).as_deref() == Some(ip)).then_some(url)
    };
    let service_type = DEVICE.text(node, "serviceType")?.trim().to_string();
    let id = DEVICE.text(node, "serviceId")?.trim().to_string();
    let control_url = local_url("controlURL")?;
    let event_sub_url = local_url("eventSubURL")?;
    let desc_url = local_url("SCPDURL")?;

    let body = fetch(&desc_url)?;
    match parse_service_description(&body) {
        Ok((actions, event_through_last_change)) => Some(Service {
            service_type,
            id,
            control_url,
            event_sub_url,
            desc_url,
            actions,
            event_through_last_change,
        }),
        Err(e) => {
            tracing::debug!(service = %id, error = %e, "service description rejected");
            None
        }
    }
}

/// Parse a service description into its actions and whether the service
/// events through `LastChange`.
///
/// Any malformed action or argument rejects the whole description.
pub(crate) fn parse_service_description(body: &[u8]) -> Result<(Vec<Action>, bool)> {
    let root = parse_document(body)?;
    let state_variables = SERVICE.elements(&root, "stateVariable");
    let state_variable = |name: &str| {
        state_variables.iter().copied().find(|variable| {
            SERVICE
                .first(variable, "name")
                .is_some_and(|n| xml::text(n).trim() == name)
        })
    };

    let mut actions = Vec::new();
    for node in SERVICE.elements(&root, "action") {
        let name = SERVICE
            .text(node, "name")
            .map(|name| name.trim().to_string())
            .ok_or_else(|| malformed("action without name"))?;
        let mut arguments = Vec::new();
        for argument in SERVICE.elements(node, "argument") {
            arguments.push(parse_argument(argument, &state_variable).ok_or_else(|| {
                malformed(&format!("invalid argument in action {}", name))
            })?);
        }
        actions.push(Action { name, arguments });
    }

    let event_through_last_change = state_variables.iter().any(|variable| {
        SERVICE
            .first(variable, "name")
            .is_some_and(|n| xml::text(n).trim().eq_ignore_ascii_case("LastChange"))
            && variable.attributes.get("sendEvents").map(String::as_str) == Some("yes")
    });

    Ok((actions, event_through_last_change))
}

fn parse_argument<'a>(
    node: &Element,
    state_variable: &dyn Fn(&str) -> Option<&'a Element>,
) -> Option<Argument> {
    let name = SERVICE.text(node, "name")?.trim().to_string();
    let direction = Direction::parse(&SERVICE.text(node, "direction")?)?;
    let related = SERVICE.text(node, "relatedStateVariable")?;
    let variable = state_variable(related.trim())?;

    let event = match variable.attributes.get("sendEvents").map(String::as_str) {
        Some("yes") => Some(true),
        Some("no") => Some(false),
        _ => None,
    };
    let data_type = SERVICE.text(variable, "dataType")?.trim().to_string();
    let allowed_values = SERVICE.first(variable, "allowedValueList").map(|list| {
        SERVICE
            .elements(list, "allowedValue")
            .into_iter()
            .map(xml::text)
            .collect()
    });
    let allowed_range = SERVICE.first(variable, "allowedValueRange").and_then(|range| {
        Some((SERVICE.text(range, "minimum")?, SERVICE.text(range, "maximum")?))
    });

    Some(Argument {
        name,
        direction,
        event,
        data_type,
        allowed_values,
        allowed_range,
        default_value: SERVICE.text(variable, "defaultValue"),
    })
}

fn malformed(reason: &str) -> DlnaError {
    DlnaError::Description(reason.to_string())
}
