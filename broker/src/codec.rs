//! Typed field accessors over wire payloads.
//!
//! XML helpers read either child elements (`<price>1.5</price>`) or
//! attributes. `required_*` fail with `BrokerError::Malformed` naming the
//! element and field; `optional_*` return `None` for an absent field and log a
//! warning when the field is present but unparsable.

use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use roxmltree::Node;
use serde::{Deserialize, Deserializer};
use tracing::warn;

use crate::BrokerError;

/// `dd.MM.yyyy HH:mm:ss` with optional fractional seconds.
pub const NATIVE_DATETIME: &str = "%d.%m.%Y %H:%M:%S%.f";
const NATIVE_DATE: &str = "%d.%m.%Y";

pub fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
}

pub fn elements<'a, 'input>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children()
        .filter(move |c| c.is_element() && c.tag_name().name() == name)
}

/// Text of a child element, falling back to an attribute of the same name.
pub fn field<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    child(node, name)
        .and_then(|c| c.text())
        .or_else(|| node.attribute(name))
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

pub fn required_text<'a>(node: Node<'a, '_>, name: &str) -> Result<&'a str, BrokerError> {
    field(node, name).ok_or_else(|| missing(node, name))
}

pub fn optional_string(node: Node<'_, '_>, name: &str) -> Option<String> {
    field(node, name).map(str::to_string)
}

pub fn required<T: FromStr>(node: Node<'_, '_>, name: &str) -> Result<T, BrokerError> {
    let raw = required_text(node, name)?;
    raw.parse().map_err(|_| {
        BrokerError::Malformed(format!(
            "<{}> field {name} has unparsable value {raw:?}",
            node.tag_name().name()
        ))
    })
}

pub fn optional<T: FromStr>(node: Node<'_, '_>, name: &str) -> Option<T> {
    let raw = field(node, name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(
                element = node.tag_name().name(),
                field = name,
                value = raw,
                "ignoring unparsable optional field"
            );
            None
        }
    }
}

/// Numeric field that defaults to zero when absent or unparsable.
pub fn number_or_zero(node: Node<'_, '_>, name: &str) -> f64 {
    optional(node, name).unwrap_or(0.0)
}

pub fn optional_bool(node: Node<'_, '_>, name: &str) -> Option<bool> {
    match field(node, name)? {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        other => {
            warn!(element = node.tag_name().name(), field = name, value = other, "not a boolean");
            None
        }
    }
}

pub fn parse_native_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, NATIVE_DATETIME)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, NATIVE_DATE)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

pub fn required_datetime(node: Node<'_, '_>, name: &str) -> Result<NaiveDateTime, BrokerError> {
    let raw = required_text(node, name)?;
    parse_native_datetime(raw).ok_or_else(|| {
        BrokerError::Malformed(format!(
            "<{}> field {name} is not a datetime: {raw:?}",
            node.tag_name().name()
        ))
    })
}

pub fn optional_datetime(node: Node<'_, '_>, name: &str) -> Option<NaiveDateTime> {
    let raw = field(node, name)?;
    let parsed = parse_native_datetime(raw);
    if parsed.is_none() && raw != "0" {
        warn!(element = node.tag_name().name(), field = name, value = raw, "not a datetime");
    }
    parsed
}

fn missing(node: Node<'_, '_>, name: &str) -> BrokerError {
    BrokerError::Malformed(format!("<{}> without {name}", node.tag_name().name()))
}

/// Escapes text for inclusion in an XML element or attribute.
pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(f64),
    Text(String),
}

/// Accepts both `"1.25"` and `1.25`; REST payloads quote most decimals.
pub fn de_number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(value) => Ok(value),
        NumberOrText::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("not a number: {text:?}"))),
    }
}

pub fn de_opt_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<NumberOrText>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrText::Number(value)) => Ok(Some(value)),
        Some(NumberOrText::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(NumberOrText::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("not a number: {text:?}"))),
    }
}
