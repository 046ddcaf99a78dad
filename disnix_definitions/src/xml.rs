//! Low-level XML helpers shared by the manifest loader and printer (C1).
//!
//! `quick-xml`'s serde integration does not deal gracefully with
//! `PropertyValue`'s recursive, self-describing shape (a `list` or `attrs`
//! property nests further properties), so property tables are walked by
//! hand with `quick_xml::Reader`/`Writer` instead of derived. Everything
//! else in the manifest (service/mapping/profile leaves) is plain
//! `<tag>text</tag>` children, which this module also provides small
//! helpers for, so the whole loader stays on one parsing strategy rather
//! than mixing derive and manual code.

use std::collections::BTreeMap;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::property::PropertyValue;
use crate::{ErrorKind, Result};

fn decode_attr_value(raw: &[u8]) -> String {
    match quick_xml::escape::unescape(raw) {
        Ok(unescaped) => String::from_utf8_lossy(&unescaped).into_owned(),
        Err(_) => String::from_utf8_lossy(raw).into_owned(),
    }
}

/// Reads a required attribute off a start/empty tag.
pub fn required_attr(e: &BytesStart, name: &str) -> Result<String> {
    for a in e.attributes() {
        let a = a.map_err(|e| ErrorKind::ParseError(format!("bad attribute: {}", e)))?;
        if a.key == name.as_bytes() {
            return Ok(decode_attr_value(&a.value));
        }
    }
    Err(ErrorKind::ParseError(format!(
        "missing required attribute '{}' on <{}>",
        name,
        String::from_utf8_lossy(e.name())
    ))
    .into())
}

/// Reads an optional attribute off a start/empty tag.
pub fn optional_attr(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key == name.as_bytes())
        .map(|a| decode_attr_value(&a.value))
}

/// Reads the text content of the element whose start tag was just consumed,
/// stopping at the first matching `End`. Nested elements are not expected;
/// callers that need them (properties, mappings) drive the reader themselves.
pub fn read_leaf_text(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<String> {
    let mut text = String::new();
    loop {
        buf.clear();
        match reader
            .read_event(buf)
            .map_err(|e| ErrorKind::ParseError(format!("xml read error: {}", e)))?
        {
            Event::Text(t) | Event::CData(t) => {
                text.push_str(&t.unescape_and_decode(reader).unwrap_or_default());
            }
            Event::End(_) => return Ok(text.trim().to_string()),
            Event::Eof => {
                return Err(ErrorKind::ParseError("unexpected end of document inside leaf".into()).into())
            }
            _ => {}
        }
    }
}

/// Skips over an element (and everything nested in it) whose start tag has
/// just been consumed. Used to ignore sub-trees not selected by `LoadFlags`.
pub fn skip_element(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<()> {
    let mut depth = 0u32;
    loop {
        buf.clear();
        match reader
            .read_event(buf)
            .map_err(|e| ErrorKind::ParseError(format!("xml read error: {}", e)))?
        {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                if depth == 0 {
                    return Ok(());
                }
                depth -= 1;
            }
            Event::Eof => {
                return Err(ErrorKind::ParseError("unexpected end of document while skipping".into()).into())
            }
            _ => {}
        }
    }
}

/// Parses a single `<property name="..." type="...">...</property>` whose
/// start tag has just been consumed. `list` properties nest `<item>` children
/// (each itself optionally typed, default `string`); `attrs` properties nest
/// further `<property>` children.
pub fn read_property_value(
    reader: &mut Reader<&[u8]>,
    buf: &mut Vec<u8>,
    type_attr: Option<&str>,
) -> Result<PropertyValue> {
    match type_attr.unwrap_or("string") {
        "list" => {
            let mut items = Vec::new();
            loop {
                buf.clear();
                match reader
                    .read_event(buf)
                    .map_err(|e| ErrorKind::ParseError(format!("xml read error: {}", e)))?
                {
                    Event::Start(ref e) if e.name() == b"item" => {
                        let ty = optional_attr(e, "type");
                        items.push(read_property_value(reader, buf, ty.as_deref())?);
                    }
                    Event::Empty(ref e) if e.name() == b"item" => {
                        items.push(PropertyValue::String(String::new()));
                    }
                    Event::End(_) => return Ok(PropertyValue::List(items)),
                    Event::Eof => {
                        return Err(ErrorKind::ParseError("unexpected eof inside list property".into()).into())
                    }
                    _ => {}
                }
            }
        }
        "attrs" => {
            let mut map = BTreeMap::new();
            loop {
                buf.clear();
                match reader
                    .read_event(buf)
                    .map_err(|e| ErrorKind::ParseError(format!("xml read error: {}", e)))?
                {
                    Event::Start(ref e) if e.name() == b"property" => {
                        let name = required_attr(e, "name")?;
                        let ty = optional_attr(e, "type");
                        map.insert(name, read_property_value(reader, buf, ty.as_deref())?);
                    }
                    Event::Empty(ref e) if e.name() == b"property" => {
                        let name = required_attr(e, "name")?;
                        map.insert(name, PropertyValue::String(String::new()));
                    }
                    Event::End(_) => return Ok(PropertyValue::Attrs(map)),
                    Event::Eof => {
                        return Err(ErrorKind::ParseError("unexpected eof inside attrs property".into()).into())
                    }
                    _ => {}
                }
            }
        }
        "int" => {
            let text = read_leaf_text(reader, buf)?;
            let v: i64 = text
                .parse()
                .map_err(|_| ErrorKind::ParseError(format!("'{}' is not a valid int", text)))?;
            Ok(PropertyValue::Int(v))
        }
        "float" => {
            let text = read_leaf_text(reader, buf)?;
            let v: f64 = text
                .parse()
                .map_err(|_| ErrorKind::ParseError(format!("'{}' is not a valid float", text)))?;
            Ok(PropertyValue::Float(v))
        }
        "bool" => {
            let text = read_leaf_text(reader, buf)?;
            let v: bool = text
                .parse()
                .map_err(|_| ErrorKind::ParseError(format!("'{}' is not a valid bool", text)))?;
            Ok(PropertyValue::Bool(v))
        }
        _ => Ok(PropertyValue::String(read_leaf_text(reader, buf)?)),
    }
}

/// Reads a `<properties>`-like wrapper of `<property name=.. type=..>` children
/// into a map, given the wrapper's start tag has just been consumed.
pub fn read_property_map(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<BTreeMap<String, PropertyValue>> {
    let mut map = BTreeMap::new();
    loop {
        buf.clear();
        match reader
            .read_event(buf)
            .map_err(|e| ErrorKind::ParseError(format!("xml read error: {}", e)))?
        {
            Event::Start(ref e) if e.name() == b"property" => {
                let name = required_attr(e, "name")?;
                let ty = optional_attr(e, "type");
                map.insert(name, read_property_value(reader, buf, ty.as_deref())?);
            }
            Event::Empty(ref e) if e.name() == b"property" => {
                let name = required_attr(e, "name")?;
                map.insert(name, PropertyValue::String(String::new()));
            }
            Event::End(_) => return Ok(map),
            Event::Eof => return Err(ErrorKind::ParseError("unexpected eof inside property map".into()).into()),
            _ => {}
        }
    }
}

/// Writes `<name>text</name>`.
pub fn write_leaf(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::borrowed_name(name.as_bytes())))
        .map_err(xml_write_err)?;
    writer
        .write_event(Event::Text(BytesText::from_plain_str(text)))
        .map_err(xml_write_err)?;
    writer
        .write_event(Event::End(BytesEnd::borrowed(name.as_bytes())))
        .map_err(xml_write_err)?;
    Ok(())
}

/// Writes a single `<property name=".." [type=".."]>..</property>`, recursing
/// into `list`/`attrs` values as nested `<item>`/`<property>` children.
pub fn write_property(writer: &mut Writer<Vec<u8>>, name: &str, value: &PropertyValue) -> Result<()> {
    let ty = value.type_name();
    let mut start = BytesStart::owned_name("property");
    start.push_attribute(("name", name));
    if ty != "string" {
        start.push_attribute(("type", ty));
    }
    match value {
        PropertyValue::List(items) => {
            writer.write_event(Event::Start(start)).map_err(xml_write_err)?;
            for item in items {
                write_property_item(writer, item)?;
            }
            writer
                .write_event(Event::End(BytesEnd::borrowed(b"property")))
                .map_err(xml_write_err)?;
        }
        PropertyValue::Attrs(map) => {
            writer.write_event(Event::Start(start)).map_err(xml_write_err)?;
            for (k, v) in map {
                write_property(writer, k, v)?;
            }
            writer
                .write_event(Event::End(BytesEnd::borrowed(b"property")))
                .map_err(xml_write_err)?;
        }
        scalar => {
            writer.write_event(Event::Start(start)).map_err(xml_write_err)?;
            writer
                .write_event(Event::Text(BytesText::from_plain_str(&scalar.as_env_value())))
                .map_err(xml_write_err)?;
            writer
                .write_event(Event::End(BytesEnd::borrowed(b"property")))
                .map_err(xml_write_err)?;
        }
    }
    Ok(())
}

fn write_property_item(writer: &mut Writer<Vec<u8>>, value: &PropertyValue) -> Result<()> {
    let ty = value.type_name();
    let mut start = BytesStart::owned_name("item");
    if ty != "string" {
        start.push_attribute(("type", ty));
    }
    match value {
        PropertyValue::List(items) => {
            writer.write_event(Event::Start(start)).map_err(xml_write_err)?;
            for item in items {
                write_property_item(writer, item)?;
            }
            writer
                .write_event(Event::End(BytesEnd::borrowed(b"item")))
                .map_err(xml_write_err)?;
        }
        PropertyValue::Attrs(map) => {
            writer.write_event(Event::Start(start)).map_err(xml_write_err)?;
            for (k, v) in map {
                write_property(writer, k, v)?;
            }
            writer
                .write_event(Event::End(BytesEnd::borrowed(b"item")))
                .map_err(xml_write_err)?;
        }
        scalar => {
            writer.write_event(Event::Start(start)).map_err(xml_write_err)?;
            writer
                .write_event(Event::Text(BytesText::from_plain_str(&scalar.as_env_value())))
                .map_err(xml_write_err)?;
            writer
                .write_event(Event::End(BytesEnd::borrowed(b"item")))
                .map_err(xml_write_err)?;
        }
    }
    Ok(())
}

pub fn write_property_map(
    writer: &mut Writer<Vec<u8>>,
    wrapper: &str,
    map: &BTreeMap<String, PropertyValue>,
) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::borrowed_name(wrapper.as_bytes())))
        .map_err(xml_write_err)?;
    for (k, v) in map {
        write_property(writer, k, v)?;
    }
    writer
        .write_event(Event::End(BytesEnd::borrowed(wrapper.as_bytes())))
        .map_err(xml_write_err)?;
    Ok(())
}

fn xml_write_err(e: std::io::Error) -> crate::Error {
    ErrorKind::ParseError(format!("xml write error: {}", e)).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalar_properties() {
        let mut map = BTreeMap::new();
        map.insert("hostname".to_string(), PropertyValue::String("t1".into()));
        map.insert("numCores".to_string(), PropertyValue::Int(4));

        let mut writer = Writer::new(Vec::new());
        write_property_map(&mut writer, "properties", &map).unwrap();
        let xml = String::from_utf8(writer.into_inner()).unwrap();

        let mut reader = Reader::from_str(&xml);
        reader.trim_text(true);
        let mut buf = Vec::new();
        // consume the wrapper start tag
        loop {
            match reader.read_event(&mut buf).unwrap() {
                Event::Start(ref e) if e.name() == b"properties" => break,
                Event::Eof => panic!("wrapper not found"),
                _ => {}
            }
            buf.clear();
        }
        let parsed = read_property_map(&mut reader, &mut buf).unwrap();
        assert_eq!(parsed, map);
    }
}
