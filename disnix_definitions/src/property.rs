//! Typed property values carried by target and container property tables.
//!
//! The XML surface form annotates a `<property>` with an optional `type`
//! attribute drawn from `{string,int,float,bool,list,attrs}` (see SPEC_FULL.md
//! §6). Internally we keep the typed value so `print_nix`/`print_xml` can
//! round-trip it without guessing from the textual representation.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{Deserialize, Deserializer, Error, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, Serializer};

/// A property value: one of the five primitive forms NixXML supports, plus
/// a nested attribute set (`attrs`) for container property tables that
/// themselves carry structured data.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<PropertyValue>),
    Attrs(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    /// Renders the value the way it would appear on the right of `KEY=`
    /// when building container environment variables (§4.3).
    pub fn as_env_value(&self) -> String {
        match self {
            PropertyValue::String(s) => s.clone(),
            PropertyValue::Int(i) => i.to_string(),
            PropertyValue::Float(f) => f.to_string(),
            PropertyValue::Bool(b) => b.to_string(),
            PropertyValue::List(xs) => xs
                .iter()
                .map(PropertyValue::as_env_value)
                .collect::<Vec<_>>()
                .join(","),
            PropertyValue::Attrs(_) => {
                warn!("attrs-typed property flattened to empty string in container env");
                String::new()
            }
        }
    }

    /// Renders the value as it would be emitted inside a Nix expression.
    pub fn to_nix(&self) -> String {
        match self {
            PropertyValue::String(s) => format!("\"{}\"", escape_nix_string(s)),
            PropertyValue::Int(i) => i.to_string(),
            PropertyValue::Float(f) => f.to_string(),
            PropertyValue::Bool(b) => b.to_string(),
            PropertyValue::List(xs) => {
                let inner: Vec<String> = xs.iter().map(PropertyValue::to_nix).collect();
                format!("[ {} ]", inner.join(" "))
            }
            PropertyValue::Attrs(map) => {
                let inner: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("{} = {};", k, v.to_nix()))
                    .collect();
                format!("{{ {} }}", inner.join(" "))
            }
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::String(_) => "string",
            PropertyValue::Int(_) => "int",
            PropertyValue::Float(_) => "float",
            PropertyValue::Bool(_) => "bool",
            PropertyValue::List(_) => "list",
            PropertyValue::Attrs(_) => "attrs",
        }
    }
}

fn escape_nix_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_env_value())
    }
}

impl Serialize for PropertyValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            PropertyValue::String(s) => serializer.serialize_str(s),
            PropertyValue::Int(i) => serializer.serialize_i64(*i),
            PropertyValue::Float(f) => serializer.serialize_f64(*f),
            PropertyValue::Bool(b) => serializer.serialize_bool(*b),
            PropertyValue::List(xs) => xs.serialize(serializer),
            PropertyValue::Attrs(map) => map.serialize(serializer),
        }
    }
}

/// Deserializes a property value the relaxed way: accept whatever shape
/// comes back from the wire (string, number, bool, sequence or map) and
/// coerce it into the matching `PropertyValue` variant.
impl<'de> Deserialize<'de> for PropertyValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(PropertyValueVisitor)
    }
}

struct PropertyValueVisitor;

impl<'de> Visitor<'de> for PropertyValueVisitor {
    type Value = PropertyValue;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a string, number, boolean, list or attribute set")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: Error,
    {
        Ok(PropertyValue::String(v.to_string()))
    }

    fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
    where
        E: Error,
    {
        Ok(PropertyValue::String(v))
    }

    fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E>
    where
        E: Error,
    {
        Ok(PropertyValue::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: Error,
    {
        Ok(PropertyValue::Int(v))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: Error,
    {
        Ok(PropertyValue::Int(v as i64))
    }

    fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
    where
        E: Error,
    {
        Ok(PropertyValue::Float(v))
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut out = Vec::new();
        while let Some(v) = seq.next_element()? {
            out.push(v);
        }
        Ok(PropertyValue::List(out))
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut out = BTreeMap::new();
        while let Some((k, v)) = map.next_entry()? {
            out.insert(k, v);
        }
        Ok(PropertyValue::Attrs(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_value_joins_lists_with_commas() {
        let v = PropertyValue::List(vec![
            PropertyValue::String("a".into()),
            PropertyValue::String("b".into()),
        ]);
        assert_eq!(v.as_env_value(), "a,b");
    }

    #[test]
    fn env_value_renders_scalars() {
        assert_eq!(PropertyValue::Int(5).as_env_value(), "5");
        assert_eq!(PropertyValue::Bool(true).as_env_value(), "true");
    }

    #[test]
    fn nix_string_escapes_quotes() {
        let v = PropertyValue::String("a\"b".into());
        assert_eq!(v.to_nix(), "\"a\\\"b\"");
    }

    #[test]
    fn deserialize_from_yaml_scalar_and_seq() {
        let s: PropertyValue = serde_yaml::from_str("'foo'").unwrap();
        assert_eq!(s, PropertyValue::String("foo".into()));
        let n: PropertyValue = serde_yaml::from_str("42").unwrap();
        assert_eq!(n, PropertyValue::Int(42));
        let l: PropertyValue = serde_yaml::from_str("[a, b]").unwrap();
        assert_eq!(
            l,
            PropertyValue::List(vec![
                PropertyValue::String("a".into()),
                PropertyValue::String("b".into())
            ])
        );
    }
}
