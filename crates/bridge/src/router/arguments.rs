//! Call arguments of a routed method.
//!
//! The json body is merged with the query and path parameters into one object. Parameters keep their
//! raw text; they are read as numbers or booleans only when the target field asks for one, so a `String`
//! field bound from `/users/{name}` receives `"42"` unchanged.

use crate::router::error::InvokeError;
use micro_tunnel::protocol::API_VERSION_HEADER;
use serde::de::value::{MapDeserializer, StringDeserializer};
use serde::de::{DeserializeOwned, IntoDeserializer, Visitor};
use serde::Deserializer;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A json body plus the textual parameters that override its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Arguments {
    body: Value,
    params: Vec<(String, String)>,
}

impl From<Value> for Arguments {
    fn from(body: Value) -> Self {
        Self { body, params: vec![] }
    }
}

impl Arguments {
    /// Merges `body`, then the `query` pairs, then the path `params`; later sources win.
    ///
    /// An empty body is an empty object, and parameters need the body to be an object.
    pub fn bind(body: &[u8], params: &[(String, String)], query: Option<&str>) -> Result<Self, InvokeError> {
        let body = if body.is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_slice::<Value>(body).map_err(InvokeError::bad_request)?
        };

        let query_pairs = match query {
            Some(query) => serde_urlencoded::from_str::<Vec<(String, String)>>(query).map_err(InvokeError::bad_request)?,
            None => vec![],
        };

        let params = query_pairs
            .into_iter()
            .filter(|(name, _)| name != API_VERSION_HEADER)
            .chain(params.iter().cloned())
            .collect::<Vec<_>>();
        if !params.is_empty() && !body.is_object() {
            return Err(InvokeError::bad_request("path and query parameters need an object body"));
        }
        Ok(Self { body, params })
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn deserialize<T: DeserializeOwned>(self) -> Result<T, serde_json::Error> {
        let Value::Object(body) = self.body else {
            return serde_json::from_value(self.body);
        };
        if self.params.is_empty() {
            return serde_json::from_value(Value::Object(body));
        }

        let mut fields = body.into_iter().map(|(name, value)| (name, Field::Json(value))).collect::<BTreeMap<_, _>>();
        for (name, raw) in self.params {
            fields.insert(name, Field::Param(raw));
        }
        T::deserialize(MapDeserializer::<_, serde_json::Error>::new(fields.into_iter()))
    }
}

enum Field {
    Json(Value),
    Param(String),
}

impl<'de> IntoDeserializer<'de, serde_json::Error> for Field {
    type Deserializer = Self;

    fn into_deserializer(self) -> Self {
        self
    }
}

macro_rules! parsed {
    ($($method:ident => $visit:ident),* $(,)?) => {$(
        fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
            match self {
                Field::Json(value) => value.$method(visitor),
                Field::Param(raw) => match raw.parse() {
                    Ok(parsed) => visitor.$visit(parsed),
                    Err(_) => visitor.visit_string(raw),
                },
            }
        }
    )*};
}

macro_rules! textual {
    ($($method:ident),* $(,)?) => {$(
        fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
            match self {
                Field::Json(value) => value.$method(visitor),
                Field::Param(raw) => visitor.visit_string(raw),
            }
        }
    )*};
}

impl<'de> Deserializer<'de> for Field {
    type Error = serde_json::Error;

    parsed! {
        deserialize_bool => visit_bool,
        deserialize_i8 => visit_i8,
        deserialize_i16 => visit_i16,
        deserialize_i32 => visit_i32,
        deserialize_i64 => visit_i64,
        deserialize_u8 => visit_u8,
        deserialize_u16 => visit_u16,
        deserialize_u32 => visit_u32,
        deserialize_u64 => visit_u64,
        deserialize_f32 => visit_f32,
        deserialize_f64 => visit_f64,
        deserialize_char => visit_char,
    }

    textual! {
        deserialize_any,
        deserialize_str,
        deserialize_string,
        deserialize_bytes,
        deserialize_byte_buf,
        deserialize_unit,
        deserialize_seq,
        deserialize_map,
        deserialize_identifier,
        deserialize_ignored_any,
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self {
            Field::Json(value) => value.deserialize_option(visitor),
            Field::Param(_) => visitor.visit_some(self),
        }
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(self, name: &'static str, visitor: V) -> Result<V::Value, Self::Error> {
        match self {
            Field::Json(value) => value.deserialize_newtype_struct(name, visitor),
            Field::Param(_) => visitor.visit_newtype_struct(self),
        }
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(self, name: &'static str, visitor: V) -> Result<V::Value, Self::Error> {
        match self {
            Field::Json(value) => value.deserialize_unit_struct(name, visitor),
            Field::Param(raw) => visitor.visit_string(raw),
        }
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, len: usize, visitor: V) -> Result<V::Value, Self::Error> {
        match self {
            Field::Json(value) => value.deserialize_tuple(len, visitor),
            Field::Param(raw) => visitor.visit_string(raw),
        }
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        match self {
            Field::Json(value) => value.deserialize_tuple_struct(name, len, visitor),
            Field::Param(raw) => visitor.visit_string(raw),
        }
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        match self {
            Field::Json(value) => value.deserialize_struct(name, fields, visitor),
            Field::Param(raw) => visitor.visit_string(raw),
        }
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        match self {
            Field::Json(value) => value.deserialize_enum(name, variants, visitor),
            Field::Param(raw) => {
                let variant: StringDeserializer<serde_json::Error> = raw.into_deserializer();
                visitor.visit_enum(variant)
            }
        }
    }
}
