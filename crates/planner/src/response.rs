use std::collections::HashMap;

use indexmap::IndexMap;
use parser::Pos;
use serde::{Deserialize, Serialize};
use value::ConstValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    pub message: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<ConstValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Pos>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub extensions: IndexMap<String, ConstValue>,
}

impl ServerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: Default::default(),
            locations: Default::default(),
            extensions: Default::default(),
        }
    }

    pub fn extension(mut self, name: impl Into<String>, value: impl Into<ConstValue>) -> Self {
        self.extensions.insert(name.into(), value.into());
        self
    }

    /// The `extensions.code` of this error, if it is a string.
    pub fn code(&self) -> Option<&str> {
        match self.extensions.get("code") {
            Some(ConstValue::String(code)) => Some(code),
            _ => None,
        }
    }
}

/// A GraphQL response as returned to the client or received from a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub data: ConstValue,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ServerError>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub extensions: IndexMap<String, ConstValue>,

    #[serde(skip_serializing, default)]
    pub headers: Option<HashMap<String, Vec<String>>>,
}

impl Response {
    /// A response without data carrying a single error.
    pub fn from_error(error: ServerError) -> Self {
        Self {
            data: ConstValue::Null,
            errors: vec![error],
            extensions: Default::default(),
            headers: None,
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}
