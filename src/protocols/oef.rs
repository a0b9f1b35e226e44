//! `fetchai/oef`: service registration and search.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::protocol::{
    CustomKind, CustomType, Encoding, FieldKind, FieldSpec, Performative, PerformativeSpec, ProtocolSchema,
};

pub static SCHEMA: ProtocolSchema = ProtocolSchema {
    author: "fetchai",
    name: "oef",
    version: "0.1.0",
    encoding: Encoding::Structured,
    performatives: &[
        PerformativeSpec {
            name: "oef_error",
            fields: &[FieldSpec::required(
                "operation",
                FieldKind::Custom(CustomKind::of::<OefErrorOperation>()),
            )],
        },
        PerformativeSpec {
            name: "register_service",
            fields: &[
                FieldSpec::required(
                    "service_description",
                    FieldKind::Custom(CustomKind::of::<Description>()),
                ),
                FieldSpec::required("service_id", FieldKind::Str),
            ],
        },
        PerformativeSpec {
            name: "search_result",
            fields: &[FieldSpec::required("agents", FieldKind::StrTuple)],
        },
        PerformativeSpec {
            name: "search_services",
            fields: &[FieldSpec::required("query", FieldKind::Custom(CustomKind::of::<Query>()))],
        },
        PerformativeSpec {
            name: "unregister_service",
            fields: &[FieldSpec::required(
                "service_description",
                FieldKind::Custom(CustomKind::of::<Description>()),
            )],
        },
    ],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OefPerformative {
    OefError,
    RegisterService,
    SearchResult,
    SearchServices,
    UnregisterService,
}

impl Performative for OefPerformative {
    fn schema() -> &'static ProtocolSchema {
        &SCHEMA
    }

    fn as_str(self) -> &'static str {
        match self {
            OefPerformative::OefError => "oef_error",
            OefPerformative::RegisterService => "register_service",
            OefPerformative::SearchResult => "search_result",
            OefPerformative::SearchServices => "search_services",
            OefPerformative::UnregisterService => "unregister_service",
        }
    }
}

/// Service description: a data model name and attribute values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Description {
    pub data_model: String,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

impl Description {
    pub fn new(data_model: impl Into<String>) -> Self {
        Self {
            data_model: data_model.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl CustomType for Description {
    const TYPE_NAME: &'static str = "Description";
}

/// Single attribute constraint of a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub attribute: String,
    pub relation: String,
    pub value: String,
}

/// Search query over service descriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    pub data_model: Option<String>,
}

impl CustomType for Query {
    const TYPE_NAME: &'static str = "Query";
}

/// Operation an `oef_error` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OefErrorOperation {
    RegisterService,
    UnregisterService,
    SearchServices,
    SendMessage,
    Other,
}

impl CustomType for OefErrorOperation {
    const TYPE_NAME: &'static str = "OefErrorOperation";
}
