//! Tool declarations offered to the model, serialized as JSON schema.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: ObjectSchema,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: ObjectSchema::default(),
        }
    }

    /// Add a mandatory argument.
    pub fn required(mut self, name: impl Into<String>, schema: Schema) -> Self {
        let name = name.into();
        self.parameters.required.push(name.clone());
        self.parameters.properties.insert(name, schema);
        self
    }
}

/// The closed object schema every tool takes as its argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSchema {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Schema>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(rename = "additionalProperties", default)]
    pub additional_properties: bool,
}

impl Default for ObjectSchema {
    fn default() -> Self {
        Self {
            kind: "object".into(),
            properties: BTreeMap::new(),
            required: Vec::new(),
            additional_properties: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schema {
    String {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Array {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        items: Box<Schema>,
    },
}

impl Schema {
    pub fn string(description: impl Into<String>) -> Self {
        Schema::String {
            description: Some(description.into()),
        }
    }

    pub fn string_array(description: impl Into<String>) -> Self {
        Schema::Array {
            description: Some(description.into()),
            items: Box::new(Schema::String { description: None }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_definition_serializes_as_closed_object() {
        let def = ToolDefinition::new("DeleteResources", "Delete the URLs from the resources.")
            .required("urls", Schema::string_array("URLs"));

        assert_eq!(
            serde_json::to_value(&def.parameters).unwrap(),
            json!({
                "type": "object",
                "properties": {
                    "urls": {"type": "array", "description": "URLs", "items": {"type": "string"}}
                },
                "required": ["urls"],
                "additionalProperties": false
            })
        );
    }

    #[test]
    fn test_empty_definition_has_no_arguments() {
        let def = ToolDefinition::new("WriteReport", "Write the research report.");
        assert!(def.parameters.properties.is_empty());
        assert!(def.parameters.required.is_empty());
    }
}
