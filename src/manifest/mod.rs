//! Tool descriptors (manifests): the declarative description of how to
//! install, start and health-check one tool.

pub mod store;
pub mod value;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ToolError, ToolResult};

pub use store::ManifestStore;
pub use value::OpaqueValue;

/// Placeholder in `health_check` replaced by the resolved port.
pub const PORT_PLACEHOLDER: &str = "{port}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub install: InstallSpec,
    pub start: StartSpec,
    /// Presentation-only section, carried through untouched.
    #[serde(default, skip_serializing_if = "OpaqueValue::is_null")]
    pub ui: OpaqueValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSpec {
    pub command: String,
    /// Exits 0 when the tool is already present on this machine.
    #[serde(default)]
    pub check: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSpec {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range: Option<PortRange>,
    pub health_check: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

/// Ids double as file names in the user manifest directory.
pub fn validate_id(id: &str) -> ToolResult<()> {
    if id.trim().is_empty() {
        return Err(ToolError::invalid("id must not be empty"));
    }
    if id.contains('/') || id.contains('\\') || id.contains("..") {
        return Err(ToolError::invalid(format!(
            "id '{}' must not contain path separators or '..'",
            id
        )));
    }
    Ok(())
}

impl ToolDescriptor {
    /// A tool is dynamic-port when it has no fixed port and must be told
    /// which port to bind on its command line.
    pub fn is_dynamic_port(&self) -> bool {
        self.start.port.is_none()
    }

    /// Health-check URL with `{port}` substituted.
    pub fn health_url(&self, port: u16) -> String {
        self.start
            .health_check
            .replace(PORT_PLACEHOLDER, &port.to_string())
    }

    /// Reject descriptors that can't be installed or started.
    pub fn validate(&self) -> ToolResult<()> {
        validate_id(&self.id)?;
        if self.name.trim().is_empty() {
            return Err(ToolError::invalid(format!("'{}': name must not be empty", self.id)));
        }
        if self.install.command.trim().is_empty() {
            return Err(ToolError::invalid(format!(
                "'{}': install command must not be empty",
                self.id
            )));
        }
        if self.start.command.trim().is_empty() {
            return Err(ToolError::invalid(format!(
                "'{}': start command must not be empty",
                self.id
            )));
        }

        match (self.start.port, self.start.port_range) {
            (Some(_), Some(_)) => Err(ToolError::invalid(format!(
                "'{}': specify either port or port_range, not both",
                self.id
            ))),
            (None, None) => Err(ToolError::invalid(format!(
                "'{}': either port or port_range is required",
                self.id
            ))),
            (Some(port), None) => {
                // u16 라서 상한(65536)은 타입이 보장
                if port == 0 {
                    return Err(ToolError::invalid(format!(
                        "'{}': port must be between 1 and 65535",
                        self.id
                    )));
                }
                Ok(())
            }
            (None, Some(range)) => {
                if range.min == 0 {
                    return Err(ToolError::invalid(format!(
                        "'{}': port_range.min must be between 1 and 65535",
                        self.id
                    )));
                }
                if range.max <= range.min {
                    return Err(ToolError::invalid(format!(
                        "'{}': port_range.max ({}) must be greater than port_range.min ({})",
                        self.id, range.max, range.min
                    )));
                }
                Ok(())
            }
        }
    }

    /// Parse a JSON descriptor document and validate it.
    pub fn from_json(content: &str) -> ToolResult<Self> {
        let desc: Self = serde_json::from_str(content)
            .map_err(|e| ToolError::invalid(format!("malformed descriptor: {}", e)))?;
        desc.validate()?;
        Ok(desc)
    }

    /// Parse a TOML descriptor document and validate it.
    pub fn from_toml(content: &str) -> ToolResult<Self> {
        let desc: Self = toml::from_str(content)
            .map_err(|e| ToolError::invalid(format!("malformed descriptor: {}", e)))?;
        desc.validate()?;
        Ok(desc)
    }
}
