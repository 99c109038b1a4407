use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Resource families a capability can be scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Filesystem,
    Network,
    Process,
    McpTool,
    Database,
    CliOperations,
}

impl ResourceType {
    pub const ALL: [ResourceType; 6] = [
        Self::Filesystem,
        Self::Network,
        Self::Process,
        Self::McpTool,
        Self::Database,
        Self::CliOperations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Network => "network",
            Self::Process => "process",
            Self::McpTool => "mcp_tool",
            Self::Database => "database",
            Self::CliOperations => "cli_operations",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Invalid(format!("unknown resource type: {s}")))
    }
}

/// An operation name such as `read`, `write` or `execute`.
///
/// Operations are free-form so each resource family can define its own verbs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Operation(String);

impl Operation {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn read() -> Self {
        Self::new("read")
    }

    pub fn write() -> Self {
        Self::new("write")
    }

    pub fn execute() -> Self {
        Self::new("execute")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Operation {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Operation {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_type_round_trips_through_str() {
        for ty in ResourceType::ALL {
            assert_eq!(ty.as_str().parse::<ResourceType>().unwrap(), ty);
        }
        assert!("printer".parse::<ResourceType>().is_err());
    }

    #[test]
    fn resource_type_serializes_snake_case() {
        let json = serde_json::to_string(&ResourceType::McpTool).unwrap();
        assert_eq!(json, "\"mcp_tool\"");
    }
}
