//! Collaboration API type definitions
//!
//! Request payloads sent to the collaboration framework. Responses are kept
//! as opaque JSON and handed back to clients unchanged.

use serde::{Deserialize, Serialize};

/// Addressable collection in the collaboration API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Projects,
    /// Findings belong to a single project
    Findings { project_id: String },
    Templates,
    Users,
}

impl Resource {
    /// Collection path relative to the API base URL
    pub fn path(&self) -> String {
        match self {
            Resource::Projects => "projects".to_string(),
            Resource::Findings { project_id } => {
                format!("projects/{}/findings", urlencoding::encode(project_id))
            }
            Resource::Templates => "templates".to_string(),
            Resource::Users => "users".to_string(),
        }
    }

    /// Path of a single item in the collection
    pub fn item_path(&self, id: &str) -> String {
        format!("{}/{}", self.path(), urlencoding::encode(id))
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Resource::Projects => "projects",
            Resource::Findings { .. } => "findings",
            Resource::Templates => "templates",
            Resource::Users => "users",
        }
    }
}

/// Filtering and paging for list calls
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ListQuery {
    /// Free-text search
    #[serde(default)]
    pub search: Option<String>,

    /// Page size
    #[serde(default)]
    pub limit: Option<u32>,

    /// Items to skip
    #[serde(default)]
    pub offset: Option<u32>,
}

impl ListQuery {
    /// Query string pairs, omitting unset values
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(search) = &self.search {
            pairs.push(("search", search.clone()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit", limit.to_string()));
        }
        if let Some(offset) = self.offset {
            pairs.push(("offset", offset.to_string()));
        }
        pairs
    }
}

/// Finding severity as understood by the collaboration API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const NAMES: [&'static str; 5] = ["info", "low", "medium", "high", "critical"];
}

/// Body for creating or updating a project
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Report design / project type identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Users assigned to the engagement
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

/// Body for creating or updating a finding
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindingInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,

    /// CVSS base score
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cvss: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_components: Vec<String>,

    /// Template the finding was instantiated from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
}
