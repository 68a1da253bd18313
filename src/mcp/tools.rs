//! MCP Tool definitions and handlers
//!
//! The pentest collaboration tool catalogue: projects, findings, templates,
//! users and upstream status. Handlers receive arguments that already passed
//! schema validation and translate them into [`CollabApi`] calls.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::collab::types::{FindingInput, ProjectInput, Severity};
use crate::collab::{CollabApi, ListQuery, Resource};
use crate::error::{FieldError, RegistryError, ToolError};
use crate::mcp::registry::{handler_fn, ToolContext, ToolDefinition, ToolHandler, ToolRegistry};

/// Largest page a list tool may request
const MAX_PAGE_SIZE: u32 = 500;

/// Register every collaboration tool
pub fn register_all(registry: &mut ToolRegistry, api: Arc<dyn CollabApi>) -> Result<(), RegistryError> {
    let tools = [
        // Projects
        ToolDefinition::from_json_schema(
            "list_projects",
            "Lists pentest projects, optionally filtered by a search term",
            list_schema(&[]),
            bind(&api, list_projects),
        )?,
        ToolDefinition::from_json_schema(
            "get_project",
            "Retrieves a single pentest project",
            id_schema(&["project_id"]),
            bind(&api, get_project),
        )?,
        ToolDefinition::from_json_schema(
            "create_project",
            "Creates a new pentest project",
            project_schema(false),
            bind(&api, create_project),
        )?,
        ToolDefinition::from_json_schema(
            "update_project",
            "Updates fields of an existing pentest project",
            project_schema(true),
            bind(&api, update_project),
        )?,
        ToolDefinition::from_json_schema(
            "delete_project",
            "Permanently deletes a pentest project and its findings",
            id_schema(&["project_id"]),
            bind(&api, delete_project),
        )?,
        // Findings
        ToolDefinition::from_json_schema(
            "list_findings",
            "Lists the findings of a project",
            list_schema(&["project_id"]),
            bind(&api, list_findings),
        )?,
        ToolDefinition::from_json_schema(
            "get_finding",
            "Retrieves a single finding of a project",
            id_schema(&["project_id", "finding_id"]),
            bind(&api, get_finding),
        )?,
        ToolDefinition::from_json_schema(
            "create_finding",
            "Adds a finding to a project",
            finding_schema(false),
            bind(&api, create_finding),
        )?,
        ToolDefinition::from_json_schema(
            "update_finding",
            "Updates fields of an existing finding",
            finding_schema(true),
            bind(&api, update_finding),
        )?,
        ToolDefinition::from_json_schema(
            "delete_finding",
            "Deletes a finding from a project",
            id_schema(&["project_id", "finding_id"]),
            bind(&api, delete_finding),
        )?,
        // Templates and users
        ToolDefinition::from_json_schema(
            "list_templates",
            "Lists finding templates",
            list_schema(&[]),
            bind(&api, list_templates),
        )?,
        ToolDefinition::from_json_schema(
            "get_template",
            "Retrieves a single finding template",
            id_schema(&["template_id"]),
            bind(&api, get_template),
        )?,
        ToolDefinition::from_json_schema(
            "list_users",
            "Lists users of the collaboration platform",
            list_schema(&[]),
            bind(&api, list_users),
        )?,
        ToolDefinition::from_json_schema(
            "upstream_status",
            "Reports whether the collaboration platform is reachable",
            json!({"type": "object", "properties": {}, "additionalProperties": false}),
            bind(&api, upstream_status),
        )?,
    ];

    for tool in tools {
        registry.register(tool)?;
    }
    tracing::info!(tools = registry.len(), "Registered collaboration tools");
    Ok(())
}

/// Wrap a handler taking the API client into a [`ToolHandler`]
///
/// Cancelled calls never reach the upstream, and the upstream exchange is
/// bounded by whatever is left of the call deadline.
fn bind<F, Fut>(api: &Arc<dyn CollabApi>, f: F) -> impl ToolHandler
where
    F: Fn(Arc<dyn CollabApi>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    let api = api.clone();
    handler_fn(move |args, ctx: ToolContext| {
        let upstream = f(api.clone(), args);
        async move {
            if ctx.is_cancelled() {
                return Err(ToolError::cancelled("Tool call was cancelled before reaching the upstream"));
            }
            let budget = ctx.remaining();
            tokio::time::timeout(budget, upstream)
                .await
                .unwrap_or_else(|_| Err(ToolError::timeout(budget.as_millis())))
        }
    })
}

fn parse<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args)
        .map_err(|e| ToolError::validation(vec![FieldError::new("arguments", e.to_string())]))
}

// ==================== Schemas ====================

fn id_property(name: &str) -> Value {
    json!({"type": "string", "minLength": 1, "description": format!("Identifier ({})", name)})
}

/// Object schema requiring the given id fields and nothing else
fn id_schema(ids: &[&str]) -> Value {
    let properties: serde_json::Map<String, Value> = ids
        .iter()
        .map(|id| (id.to_string(), id_property(id)))
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": ids,
        "additionalProperties": false
    })
}

/// Paging schema plus required scope ids
fn list_schema(ids: &[&str]) -> Value {
    let mut schema = id_schema(ids);
    if let Some(props) = schema["properties"].as_object_mut() {
        props.insert(
            "search".into(),
            json!({"type": "string", "description": "Free-text filter"}),
        );
        props.insert(
            "limit".into(),
            json!({"type": "integer", "minimum": 1, "maximum": MAX_PAGE_SIZE, "description": "Page size"}),
        );
        props.insert(
            "offset".into(),
            json!({"type": "integer", "minimum": 0, "description": "Items to skip"}),
        );
    }
    schema
}

fn project_schema(update: bool) -> Value {
    let mut schema = json!({
        "type": "object",
        "properties": {
            "name": {"type": "string", "minLength": 1, "maxLength": 255, "description": "Project name"},
            "project_type": {"type": "string", "description": "Report design to use"},
            "language": {"type": "string", "minLength": 2, "maxLength": 10, "description": "Report language code"},
            "tags": {"type": "array", "items": {"type": "string"}, "description": "Project tags"},
            "members": {"type": "array", "items": {"type": "string"}, "description": "User ids assigned to the project"}
        },
        "required": ["name"],
        "additionalProperties": false
    });
    if update {
        schema["properties"]["project_id"] = id_property("project_id");
        schema["required"] = json!(["project_id"]);
    }
    schema
}

fn finding_schema(update: bool) -> Value {
    let mut schema = json!({
        "type": "object",
        "properties": {
            "project_id": id_property("project_id"),
            "title": {"type": "string", "minLength": 1, "maxLength": 500, "description": "Finding title"},
            "severity": {"type": "string", "enum": Severity::NAMES, "description": "Finding severity"},
            "cvss": {"type": "number", "minimum": 0, "maximum": 10, "description": "CVSS base score"},
            "description": {"type": "string", "description": "Technical description"},
            "recommendation": {"type": "string", "description": "Remediation advice"},
            "affected_components": {"type": "array", "items": {"type": "string"}, "description": "Affected hosts, URLs or components"},
            "template_id": {"type": "string", "description": "Template the finding is based on"}
        },
        "required": ["project_id", "title"],
        "additionalProperties": false
    });
    if update {
        schema["properties"]["finding_id"] = id_property("finding_id");
        schema["required"] = json!(["project_id", "finding_id"]);
    }
    schema
}

// ==================== Tool Handlers ====================

#[derive(Deserialize)]
struct ProjectRef {
    project_id: String,
}

#[derive(Deserialize)]
struct FindingRef {
    project_id: String,
    finding_id: String,
}

#[derive(Deserialize)]
struct ScopedList {
    project_id: String,
    #[serde(flatten)]
    query: ListQuery,
}

async fn list_projects(api: Arc<dyn CollabApi>, args: Value) -> Result<Value, ToolError> {
    let query: ListQuery = parse(args)?;
    Ok(api.list(&Resource::Projects, &query).await?)
}

async fn get_project(api: Arc<dyn CollabApi>, args: Value) -> Result<Value, ToolError> {
    let args: ProjectRef = parse(args)?;
    Ok(api.get(&Resource::Projects, &args.project_id).await?)
}

async fn create_project(api: Arc<dyn CollabApi>, args: Value) -> Result<Value, ToolError> {
    let input: ProjectInput = parse(args)?;
    let body = serde_json::to_value(&input).map_err(|e| ToolError::internal(e.to_string()))?;
    Ok(api.create(&Resource::Projects, body).await?)
}

async fn update_project(api: Arc<dyn CollabApi>, args: Value) -> Result<Value, ToolError> {
    #[derive(Deserialize)]
    struct Args {
        project_id: String,
        #[serde(flatten)]
        fields: ProjectInput,
    }

    let args: Args = parse(args)?;
    let body = update_body(&args.fields)?;
    Ok(api.update(&Resource::Projects, &args.project_id, body).await?)
}

async fn delete_project(api: Arc<dyn CollabApi>, args: Value) -> Result<Value, ToolError> {
    let args: ProjectRef = parse(args)?;
    api.delete(&Resource::Projects, &args.project_id).await?;
    Ok(json!({"deleted": true, "project_id": args.project_id}))
}

fn findings(project_id: String) -> Resource {
    Resource::Findings { project_id }
}

async fn list_findings(api: Arc<dyn CollabApi>, args: Value) -> Result<Value, ToolError> {
    let args: ScopedList = parse(args)?;
    Ok(api.list(&findings(args.project_id), &args.query).await?)
}

async fn get_finding(api: Arc<dyn CollabApi>, args: Value) -> Result<Value, ToolError> {
    let args: FindingRef = parse(args)?;
    Ok(api.get(&findings(args.project_id), &args.finding_id).await?)
}

async fn create_finding(api: Arc<dyn CollabApi>, args: Value) -> Result<Value, ToolError> {
    #[derive(Deserialize)]
    struct Args {
        project_id: String,
        #[serde(flatten)]
        fields: FindingInput,
    }

    let args: Args = parse(args)?;
    let body = serde_json::to_value(&args.fields).map_err(|e| ToolError::internal(e.to_string()))?;
    Ok(api.create(&findings(args.project_id), body).await?)
}

async fn update_finding(api: Arc<dyn CollabApi>, args: Value) -> Result<Value, ToolError> {
    #[derive(Deserialize)]
    struct Args {
        project_id: String,
        finding_id: String,
        #[serde(flatten)]
        fields: FindingInput,
    }

    let args: Args = parse(args)?;
    let body = update_body(&args.fields)?;
    Ok(api
        .update(&findings(args.project_id), &args.finding_id, body)
        .await?)
}

async fn delete_finding(api: Arc<dyn CollabApi>, args: Value) -> Result<Value, ToolError> {
    let args: FindingRef = parse(args)?;
    api.delete(&findings(args.project_id.clone()), &args.finding_id)
        .await?;
    Ok(json!({
        "deleted": true,
        "project_id": args.project_id,
        "finding_id": args.finding_id
    }))
}

async fn list_templates(api: Arc<dyn CollabApi>, args: Value) -> Result<Value, ToolError> {
    let query: ListQuery = parse(args)?;
    Ok(api.list(&Resource::Templates, &query).await?)
}

async fn get_template(api: Arc<dyn CollabApi>, args: Value) -> Result<Value, ToolError> {
    #[derive(Deserialize)]
    struct Args {
        template_id: String,
    }

    let args: Args = parse(args)?;
    Ok(api.get(&Resource::Templates, &args.template_id).await?)
}

async fn list_users(api: Arc<dyn CollabApi>, args: Value) -> Result<Value, ToolError> {
    let query: ListQuery = parse(args)?;
    Ok(api.list(&Resource::Users, &query).await?)
}

async fn upstream_status(api: Arc<dyn CollabApi>, _args: Value) -> Result<Value, ToolError> {
    match api.health().await {
        Ok(details) => Ok(json!({"reachable": true, "details": details})),
        Err(e) if e.status.is_some() => Ok(json!({
            "reachable": true,
            "healthy": false,
            "status": e.status,
            "error": e.message
        })),
        Err(e) => Err(e.into()),
    }
}

/// Serialize update fields, refusing an update that changes nothing
fn update_body<T: serde::Serialize>(fields: &T) -> Result<Value, ToolError> {
    let body = serde_json::to_value(fields).map_err(|e| ToolError::internal(e.to_string()))?;
    if body.as_object().map_or(true, |o| o.is_empty()) {
        return Err(ToolError::validation(vec![FieldError::new(
            "arguments",
            "at least one field to update is required",
        )]));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, UpstreamError};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every call and answers with canned JSON
    #[derive(Default)]
    struct FakeApi {
        calls: Mutex<Vec<String>>,
        fail_with: Option<UpstreamError>,
    }

    impl FakeApi {
        fn record(&self, call: String) -> Result<(), UpstreamError> {
            self.calls.lock().unwrap().push(call);
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CollabApi for FakeApi {
        async fn list(&self, resource: &Resource, query: &ListQuery) -> Result<Value, UpstreamError> {
            self.record(format!("list {} {:?}", resource.path(), query.to_pairs()))?;
            Ok(json!([]))
        }

        async fn get(&self, resource: &Resource, id: &str) -> Result<Value, UpstreamError> {
            self.record(format!("get {}", resource.item_path(id)))?;
            Ok(json!({"id": id}))
        }

        async fn create(&self, resource: &Resource, body: Value) -> Result<Value, UpstreamError> {
            self.record(format!("create {} {}", resource.path(), body))?;
            Ok(body)
        }

        async fn update(&self, resource: &Resource, id: &str, body: Value) -> Result<Value, UpstreamError> {
            self.record(format!("update {} {}", resource.item_path(id), body))?;
            Ok(body)
        }

        async fn delete(&self, resource: &Resource, id: &str) -> Result<(), UpstreamError> {
            self.record(format!("delete {}", resource.item_path(id)))
        }

        async fn health(&self) -> Result<Value, UpstreamError> {
            self.record("health".to_string())?;
            Ok(json!({"version": "test"}))
        }
    }

    fn setup(api: FakeApi) -> (ToolRegistry, Arc<FakeApi>) {
        let api = Arc::new(api);
        let mut registry = ToolRegistry::new();
        register_all(&mut registry, api.clone()).unwrap();
        (registry, api)
    }

    /// Validate like the dispatcher does, then run the handler
    async fn run(registry: &ToolRegistry, tool: &str, args: Value) -> Result<Value, ToolError> {
        let definition = registry.resolve(tool)?;
        let args = definition
            .schema
            .validate(&args)
            .map_err(ToolError::validation)?;
        definition.handler.call(args, context(tool)).await
    }

    fn context(tool: &str) -> ToolContext {
        ToolContext {
            request_id: "test".to_string(),
            tool: tool.to_string(),
            client: "test".to_string(),
            cancellation: tokio_util::sync::CancellationToken::new(),
            deadline: tokio::time::Instant::now() + std::time::Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_cancelled_call_skips_upstream() {
        let (registry, api) = setup(FakeApi::default());
        let definition = registry.resolve("list_projects").unwrap();
        let ctx = context("list_projects");
        ctx.cancellation.cancel();

        let err = definition.handler.call(json!({}), ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert!(api.calls().is_empty());
    }

    #[test]
    fn test_catalogue_registers() {
        let (registry, _) = setup(FakeApi::default());
        let names: Vec<_> = registry.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names.len(), 14);
        assert_eq!(names[0], "list_projects");
        assert!(names.contains(&"upstream_status".to_string()));

        let mut again = registry;
        let err = register_all(&mut again, Arc::new(FakeApi::default())).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTool { .. }));
    }

    #[tokio::test]
    async fn test_list_projects_passes_query() {
        let (registry, api) = setup(FakeApi::default());
        run(&registry, "list_projects", json!({"search": "acme", "limit": 10}))
            .await
            .unwrap();
        assert_eq!(
            api.calls(),
            vec![r#"list projects [("search", "acme"), ("limit", "10")]"#]
        );
    }

    #[tokio::test]
    async fn test_list_limit_bounds() {
        let (registry, api) = setup(FakeApi::default());
        for limit in [0, 501] {
            let err = run(&registry, "list_users", json!({"limit": limit}))
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::Validation);
            assert_eq!(err.fields[0].field, "limit");
        }
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_findings_are_scoped_to_project() {
        let (registry, api) = setup(FakeApi::default());
        run(
            &registry,
            "create_finding",
            json!({"project_id": "p1", "title": "SQL injection", "severity": "high", "cvss": 8.1}),
        )
        .await
        .unwrap();
        run(&registry, "get_finding", json!({"project_id": "p1", "finding_id": "f 1"}))
            .await
            .unwrap();

        let calls = api.calls();
        assert!(calls[0].starts_with("create projects/p1/findings"));
        assert!(calls[0].contains("\"severity\":\"high\""));
        assert!(!calls[0].contains("project_id"));
        assert_eq!(calls[1], "get projects/p1/findings/f%201");
    }

    #[tokio::test]
    async fn test_invalid_severity_rejected() {
        let (registry, _) = setup(FakeApi::default());
        let err = run(
            &registry,
            "create_finding",
            json!({"project_id": "p1", "title": "XSS", "severity": "urgent"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.fields[0].field, "severity");
    }

    #[tokio::test]
    async fn test_empty_update_rejected() {
        let (registry, api) = setup(FakeApi::default());
        let err = run(&registry, "update_project", json!({"project_id": "p1"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(api.calls().is_empty());

        let updated = run(
            &registry,
            "update_project",
            json!({"project_id": "p1", "name": "Renamed"}),
        )
        .await
        .unwrap();
        assert_eq!(updated, json!({"name": "Renamed"}));
    }

    #[tokio::test]
    async fn test_delete_reports_ids() {
        let (registry, api) = setup(FakeApi::default());
        let result = run(&registry, "delete_project", json!({"project_id": "p9"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"deleted": true, "project_id": "p9"}));
        assert_eq!(api.calls(), vec!["delete projects/p9"]);
    }

    #[tokio::test]
    async fn test_upstream_failure_becomes_upstream_error() {
        let (registry, _) = setup(FakeApi {
            fail_with: Some(UpstreamError::from_status(500, "boom")),
            ..FakeApi::default()
        });
        let err = run(&registry, "get_project", json!({"project_id": "p1"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Upstream);
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_upstream_status_reports_unhealthy_backend() {
        let (registry, _) = setup(FakeApi {
            fail_with: Some(UpstreamError::from_status(503, "")),
            ..FakeApi::default()
        });
        let status = run(&registry, "upstream_status", json!({})).await.unwrap();
        assert_eq!(status["healthy"], false);
        assert_eq!(status["status"], 503);

        let (registry, _) = setup(FakeApi {
            fail_with: Some(UpstreamError::transport("connection refused", true)),
            ..FakeApi::default()
        });
        let err = run(&registry, "upstream_status", json!({})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Upstream);
    }
}
