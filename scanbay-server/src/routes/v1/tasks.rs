//! Task endpoints: create, inspect, tail output, stop, read back discovered
//! services and queue follow-ups against them.
//!
//! Creating a task only validates it, persists it as `pending` and queues a
//! `single_task` job; the worker loop runs it later.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use scanbay_core::entities::TaskStore;
use scanbay_core::runtime::playbook::render_options;
use scanbay_core::runtime::runner::output_tail;
use scanbay_core::{DiscoveredService, ParseError, TaskId, TaskRecord};
use tracing::{info, warn};
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::v1::task::{
    CreateTaskRequest, DEFAULT_OUTPUT_LINES, FollowUpRequest, FollowUpService, MAX_OUTPUT_LINES,
    OutputQuery, QueuedTaskResponse, ServiceResponse, StopResponse, TaskListQuery,
    TaskOutputResponse, TaskResponse, TaskServicesResponse,
};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(
        create_task,
        list_tasks,
        get_task,
        get_task_output,
        stop_task,
        get_task_services,
        create_follow_up
    ),
    components(schemas(
        CreateTaskRequest,
        QueuedTaskResponse,
        TaskResponse,
        TaskOutputResponse,
        StopResponse,
        ServiceResponse,
        TaskServicesResponse,
        FollowUpService,
        FollowUpRequest
    ))
)]
pub struct TasksApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/output", get(get_task_output))
        .route("/tasks/{id}/stop", post(stop_task))
        .route("/tasks/{id}/services", get(get_task_services))
        .route("/tasks/{id}/follow-up", post(create_follow_up))
}

const TEXT_FALLBACK_WARNING: &str =
    "structured report missing or unreadable; services were read from the raw output";

#[utoipa::path(
    post,
    path = "/v1/tasks",
    tag = "tasks",
    request_body = CreateTaskRequest,
    responses(
        (status = 201, description = "Task created and queued", body = QueuedTaskResponse),
        (status = 400, description = "Invalid tool, target, options or priority"),
        (status = 500, description = "Store error"),
    )
)]
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<QueuedTaskResponse>), ServerError> {
    let queued = state
        .runtime
        .factory
        .enqueue_single(
            &req.tool_id,
            &req.target,
            &req.options,
            req.project_id,
            req.priority,
        )
        .await?;
    info!(task_id = %queued.task.id, job_id = %queued.job_id, "task queued via API");
    Ok((StatusCode::CREATED, Json(queued.into())))
}

#[utoipa::path(
    get,
    path = "/v1/tasks",
    tag = "tasks",
    params(TaskListQuery),
    responses(
        (status = 200, description = "Tasks, newest first", body = [TaskResponse]),
        (status = 500, description = "Store error"),
    )
)]
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TaskListQuery>,
) -> Result<Json<Vec<TaskResponse>>, ServerError> {
    let tasks = state.runtime.store.list_tasks(q.project_id).await?;
    Ok(Json(tasks.into_iter().map(Into::into).collect()))
}

#[utoipa::path(
    get,
    path = "/v1/tasks/{id}",
    tag = "tasks",
    params(
        ("id" = i64, Path, description = "Task id")
    ),
    responses(
        (status = 200, description = "Task retrieved", body = TaskResponse),
        (status = 404, description = "Task not found"),
        (status = 500, description = "Store error"),
    )
)]
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<TaskResponse>, ServerError> {
    let task = find_task(&state, TaskId(id)).await?;
    Ok(Json(task.into()))
}

#[utoipa::path(
    get,
    path = "/v1/tasks/{id}/output",
    tag = "tasks",
    params(
        ("id" = i64, Path, description = "Task id"),
        OutputQuery
    ),
    responses(
        (status = 200, description = "Trailing lines of the raw output file", body = TaskOutputResponse),
        (status = 404, description = "Task not found"),
        (status = 500, description = "Output file could not be read"),
    )
)]
pub async fn get_task_output(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(q): Query<OutputQuery>,
) -> Result<Json<TaskOutputResponse>, ServerError> {
    let task = find_task(&state, TaskId(id)).await?;
    let lines = q.lines.unwrap_or(DEFAULT_OUTPUT_LINES).min(MAX_OUTPUT_LINES);

    // A pending task has no output file yet.
    let lines = match output_tail(&task.raw_output_file, lines).await {
        Ok(lines) => lines,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            return Err(ServerError::Internal(format!(
                "failed to read output of task {}: {e}",
                task.id
            )));
        }
    };

    Ok(Json(TaskOutputResponse {
        task_id: task.id.0,
        status: task.status.to_string(),
        lines,
    }))
}

#[utoipa::path(
    post,
    path = "/v1/tasks/{id}/stop",
    tag = "tasks",
    params(
        ("id" = i64, Path, description = "Task id")
    ),
    responses(
        (status = 200, description = "Task stopped, or already finished", body = StopResponse),
        (status = 404, description = "Task not found"),
        (status = 409, description = "Task has not started running"),
        (status = 500, description = "Store error"),
    )
)]
pub async fn stop_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<StopResponse>, ServerError> {
    let id = TaskId(id);
    let outcome = state.runtime.runner.stop(id).await?;
    Ok(Json(StopResponse::new(id, outcome)))
}

#[utoipa::path(
    get,
    path = "/v1/tasks/{id}/services",
    tag = "tasks",
    params(
        ("id" = i64, Path, description = "Task id")
    ),
    responses(
        (status = 200, description = "Open services found by the task", body = TaskServicesResponse),
        (status = 400, description = "Task's tool produces no structured report"),
        (status = 404, description = "Task not found, or it has produced no output yet"),
        (status = 500, description = "Results could not be read"),
    )
)]
pub async fn get_task_services(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<TaskServicesResponse>, ServerError> {
    let task = find_task(&state, TaskId(id)).await?;
    let Some(xml) = task.xml_output_file.clone() else {
        return Err(ServerError::BadRequest(format!(
            "task {} has no structured report to analyse",
            task.id
        )));
    };

    let non_empty = tokio::fs::metadata(&xml)
        .await
        .map(|meta| meta.len() > 0)
        .unwrap_or(false);
    if non_empty {
        let parser = state.runtime.parser.clone();
        let parsed = tokio::task::spawn_blocking(move || parser.parse(&xml))
            .await
            .map_err(|e| ServerError::Internal(format!("report parser did not finish: {e}")))?;
        match parsed {
            Ok(services) => return Ok(Json(services_response(&task, "xml", services, None))),
            Err(err @ ParseError::NotNmapXml { .. }) => {
                warn!(task_id = %task.id, error = %err, "falling back to raw output");
            }
            Err(err) => return Err(ServerError::Internal(err.to_string())),
        }
    }

    let lines = match output_tail(&task.raw_output_file, MAX_OUTPUT_LINES).await {
        Ok(lines) => lines,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ServerError::NotFound(format!("task {} has no output yet", task.id)));
        }
        Err(e) => {
            return Err(ServerError::Internal(format!(
                "failed to read output of task {}: {e}",
                task.id
            )));
        }
    };
    let services = state.runtime.parser.parse_text(&lines.join("\n"));
    Ok(Json(services_response(
        &task,
        "text",
        services,
        Some(TEXT_FALLBACK_WARNING),
    )))
}

fn services_response(
    task: &TaskRecord,
    source: &str,
    services: Vec<DiscoveredService>,
    warning: Option<&str>,
) -> TaskServicesResponse {
    TaskServicesResponse {
        task_id: task.id.0,
        status: task.status.to_string(),
        source: source.to_owned(),
        services: services.into_iter().map(Into::into).collect(),
        warning: warning.map(str::to_owned),
    }
}

#[utoipa::path(
    post,
    path = "/v1/tasks/{id}/follow-up",
    tag = "tasks",
    params(
        ("id" = i64, Path, description = "Task whose results the service came from")
    ),
    request_body = FollowUpRequest,
    responses(
        (status = 201, description = "Follow-up task created and queued", body = QueuedTaskResponse),
        (status = 400, description = "Invalid tool, host, option template or priority"),
        (status = 404, description = "Originating task not found"),
        (status = 500, description = "Store error"),
    )
)]
pub async fn create_follow_up(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<FollowUpRequest>,
) -> Result<(StatusCode, Json<QueuedTaskResponse>), ServerError> {
    let origin = find_task(&state, TaskId(id)).await?;
    let service = DiscoveredService::from(req.service);
    let options = render_options(&req.options, &service)
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;

    let queued = state
        .runtime
        .factory
        .enqueue_single(
            &req.tool_id,
            &service.host,
            &options,
            origin.project_id,
            req.priority,
        )
        .await?;
    info!(
        origin_task_id = %origin.id,
        task_id = %queued.task.id,
        job_id = %queued.job_id,
        host = %service.host,
        port = %service.port,
        "follow-up queued via API"
    );
    Ok((StatusCode::CREATED, Json(queued.into())))
}

async fn find_task(state: &AppState, id: TaskId) -> Result<TaskRecord, ServerError> {
    state
        .runtime
        .store
        .get_task(id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("task {id} not found")))
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::routes::testing::{get, post};
    use crate::state::testing::{app_state, seed_project};

    const REPORT: &str = r#"<?xml version="1.0"?>
<nmaprun scanner="nmap">
<host><address addr="10.0.0.5" addrtype="ipv4"/><ports>
<port protocol="tcp" portid="80"><state state="open"/><service name="http" product="nginx"/></port>
<port protocol="tcp" portid="8443"><state state="open"/><service name="https-alt"/></port>
<port protocol="tcp" portid="3306"><state state="closed"/><service name="mysql"/></port>
</ports></host>
</nmaprun>
"#;

    fn write_file(path: &serde_json::Value, contents: &str) {
        let path = std::path::Path::new(path.as_str().unwrap());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[tokio::test]
    async fn create_then_fetch_task() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path()).await;

        let (status, body) = post(
            &state,
            "/v1/tasks",
            json!({"tool_id": "nmap", "target": "scanme.example.com", "priority": 5}),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["task"]["status"], "pending");
        assert_eq!(body["task"]["tool_id"], "nmap");
        assert!(body["task"]["xml_output_file"].is_string());
        assert!(body["job_id"].as_i64().is_some());

        let id = body["task"]["id"].as_i64().unwrap();
        let (status, task) = get(&state, &format!("/v1/tasks/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(task["original_target"], "scanme.example.com");
        assert!(task["command_line"].as_str().unwrap().starts_with("nmap -sV"));

        let (status, list) = get(&state, "/v1/tasks").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_rejects_shell_metacharacters() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path()).await;

        let (status, body) = post(
            &state,
            "/v1/tasks",
            json!({"tool_id": "nmap", "target": "10.0.0.1", "options": "-sV; rm -rf /"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("shell metacharacters"));

        let (_, list) = get(&state, "/v1/tasks").await;
        assert!(list.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_rejects_unlisted_tool_and_bad_priority() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path()).await;

        let req = json!({"tool_id": "bash", "target": "10.0.0.1"});
        let (status, _) = post(&state, "/v1/tasks", req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = post(
            &state,
            "/v1/tasks",
            json!({"tool_id": "curl", "target": "10.0.0.1", "priority": 101}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("priority"));
    }

    #[tokio::test]
    async fn list_filters_by_project() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path()).await;

        let in_project = json!({"tool_id": "curl", "target": "10.0.0.1", "project_id": 1});
        post(&state, "/v1/tasks", in_project).await;
        post(&state, "/v1/tasks", json!({"tool_id": "curl", "target": "10.0.0.2"})).await;

        let (_, list) = get(&state, "/v1/tasks?project_id=1").await;
        let list = list.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["original_target"], "10.0.0.1");
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path()).await;

        let (status, _) = get(&state, "/v1/tasks/42").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get(&state, "/v1/tasks/42/output").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = post(&state, "/v1/tasks/42/stop", json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pending_task_has_empty_output_and_cannot_stop() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path()).await;

        let req = json!({"tool_id": "curl", "target": "10.0.0.1"});
        let (_, body) = post(&state, "/v1/tasks", req).await;
        let id = body["task"]["id"].as_i64().unwrap();

        let (status, output) = get(&state, &format!("/v1/tasks/{id}/output")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(output["status"], "pending");
        assert!(output["lines"].as_array().unwrap().is_empty());

        let (status, _) = post(&state, &format!("/v1/tasks/{id}/stop"), json!({})).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn output_returns_trailing_lines() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path()).await;

        let req = json!({"tool_id": "curl", "target": "10.0.0.1"});
        let (_, body) = post(&state, "/v1/tasks", req).await;
        let id = body["task"]["id"].as_i64().unwrap();
        let raw = body["task"]["raw_output_file"].as_str().unwrap();
        std::fs::create_dir_all(std::path::Path::new(raw).parent().unwrap()).unwrap();
        std::fs::write(raw, "one\ntwo\nthree\n").unwrap();

        let (_, output) = get(&state, &format!("/v1/tasks/{id}/output?lines=2")).await;
        assert_eq!(output["lines"], json!(["two", "three"]));
    }

    // ── services & follow-ups ───────────────────────────────────────────────

    #[tokio::test]
    async fn services_come_from_the_structured_report() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path()).await;

        let req = json!({"tool_id": "nmap", "target": "10.0.0.5"});
        let (_, body) = post(&state, "/v1/tasks", req).await;
        let id = body["task"]["id"].as_i64().unwrap();
        write_file(&body["task"]["xml_output_file"], REPORT);

        let (status, report) = get(&state, &format!("/v1/tasks/{id}/services")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["source"], "xml");
        assert!(report["warning"].is_null());
        let services = report["services"].as_array().unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0]["service_name"], "http");
        assert_eq!(services[0]["product"], "nginx");
        assert_eq!(services[1]["port"], "8443");
    }

    #[tokio::test]
    async fn services_fall_back_to_raw_output_with_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path()).await;

        let req = json!({"tool_id": "nmap", "target": "10.0.0.5"});
        let (_, body) = post(&state, "/v1/tasks", req).await;
        let id = body["task"]["id"].as_i64().unwrap();
        write_file(&body["task"]["xml_output_file"], "");
        write_file(
            &body["task"]["raw_output_file"],
            "Command: nmap -sV 10.0.0.5\n\
             Nmap scan report for 10.0.0.5\n\
             22/tcp open  ssh     OpenSSH 8.9p1\n\
             80/tcp open  http    nginx\n",
        );

        let (status, report) = get(&state, &format!("/v1/tasks/{id}/services")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["source"], "text");
        assert!(report["warning"].as_str().unwrap().contains("raw output"));
        let ports: Vec<&str> = report["services"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["port"].as_str().unwrap())
            .collect();
        assert_eq!(ports, vec!["22", "80"]);
    }

    #[tokio::test]
    async fn services_need_a_structured_tool_and_some_output() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path()).await;

        let req = json!({"tool_id": "curl", "target": "10.0.0.1"});
        let (_, body) = post(&state, "/v1/tasks", req).await;
        let curl = body["task"]["id"].as_i64().unwrap();
        let (status, _) = get(&state, &format!("/v1/tasks/{curl}/services")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let req = json!({"tool_id": "nmap", "target": "10.0.0.1"});
        let (_, body) = post(&state, "/v1/tasks", req).await;
        let pending = body["task"]["id"].as_i64().unwrap();
        let (status, _) = get(&state, &format!("/v1/tasks/{pending}/services")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get(&state, "/v1/tasks/42/services").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn follow_up_targets_the_service_and_inherits_the_project() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path()).await;
        let project = seed_project(&state, &["10.0.0.5"]).await;

        let req = json!({"tool_id": "nmap", "target": "10.0.0.5", "project_id": project});
        let (_, body) = post(&state, "/v1/tasks", req).await;
        let origin = body["task"]["id"].as_i64().unwrap();

        let (status, body) = post(
            &state,
            &format!("/v1/tasks/{origin}/follow-up"),
            json!({
                "tool_id": "curl",
                "service": {"host": "10.0.0.5", "port": "8443", "service_name": "https-alt"},
                "options": "-sI {protocol}://{host}:{port}",
                "priority": 20
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["task"]["project_id"], project);
        assert_eq!(body["task"]["original_target"], "10.0.0.5");
        assert_eq!(
            body["task"]["command"],
            json!(["curl", "-sI", "https://10.0.0.5:8443", "10.0.0.5"])
        );

        let job_id = body["job_id"].as_i64().unwrap();
        let (status, job) = get(&state, &format!("/v1/jobs/{job_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["priority"], 20);
        assert_eq!(job["project_id"], project);
    }

    #[tokio::test]
    async fn follow_up_rejects_bad_templates_and_unknown_origins() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path()).await;

        let req = json!({"tool_id": "nmap", "target": "10.0.0.5"});
        let (_, body) = post(&state, "/v1/tasks", req).await;
        let origin = body["task"]["id"].as_i64().unwrap();
        let service = json!({"host": "10.0.0.5", "port": "80"});

        let (status, body) = post(
            &state,
            &format!("/v1/tasks/{origin}/follow-up"),
            json!({"tool_id": "curl", "service": service.clone(), "options": "{wordlist}"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("wordlist"));

        let (status, _) = post(
            &state,
            "/v1/tasks/42/follow-up",
            json!({"tool_id": "curl", "service": service}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
