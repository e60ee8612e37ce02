//! In-process fake of the Docker Engine API used by the driver tests.
//!
//! Only the endpoints the driver calls are served. Every request is
//! recorded with its version prefix stripped.

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Json, Response};
use bollard::Docker;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use super::API_VERSION;

#[derive(Debug, Clone)]
pub struct Call {
    pub method: Method,
    pub path: String,
    pub params: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
struct FakeContainer {
    running: bool,
    exit_code: i64,
    body: Value,
    logs: Vec<u8>,
}

#[derive(Default)]
pub struct MockDocker {
    calls: Mutex<Vec<Call>>,
    images: Mutex<HashSet<String>>,
    containers: Mutex<HashMap<String, FakeContainer>>,
    volumes: Mutex<HashSet<String>>,
    networks: Mutex<HashSet<String>>,
}

impl MockDocker {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: Method, path: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| call.method == method && call.path == path)
            .collect()
    }

    pub fn add_image(&self, name: &str) {
        self.images.lock().unwrap().insert(name.to_string());
    }

    pub fn add_container(&self, id: &str, running: bool, exit_code: i64) {
        self.containers.lock().unwrap().insert(
            id.to_string(),
            FakeContainer {
                running,
                exit_code,
                ..Default::default()
            },
        );
    }

    /// Queue multiplexed log frames (`stream` 1 is stdout, 2 is stderr).
    pub fn set_logs(&self, id: &str, frames: &[(u8, &str)]) {
        let mut raw = Vec::new();
        for (stream, text) in frames {
            raw.extend_from_slice(&[*stream, 0, 0, 0]);
            raw.extend_from_slice(&(text.len() as u32).to_be_bytes());
            raw.extend_from_slice(text.as_bytes());
        }
        if let Some(ctn) = self.containers.lock().unwrap().get_mut(id) {
            ctn.logs = raw;
        }
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.volumes.lock().unwrap().contains(name)
    }

    pub fn has_container(&self, id: &str) -> bool {
        self.containers.lock().unwrap().contains_key(id)
    }

    /// Create payload the container was submitted with.
    pub fn container_body(&self, id: &str) -> Option<Value> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .map(|ctn| ctn.body.clone())
    }
}

/// Serve `mock` on an ephemeral port and return a client pointed at it.
pub async fn spawn(mock: Arc<MockDocker>) -> Docker {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().fallback(handle).with_state(mock);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Docker::connect_with_http(&format!("http://{}", addr), 5, &API_VERSION).unwrap()
}

fn strip_version(path: &str) -> &str {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((prefix, rest))
            if prefix.starts_with('v')
                && prefix[1..].chars().all(|c| c.is_ascii_digit() || c == '.') =>
        {
            &path[path.len() - rest.len() - 1..]
        }
        _ => path,
    }
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "message": format!("No such {}", what) })),
    )
        .into_response()
}

fn volume_json(name: &str) -> Value {
    json!({
        "Name": name,
        "Driver": "local",
        "Mountpoint": format!("/var/lib/docker/volumes/{}/_data", name),
        "Labels": {},
        "Scope": "local",
        "Options": {},
    })
}

async fn handle(
    State(mock): State<Arc<MockDocker>>,
    method: Method,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let path = strip_version(uri.path()).to_string();
    mock.calls.lock().unwrap().push(Call {
        method: method.clone(),
        path: path.clone(),
        params: params.clone(),
    });

    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    match (method, segments.as_slice()) {
        (Method::POST, ["volumes", "create"]) => {
            let name = payload["Name"].as_str().unwrap_or_default().to_string();
            mock.volumes.lock().unwrap().insert(name.clone());
            (StatusCode::CREATED, Json(volume_json(&name))).into_response()
        }
        (Method::GET, ["volumes", name]) => {
            if mock.has_volume(name) {
                Json(volume_json(name)).into_response()
            } else {
                not_found("volume")
            }
        }
        (Method::DELETE, ["volumes", name]) => {
            if mock.volumes.lock().unwrap().remove(*name) {
                StatusCode::NO_CONTENT.into_response()
            } else {
                not_found("volume")
            }
        }
        (Method::POST, ["networks", "create"]) => {
            let name = payload["Name"].as_str().unwrap_or_default().to_string();
            mock.networks.lock().unwrap().insert(name.clone());
            (
                StatusCode::CREATED,
                Json(json!({ "Id": format!("net-{}", name), "Warning": "" })),
            )
                .into_response()
        }
        (Method::GET, ["networks", name]) => {
            if mock.networks.lock().unwrap().contains(*name) {
                Json(json!({
                    "Name": name,
                    "Id": format!("net-{}", name),
                    "Driver": "bridge",
                    "Scope": "local",
                }))
                .into_response()
            } else {
                not_found("network")
            }
        }
        (Method::DELETE, ["networks", name]) => {
            if mock.networks.lock().unwrap().remove(*name) {
                StatusCode::NO_CONTENT.into_response()
            } else {
                not_found("network")
            }
        }
        (Method::POST, ["images", "create"]) => {
            let image = params.get("fromImage").cloned().unwrap_or_default();
            mock.add_image(&image);
            let progress = format!(
                "{}\n{}\n",
                json!({ "status": "Pulling from library", "id": image }),
                json!({ "status": format!("Downloaded newer image for {}", image) }),
            );
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                progress,
            )
                .into_response()
        }
        (Method::GET, ["images", rest @ .., "json"]) => {
            let name = rest.join("/");
            if mock.images.lock().unwrap().contains(&name) {
                Json(json!({ "Id": format!("sha256:{}", name), "RepoTags": [name] }))
                    .into_response()
            } else {
                not_found("image")
            }
        }
        (Method::POST, ["containers", "create"]) => {
            let id = params.get("name").cloned().unwrap_or_default();
            mock.containers.lock().unwrap().insert(
                id.clone(),
                FakeContainer {
                    body: payload,
                    ..Default::default()
                },
            );
            (
                StatusCode::CREATED,
                Json(json!({ "Id": id, "Warnings": [] })),
            )
                .into_response()
        }
        (Method::POST, ["containers", id, action]) => {
            let mut containers = mock.containers.lock().unwrap();
            let Some(ctn) = containers.get_mut(*id) else {
                return not_found("container");
            };
            match *action {
                "start" => {
                    ctn.running = true;
                    StatusCode::NO_CONTENT.into_response()
                }
                "kill" => {
                    ctn.running = false;
                    ctn.exit_code = 137;
                    StatusCode::NO_CONTENT.into_response()
                }
                "wait" => {
                    ctn.running = false;
                    Json(json!({ "StatusCode": ctn.exit_code })).into_response()
                }
                _ => not_found("endpoint"),
            }
        }
        (Method::GET, ["containers", id, "json"]) => {
            match mock.containers.lock().unwrap().get(*id) {
                Some(ctn) => Json(json!({
                    "Id": id,
                    "Name": format!("/{}", id),
                    "State": {
                        "Status": if ctn.running { "running" } else { "exited" },
                        "Running": ctn.running,
                        "Paused": false,
                        "Restarting": false,
                        "ExitCode": ctn.exit_code,
                    },
                }))
                .into_response(),
                None => not_found("container"),
            }
        }
        (Method::GET, ["containers", id, "logs"]) => {
            match mock.containers.lock().unwrap().get(*id) {
                Some(ctn) => (
                    StatusCode::OK,
                    [(
                        header::CONTENT_TYPE,
                        "application/vnd.docker.multiplexed-stream",
                    )],
                    Body::from(ctn.logs.clone()),
                )
                    .into_response(),
                None => not_found("container"),
            }
        }
        (Method::DELETE, ["containers", id]) => {
            if mock.containers.lock().unwrap().remove(*id).is_some() {
                StatusCode::NO_CONTENT.into_response()
            } else {
                not_found("container")
            }
        }
        _ => not_found("endpoint"),
    }
}
