//! In-process fake of the Kubernetes pod API used by the driver tests.
//!
//! Serves pod create, get, patch, delete, watch and log endpoints for a
//! single namespace and records every request.

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use futures::{StreamExt, stream};
use kube::{Client, Config};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct Call {
    pub method: Method,
    pub path: String,
    pub params: HashMap<String, String>,
    pub body: Value,
}

#[derive(Debug, Clone, Default)]
struct FakeLogs {
    empty_responses: usize,
    text: String,
}

#[derive(Default)]
pub struct MockKube {
    calls: Mutex<Vec<Call>>,
    pods: Mutex<HashMap<String, Value>>,
    events: Mutex<Vec<Value>>,
    logs: Mutex<HashMap<String, FakeLogs>>,
}

impl MockKube {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: Method, path: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| call.method == method && call.path == path)
            .collect()
    }

    pub fn pod(&self, name: &str) -> Option<Value> {
        self.pods.lock().unwrap().get(name).cloned()
    }

    pub fn drop_pod(&self, name: &str) {
        self.pods.lock().unwrap().remove(name);
    }

    /// Copy of the stored pod with a single container status.
    pub fn pod_with_status(
        &self,
        name: &str,
        phase: &str,
        container: &str,
        reason: Option<&str>,
        exit_code: i32,
    ) -> Value {
        let mut pod = self.pod(name).unwrap_or_else(|| {
            json!({ "apiVersion": "v1", "kind": "Pod", "metadata": { "name": name } })
        });
        pod["status"] = json!({
            "phase": phase,
            "containerStatuses": [{
                "name": container,
                "image": "docker.io/library/alpine:latest",
                "imageID": "",
                "ready": false,
                "restartCount": 1,
                "state": {
                    "terminated": {
                        "exitCode": exit_code,
                        "reason": reason,
                    }
                }
            }]
        });
        pod
    }

    pub fn set_status(
        &self,
        name: &str,
        phase: &str,
        container: &str,
        reason: Option<&str>,
        exit_code: i32,
    ) {
        let pod = self.pod_with_status(name, phase, container, reason, exit_code);
        self.pods.lock().unwrap().insert(name.to_string(), pod);
    }

    /// Queue a watch event, served to every subsequent watch.
    pub fn push_event(&self, kind: &str, object: Value) {
        self.events
            .lock()
            .unwrap()
            .push(json!({ "type": kind, "object": object }));
    }

    /// Serve `text` for `container` after `empty_responses` empty log bodies.
    pub fn set_logs(&self, container: &str, empty_responses: usize, text: &str) {
        self.logs.lock().unwrap().insert(
            container.to_string(),
            FakeLogs {
                empty_responses,
                text: text.to_string(),
            },
        );
    }
}

/// Serve `mock` on an ephemeral port and return a client pointed at it.
pub async fn spawn(mock: Arc<MockKube>) -> Client {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().fallback(handle).with_state(mock);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = Config::new(format!("http://{}", addr).parse().unwrap());
    Client::try_from(config).unwrap()
}

fn not_found(name: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("pods \"{}\" not found", name),
            "reason": "NotFound",
            "details": { "name": name, "kind": "pods" },
            "code": 404,
        })),
    )
        .into_response()
}

fn apply_image_patch(pod: &mut Value, patch: &Value) {
    let Some(patched) = patch["spec"]["containers"].as_array() else {
        return;
    };
    let Some(containers) = pod["spec"]["containers"].as_array_mut() else {
        return;
    };

    for change in patched {
        if let Some(container) = containers
            .iter_mut()
            .find(|container| container["name"] == change["name"])
        {
            container["image"] = change["image"].clone();
        }
    }
}

fn watch_response(events: Vec<Value>) -> Response {
    let lines = events
        .into_iter()
        .map(|event| Ok::<_, Infallible>(Bytes::from(format!("{}\n", event))));
    let body = stream::iter(lines).chain(stream::pending());

    (StatusCode::OK, Body::from_stream(body)).into_response()
}

async fn handle(
    State(mock): State<Arc<MockKube>>,
    method: Method,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    mock.calls.lock().unwrap().push(Call {
        method: method.clone(),
        path: path.clone(),
        params: params.clone(),
        body: payload.clone(),
    });

    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let rest = match segments.as_slice() {
        ["api", "v1", "namespaces", _, "pods", rest @ ..] => rest,
        _ => return not_found("unknown"),
    };

    match (method, rest) {
        (Method::POST, []) => {
            let name = payload["metadata"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            mock.pods.lock().unwrap().insert(name, payload.clone());
            (StatusCode::CREATED, Json(payload)).into_response()
        }
        (Method::GET, []) if params.get("watch").map(String::as_str) == Some("true") => {
            let events = mock.events.lock().unwrap().clone();
            watch_response(events)
        }
        (Method::GET, [name]) => match mock.pod(name) {
            Some(pod) => Json(pod).into_response(),
            None => not_found(name),
        },
        (Method::PATCH, [name]) => {
            let mut pods = mock.pods.lock().unwrap();
            match pods.get_mut(*name) {
                Some(pod) => {
                    apply_image_patch(pod, &payload);
                    Json(pod.clone()).into_response()
                }
                None => not_found(name),
            }
        }
        (Method::DELETE, [name]) => match mock.pods.lock().unwrap().remove(*name) {
            Some(pod) => Json(pod).into_response(),
            None => not_found(name),
        },
        (Method::GET, [name, "log"]) => {
            if mock.pod(name).is_none() {
                return not_found(name);
            }
            let container = params.get("container").cloned().unwrap_or_default();
            let mut logs = mock.logs.lock().unwrap();
            let text = match logs.get_mut(&container) {
                Some(fake) if fake.empty_responses > 0 => {
                    fake.empty_responses -= 1;
                    String::new()
                }
                Some(fake) => fake.text.clone(),
                None => String::new(),
            };
            (StatusCode::OK, text).into_response()
        }
        _ => not_found("unknown"),
    }
}
