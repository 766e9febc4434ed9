//! Localhost HTTP control API of a running `dev` session

use std::{
    convert::Infallible,
    io,
    net::{IpAddr, SocketAddr, TcpListener as StdTcpListener},
    ops::Range,
    path::PathBuf,
    sync::Arc,
};

use futures::{channel::mpsc, channel::oneshot, future::BoxFuture, prelude::*};
use hyper::{
    header,
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server as HttpServer, StatusCode,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use odo_core::{trace_call_result, tracing::error_value, PlatformKind};
use odo_session::ForwardedPort;

use crate::{status::ComponentState, watch::Event};

pub const DEFAULT_API_PORT_RANGE: Range<u16> = 20000..30001;

const COMPONENT_PATH: &str = "/api/v1/component";
const COMMAND_PATH: &str = "/api/v1/component/command";
const INSTANCE_PATH: &str = "/api/v1/instance";

/// Work the API hands to the session loop
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ApiRequest {
    RunCommand(String),
    Shutdown,
}

#[derive(Clone, PartialEq, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDescription {
    pub name: String,
    pub devfile_path: PathBuf,
    pub running_on: PlatformKind,
    pub state: ComponentState,
    pub dev_forwarded_ports: Vec<ForwardedPort>,
    pub managed_by: String,
}

#[derive(Clone, PartialEq, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDescription {
    pub pid: u32,
    pub component_directory: PathBuf,
    pub api_server_port: u16,
    pub platform: PlatformKind,
}

#[derive(Deserialize, Debug)]
struct CommandRequest {
    name: String,
}

#[derive(Serialize, Debug)]
struct Message<'a> {
    message: &'a str,
}

/// What the handlers read and where they send requests
#[derive(Clone)]
pub struct ApiState {
    pub component: Arc<Mutex<ComponentDescription>>,
    pub pid: u32,
    pub workspace_root: PathBuf,
    pub requests: mpsc::UnboundedSender<Event>,
}

pub struct ApiServer {
    server: BoxFuture<'static, hyper::Result<()>>,
    listen_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
}

/// A server running on the runtime; dropping it leaves the server running until the runtime stops
pub struct ApiHandle {
    listen_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ApiServer {
    /// Binds `port`, or the first free port of `range` when none is pinned
    #[tracing::instrument(level = "info", err, skip(state))]
    pub fn bind(address: IpAddr, port: Option<u16>, range: Range<u16>, state: ApiState) -> Result<ApiServer, BindError> {
        let listener = match port {
            Some(port) => trace_call_result!(StdTcpListener::bind((address, port)))?,
            None => range
                .clone()
                .find_map(|port| StdTcpListener::bind((address, port)).ok())
                .ok_or(BindError::NoFreePort { range })?,
        };
        let listen_addr = trace_call_result!(listener.local_addr())?;
        let shared = Arc::new(Shared {
            state,
            port: listen_addr.port(),
        });
        let (shutdown, shutdown_rx) = oneshot::channel();

        let server = HttpServer::from_tcp(listener)?.serve(make_service_fn(move |_| {
            let shared = shared.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    let shared = shared.clone();
                    async move { Ok::<_, Infallible>(handle(&shared, request).await) }
                }))
            }
        }));
        info!(code = "api_server_bound", %listen_addr);

        let server = server.with_graceful_shutdown(shutdown_rx.unwrap_or_else(|err| {
            error!(code = "shutdown_signal_recv_failure", error = error_value(&err));
        }));
        Ok(ApiServer {
            server: server.boxed(),
            listen_addr,
            shutdown,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn spawn(self) -> ApiHandle {
        let server = self.server;
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                error!(code = "api_server_failed", error = error_value(&err));
            }
        });
        ApiHandle {
            listen_addr: self.listen_addr,
            shutdown: self.shutdown,
            task,
        }
    }
}

impl ApiHandle {
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Stops accepting connections and waits for in-flight requests
    pub async fn shutdown(self) {
        debug!(code = "trigger_shutdown_signal");
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

struct Shared {
    state: ApiState,
    port: u16,
}

async fn handle(shared: &Shared, request: Request<Body>) -> Response<Body> {
    let state = &shared.state;
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    debug!(code = "api_request", %method, %path);

    match (path.as_str(), method) {
        (COMPONENT_PATH, Method::GET) => json(StatusCode::OK, &*state.component.lock()),
        (COMMAND_PATH, Method::POST) => {
            let body = match hyper::body::to_bytes(request.into_body()).await {
                Ok(body) => body,
                Err(err) => return message(StatusCode::BAD_REQUEST, &err.to_string()),
            };
            match serde_json::from_slice::<CommandRequest>(&body) {
                Ok(command) => {
                    info!(code = "api_command_requested", command = %command.name);
                    send(state, ApiRequest::RunCommand(command.name))
                }
                Err(err) => message(StatusCode::BAD_REQUEST, &format!("invalid command request: {}", err)),
            }
        }
        (INSTANCE_PATH, Method::GET) => {
            let instance = InstanceDescription {
                pid: state.pid,
                component_directory: state.workspace_root.clone(),
                api_server_port: shared.port,
                platform: state.component.lock().running_on,
            };
            json(StatusCode::OK, &instance)
        }
        (INSTANCE_PATH, Method::DELETE) => {
            info!(code = "api_shutdown_requested");
            send(state, ApiRequest::Shutdown)
        }
        (COMPONENT_PATH | COMMAND_PATH | INSTANCE_PATH, _) => {
            message(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => message(StatusCode::NOT_FOUND, "not found"),
    }
}

fn send(state: &ApiState, request: ApiRequest) -> Response<Body> {
    match state.requests.unbounded_send(Event::Api(request)) {
        Ok(()) => message(StatusCode::OK, "request accepted"),
        Err(_) => message(StatusCode::SERVICE_UNAVAILABLE, "session is shutting down"),
    }
}

fn message(status: StatusCode, text: &str) -> Response<Body> {
    json(status, &Message { message: text })
}

fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
            response
        }
        Err(err) => {
            error!(code = "api_encode_failed", error = error_value(&err));
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

#[derive(Error, Debug)]
pub enum BindError {
    #[error("IO error encountered while starting server: {0}")]
    Io(#[from] io::Error),
    #[error("failed to bind HTTP server: {0}")]
    Http(#[from] hyper::Error),
    #[error("no free port for the API server in range {}..{}", .range.start, .range.end)]
    NoFreePort { range: Range<u16> },
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn state() -> (ApiState, mpsc::UnboundedReceiver<Event>) {
        let (requests, rx) = mpsc::unbounded();
        let component = ComponentDescription {
            name: "hello".to_owned(),
            devfile_path: PathBuf::from("/w/devfile.yaml"),
            running_on: PlatformKind::Podman,
            state: ComponentState::Ready,
            dev_forwarded_ports: Vec::new(),
            managed_by: "odo".to_owned(),
        };
        let state = ApiState {
            component: Arc::new(Mutex::new(component)),
            pid: 4242,
            workspace_root: PathBuf::from("/w"),
            requests,
        };
        (state, rx)
    }

    fn server(state: ApiState) -> ApiHandle {
        ApiServer::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), Some(0), DEFAULT_API_PORT_RANGE, state)
            .unwrap()
            .spawn()
    }

    #[tokio::test]
    async fn describes_component_and_instance() {
        odo_test_util::prep();
        let (state, _rx) = state();
        let handle = server(state);
        let base = format!("http://{}", handle.listen_addr());

        let component: serde_json::Value = reqwest::get(format!("{}{}", base, COMPONENT_PATH))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(component["name"], "hello");
        assert_eq!(component["state"], "Ready");
        assert_eq!(component["runningOn"], "podman");

        let instance: serde_json::Value = reqwest::get(format!("{}{}", base, INSTANCE_PATH))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(instance["pid"], 4242);
        assert_eq!(instance["apiServerPort"], handle.listen_addr().port());

        let missing = reqwest::get(format!("{}/api/v1/nothing", base)).await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn requests_reach_the_session() {
        odo_test_util::prep();
        let (state, mut rx) = state();
        let handle = server(state);
        let base = format!("http://{}", handle.listen_addr());
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}{}", base, COMMAND_PATH))
            .body(r#"{"name": "test"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(rx.next().await, Some(Event::Api(ApiRequest::RunCommand("test".to_owned()))));

        let response = client
            .post(format!("{}{}", base, COMMAND_PATH))
            .body("not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        let response = client.delete(format!("{}{}", base, INSTANCE_PATH)).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(rx.next().await, Some(Event::Api(ApiRequest::Shutdown)));
        handle.shutdown().await;
    }

    #[test]
    fn pinned_port_in_use() {
        let taken = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let (state, _rx) = state();
        let err = ApiServer::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), None, port..port + 1, state).err().unwrap();
        assert!(matches!(err, BindError::NoFreePort { .. }));
    }
}
