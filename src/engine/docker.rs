//! Docker Engine API client
//!
//! Talks to a Docker-compatible engine over its REST API, either on the
//! local Unix socket (`DOCKER_HOST=unix:///var/run/docker.sock`, the
//! default) or on a TCP endpoint (`tcp://host:2375` or an `http(s)://` URL).

use super::{ContainerEngine, ContainerInfo, CreatedContainer, PortInfo};
use crate::deployment::{ContainerSpec, Protocol};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Engine API version the client speaks
pub const API_VERSION: &str = "v1.43";

/// Endpoint of a stock local engine
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Extra time given to a stop request beyond the container's grace period
const STOP_SLACK: Duration = Duration::from_secs(30);

/// Docker engine client configuration
#[derive(Debug, Clone)]
pub struct DockerEngineConfig {
    /// Engine endpoint, `unix://`, `tcp://`, `http://` or `https://`
    pub host: String,
    /// Registry username for pulls
    pub registry_username: Option<String>,
    /// Registry password or token for pulls
    pub registry_token: Option<String>,
    /// Timeout for calls other than pull and stop
    pub request_timeout: Duration,
}

impl Default for DockerEngineConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_DOCKER_HOST.to_string(),
            registry_username: None,
            registry_token: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Where the engine listens
#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    /// Base URL such as `http://10.0.0.5:2375`
    Http(String),
    /// Path of the engine's Unix socket
    Unix(PathBuf),
}

/// Turn a `DOCKER_HOST` style value into an endpoint
fn parse_endpoint(host: &str) -> Result<Endpoint> {
    let host = host.trim();

    if let Some(path) = host.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(AgentError::Config(format!("missing socket path in {}", host)));
        }
        return Ok(Endpoint::Unix(PathBuf::from(path)));
    }

    let host = host.trim_end_matches('/');
    if let Some(rest) = host.strip_prefix("tcp://") {
        return Ok(Endpoint::Http(format!("http://{}", rest)));
    }
    if host.starts_with("http://") || host.starts_with("https://") {
        return Ok(Endpoint::Http(host.to_string()));
    }
    if host.starts_with("npipe://") {
        return Err(AgentError::Config(format!(
            "unsupported engine endpoint {}",
            host
        )));
    }

    Err(AgentError::Config(format!("invalid engine endpoint: {}", host)))
}

/// One engine API call
struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(&'static str, String)>,
    headers: Vec<(&'static str, String)>,
    body: Option<Vec<u8>>,
    timeout: Option<Duration>,
}

impl ApiRequest {
    fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    fn query(mut self, key: &'static str, value: impl ToString) -> Self {
        self.query.push((key, value.to_string()));
        self
    }

    fn header(mut self, key: &'static str, value: String) -> Self {
        self.headers.push((key, value));
        self
    }

    fn json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        let encoded = serde_json::to_vec(body)
            .map_err(|e| AgentError::Engine(format!("encode {}: {}", self.path, e)))?;
        self.body = Some(encoded);
        Ok(self)
    }

    fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Versioned path with the encoded query string
    fn path_and_query(&self) -> Result<String> {
        let path = format!("/{}{}", API_VERSION, self.path);
        if self.query.is_empty() {
            return Ok(path);
        }

        let url = Url::parse_with_params("http://engine/", &self.query)
            .map_err(|e| AgentError::Engine(format!("{}: {}", self.path, e)))?;
        Ok(format!("{}?{}", path, url.query().unwrap_or_default()))
    }
}

enum ResponseBody {
    Http(reqwest::Response),
    Unix(Incoming),
}

/// Engine response, whichever transport carried it
struct ApiResponse {
    status: StatusCode,
    body: ResponseBody,
}

impl ApiResponse {
    /// Next piece of the body, `None` at the end
    async fn chunk(&mut self) -> Result<Option<Bytes>> {
        match &mut self.body {
            ResponseBody::Http(response) => response
                .chunk()
                .await
                .map_err(|e| AgentError::Engine(e.to_string())),
            ResponseBody::Unix(body) => loop {
                match body.frame().await {
                    None => return Ok(None),
                    Some(Err(e)) => return Err(AgentError::Engine(e.to_string())),
                    Some(Ok(frame)) => {
                        if let Ok(data) = frame.into_data() {
                            return Ok(Some(data));
                        }
                    }
                }
            },
        }
    }

    async fn bytes(mut self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        while let Some(chunk) = self.chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    async fn json<T: DeserializeOwned>(self, context: &str) -> Result<T> {
        let body = self.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| AgentError::Engine(format!("{}: {}", context, e)))
    }
}

enum Transport {
    Http {
        client: reqwest::Client,
        base_url: String,
    },
    Unix {
        client: Client<UnixConnector, Full<Bytes>>,
        socket: PathBuf,
    },
}

impl Transport {
    fn new(endpoint: Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Http(base_url) => {
                let client = reqwest::Client::builder()
                    .connect_timeout(Duration::from_secs(10))
                    .build()
                    .map_err(|e| AgentError::Engine(e.to_string()))?;
                Ok(Transport::Http { client, base_url })
            }
            Endpoint::Unix(socket) => Ok(Transport::Unix {
                client: Client::unix(),
                socket,
            }),
        }
    }

    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let path_and_query = request.path_and_query()?;
        let ApiRequest {
            method,
            headers,
            body,
            timeout,
            ..
        } = request;

        match self {
            Transport::Http { client, base_url } => {
                let mut builder = client.request(method, format!("{}{}", base_url, path_and_query));
                for (key, value) in headers {
                    builder = builder.header(key, value);
                }
                if let Some(body) = body {
                    builder = builder.header(CONTENT_TYPE, "application/json").body(body);
                }
                if let Some(timeout) = timeout {
                    builder = builder.timeout(timeout);
                }

                let response = builder
                    .send()
                    .await
                    .map_err(|e| AgentError::Engine(e.to_string()))?;
                Ok(ApiResponse {
                    status: response.status(),
                    body: ResponseBody::Http(response),
                })
            }
            Transport::Unix { client, socket } => {
                let uri: hyper::Uri = hyperlocal::Uri::new(socket, &path_and_query).into();
                let mut builder = hyper::Request::builder().method(method).uri(uri);
                for (key, value) in headers {
                    builder = builder.header(key, value);
                }
                if body.is_some() {
                    builder = builder.header(CONTENT_TYPE, "application/json");
                }
                let request = builder
                    .body(Full::new(Bytes::from(body.unwrap_or_default())))
                    .map_err(|e| AgentError::Engine(e.to_string()))?;

                let pending = client.request(request);
                let response = match timeout {
                    Some(timeout) => tokio::time::timeout(timeout, pending)
                        .await
                        .map_err(|_| AgentError::Engine(format!("timed out after {:?}", timeout)))?,
                    None => pending.await,
                }
                .map_err(|e| {
                    AgentError::Engine(format!("{}: {}", socket.display(), e))
                })?;

                Ok(ApiResponse {
                    status: response.status(),
                    body: ResponseBody::Unix(response.into_body()),
                })
            }
        }
    }
}

/// Container engine backed by the Docker Engine REST API
pub struct DockerEngine {
    config: DockerEngineConfig,
    transport: Transport,
}

impl DockerEngine {
    /// Create a new engine client
    pub fn new(config: DockerEngineConfig) -> Result<Self> {
        let transport = Transport::new(parse_endpoint(&config.host)?)?;
        Ok(Self { config, transport })
    }

    /// Value for the `X-Registry-Auth` header
    fn registry_auth(&self) -> Option<String> {
        let username = self.config.registry_username.as_deref()?;
        let password = self.config.registry_token.as_deref().unwrap_or_default();

        let auth = RegistryAuth { username, password };
        let encoded = serde_json::to_vec(&auth).ok()?;
        Some(base64::engine::general_purpose::URL_SAFE.encode(encoded))
    }

    async fn send(&self, request: ApiRequest, context: &str) -> Result<ApiResponse> {
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| AgentError::Engine(format!("{}: {}", context, e)))?;
        check_status(response, context).await
    }

    /// Like `send`, but a 404 means the container `id` does not exist
    async fn send_for_container(
        &self,
        request: ApiRequest,
        id: &str,
        context: &str,
    ) -> Result<ApiResponse> {
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| AgentError::Engine(format!("{}: {}", context, e)))?;

        if response.status == StatusCode::NOT_FOUND {
            return Err(AgentError::NoSuchContainer(id.to_string()));
        }
        check_status(response, context).await
    }
}

/// Split an image reference into the `fromImage` and `tag` pull parameters
fn split_reference(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }

    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], Some(&image[name_start + i + 1..])),
        None => (image, Some("latest")),
    }
}

/// Parse an engine port key such as `80/tcp`
fn parse_port_key(key: &str) -> Option<(u16, Protocol)> {
    let (port, proto) = key.split_once('/').unwrap_or((key, "tcp"));
    Some((port.parse().ok()?, proto.parse().ok()?))
}

async fn check_status(response: ApiResponse, context: &str) -> Result<ApiResponse> {
    let status = response.status;
    if status.is_success() || status == StatusCode::NOT_MODIFIED {
        return Ok(response);
    }

    let body = response.bytes().await.unwrap_or_default();
    let message = serde_json::from_slice::<ErrorBody>(&body)
        .map(|e| e.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());

    Err(AgentError::Engine(format!("{}: {} {}", context, status, message)))
}

/// Check one line of the pull progress stream
fn handle_pull_line(image: &str, line: &[u8]) -> Result<()> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }

    let progress: PullProgress = match serde_json::from_str(line) {
        Ok(p) => p,
        Err(_) => {
            debug!("Unparsed pull output for {}: {}", image, line);
            return Ok(());
        }
    };

    if let Some(error) = progress
        .error_detail
        .map(|d| d.message)
        .filter(|m| !m.is_empty())
        .or(progress.error)
    {
        return Err(AgentError::Engine(format!("pull {}: {}", image, error)));
    }

    if let Some(status) = progress.status {
        match progress.id {
            Some(id) => debug!("pull {}: {} {}", image, id, status),
            None => debug!("pull {}: {}", image, status),
        }
    }

    Ok(())
}

fn create_body(spec: &ContainerSpec) -> CreateContainerBody {
    let port_key = spec.container_port_key();

    let mut exposed_ports = HashMap::new();
    exposed_ports.insert(port_key.clone(), HashMap::new());

    let mut port_bindings = HashMap::new();
    port_bindings.insert(
        port_key,
        vec![PortBindingBody {
            host_ip: spec.host.ip.clone(),
            host_port: if spec.host.port == 0 {
                String::new()
            } else {
                spec.host.port.to_string()
            },
        }],
    );

    CreateContainerBody {
        image: spec.image.clone(),
        cmd: spec.command.clone(),
        labels: spec.labels.clone(),
        exposed_ports,
        host_config: HostConfigBody { port_bindings },
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn pull_image(&self, image: &str) -> Result<()> {
        let (from_image, tag) = split_reference(image);

        let mut request = ApiRequest::new(Method::POST, "/images/create").query("fromImage", from_image);
        if let Some(tag) = tag {
            request = request.query("tag", tag);
        }
        if let Some(auth) = self.registry_auth() {
            request = request.header("X-Registry-Auth", auth);
        }

        let context = format!("pull {}", image);
        let mut response = self.send(request, &context).await?;

        // The body is a stream of JSON progress objects, one per line
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AgentError::Engine(format!("{}: {}", context, e)))?
        {
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                handle_pull_line(image, &line)?;
            }
        }
        handle_pull_line(image, &buffer)?;

        info!("Pulled image {}", image);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<CreatedContainer> {
        let request = ApiRequest::new(Method::POST, "/containers/create")
            .query("name", &spec.name)
            .timeout(self.config.request_timeout)
            .json(&create_body(spec))?;

        let context = format!("create {}", spec.name);
        let created: CreateContainerResponse =
            self.send(request, &context).await?.json(&context).await?;

        Ok(CreatedContainer {
            id: created.id,
            warnings: created.warnings.unwrap_or_default(),
        })
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let request = ApiRequest::new(Method::POST, format!("/containers/{}/start", id))
            .timeout(self.config.request_timeout);

        self.send_for_container(request, id, &format!("start {}", id))
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        let request = ApiRequest::new(Method::POST, format!("/containers/{}/stop", id))
            .query("t", timeout.as_secs())
            .timeout(timeout + STOP_SLACK);

        self.send_for_container(request, id, &format!("stop {}", id))
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let request = ApiRequest::new(Method::DELETE, format!("/containers/{}", id))
            .query("force", force)
            .timeout(self.config.request_timeout);

        self.send_for_container(request, id, &format!("remove {}", id))
            .await?;
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let request = ApiRequest::new(Method::GET, format!("/containers/{}/json", id))
            .timeout(self.config.request_timeout);

        let context = format!("inspect {}", id);
        let inspect: InspectResponse = self
            .send_for_container(request, id, &context)
            .await?
            .json(&context)
            .await?;

        Ok(inspect.into())
    }

    async fn list_containers(&self, labels: &HashMap<String, String>) -> Result<Vec<ContainerInfo>> {
        let mut label_filters: Vec<String> =
            labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        label_filters.sort();

        let mut filters = HashMap::new();
        filters.insert("label", label_filters);
        let filters = serde_json::to_string(&filters)
            .map_err(|e| AgentError::Engine(e.to_string()))?;

        let request = ApiRequest::new(Method::GET, "/containers/json")
            .query("all", "true")
            .query("filters", filters)
            .timeout(self.config.request_timeout);

        let items: Vec<ListItem> = self
            .send(request, "list containers")
            .await?
            .json("list containers")
            .await?;

        Ok(items.into_iter().map(ContainerInfo::from).collect())
    }
}

#[derive(Serialize)]
struct RegistryAuth<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullProgress {
    status: Option<String>,
    id: Option<String>,
    error: Option<String>,
    error_detail: Option<ErrorBody>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainerBody {
    image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cmd: Vec<String>,
    labels: HashMap<String, String>,
    exposed_ports: HashMap<String, HashMap<String, String>>,
    host_config: HostConfigBody,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfigBody {
    port_bindings: HashMap<String, Vec<PortBindingBody>>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortBindingBody {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

#[derive(Deserialize)]
struct CreateContainerResponse {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Warnings", default)]
    warnings: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectResponse {
    id: String,
    name: String,
    created: String,
    state: InspectState,
    config: InspectConfig,
    network_settings: InspectNetwork,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<PortBindingBody>>>>,
}

impl From<InspectResponse> for ContainerInfo {
    fn from(inspect: InspectResponse) -> Self {
        let mut ports = Vec::new();
        for (key, bindings) in inspect.network_settings.ports.unwrap_or_default() {
            let Some((container_port, proto)) = parse_port_key(&key) else {
                continue;
            };
            match bindings {
                Some(bindings) if !bindings.is_empty() => {
                    for b in bindings {
                        ports.push(PortInfo {
                            host_ip: Some(b.host_ip).filter(|ip| !ip.is_empty()),
                            host_port: b.host_port.parse().ok(),
                            container_port,
                            proto,
                        });
                    }
                }
                _ => ports.push(PortInfo {
                    host_ip: None,
                    host_port: None,
                    container_port,
                    proto,
                }),
            }
        }
        ports.sort_by_key(|p| (p.container_port, p.host_port));

        Self {
            id: inspect.id,
            name: inspect.name.trim_start_matches('/').to_string(),
            image: inspect.config.image,
            state: inspect.state.status,
            created_at: DateTime::parse_from_rfc3339(&inspect.created)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            labels: inspect.config.labels.unwrap_or_default(),
            ports,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListItem {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    image: String,
    state: String,
    created: i64,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
    #[serde(default)]
    ports: Vec<ListPort>,
}

#[derive(Deserialize)]
struct ListPort {
    #[serde(rename = "IP")]
    ip: Option<String>,
    #[serde(rename = "PrivatePort")]
    private_port: u16,
    #[serde(rename = "PublicPort")]
    public_port: Option<u16>,
    #[serde(rename = "Type")]
    kind: String,
}

impl From<ListItem> for ContainerInfo {
    fn from(item: ListItem) -> Self {
        let ports = item
            .ports
            .into_iter()
            .map(|p| PortInfo {
                host_ip: p.ip,
                host_port: p.public_port,
                container_port: p.private_port,
                proto: p.kind.parse().unwrap_or_default(),
            })
            .collect();

        Self {
            id: item.id,
            name: item
                .names
                .first()
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image: item.image,
            state: item.state,
            created_at: DateTime::from_timestamp(item.created, 0).unwrap_or_else(Utc::now),
            labels: item.labels.unwrap_or_default(),
            ports,
        }
    }
}
