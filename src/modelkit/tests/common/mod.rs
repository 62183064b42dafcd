//! In-process OCI distribution registry for integration tests.
//!
//! Implements the subset of the distribution API the client uses: manifest
//! HEAD/GET/PUT/DELETE, blob HEAD/GET (with ranges), and monolithic or
//! chunked uploads. Optionally guards every `/v2/` route with a bearer token
//! issued at `/token`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::header::{HeaderValue, CONTENT_TYPE, HOST, LOCATION};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use kitops_modelkit::oci::sha256_digest;

const DIGEST_HEADER: &str = "Docker-Content-Digest";

#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    /// Require `Authorization: Bearer <token>` on `/v2/` routes
    pub bearer_token: Option<String>,
    /// Accept manifest `DELETE`; otherwise answer `405`
    pub allow_delete: bool,
    /// Honor `Range` on blob `GET`
    pub ranges: bool,
    /// Acknowledge one byte less than received after each `PATCH`
    pub short_ranges: bool,
    /// Hold manifest requests this long before answering
    pub manifest_delay: Option<Duration>,
    /// Hold blob `GET` requests this long before answering
    pub blob_delay: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRequest {
    pub method: String,
    pub path: String,
    pub range: Option<String>,
}

#[derive(Default)]
pub struct RegistryState {
    pub blobs: HashMap<String, Vec<u8>>,
    /// `<repository>/<tag or digest>` to media type and manifest bytes
    pub manifests: HashMap<String, (String, Vec<u8>)>,
    uploads: HashMap<u64, Vec<u8>>,
    next_upload: u64,
    pub requests: Vec<LoggedRequest>,
}

pub struct MockRegistry {
    pub addr: SocketAddr,
    pub state: Arc<Mutex<RegistryState>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl MockRegistry {
    pub async fn start(options: MockOptions) -> Self {
        let state = Arc::new(Mutex::new(RegistryState::default()));
        let options = Arc::new(options);

        let make_svc = {
            let state = state.clone();
            make_service_fn(move |_conn| {
                let state = state.clone();
                let options = options.clone();
                async move {
                    Ok::<_, Infallible>(service_fn(move |req| {
                        handle(req, state.clone(), options.clone())
                    }))
                }
            })
        };
        let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
        let addr = server.local_addr();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(server.with_graceful_shutdown(async {
            rx.await.ok();
        }));

        Self {
            addr,
            state,
            shutdown: Some(tx),
        }
    }

    /// `127.0.0.1:<port>`, usable as a reference registry.
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.state.lock().requests.clone()
    }

    /// Number of logged requests with `method`.
    pub fn count(&self, method: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.method == method)
            .count()
    }

    pub fn has_manifest(&self, repository: &str, reference: &str) -> bool {
        self.state
            .lock()
            .manifests
            .contains_key(&format!("{}/{}", repository, reference))
    }
}

impl Drop for MockRegistry {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn handle(
    req: Request<Body>,
    state: Arc<Mutex<RegistryState>>,
    options: Arc<MockOptions>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let host = header(HOST.as_str()).unwrap_or_default();
    let authorization = header("authorization");
    let range = header("range");
    let content_range = header("content-range");
    let content_type = header(CONTENT_TYPE.as_str());

    state.lock().requests.push(LoggedRequest {
        method: method.to_string(),
        path: path.clone(),
        range: range.clone(),
    });

    if path == "/token" {
        let token = options.bearer_token.clone().unwrap_or_default();
        return Ok(json(StatusCode::OK, serde_json::json!({ "token": token })));
    }
    if let Some(token) = &options.bearer_token {
        if authorization.as_deref() != Some(format!("Bearer {}", token).as_str()) {
            let challenge = format!(
                r#"Bearer realm="http://{}/token",service="mock-registry",scope="repository:*:pull,push""#,
                host
            );
            let mut response = error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "authentication required");
            response.headers_mut().insert(
                "WWW-Authenticate",
                HeaderValue::from_str(&challenge).unwrap(),
            );
            return Ok(response);
        }
    }

    let body = hyper::body::to_bytes(req.into_body())
        .await
        .map(|b| b.to_vec())
        .unwrap_or_default();

    let Some(rest) = path.strip_prefix("/v2/") else {
        return Ok(error(StatusCode::NOT_FOUND, "NAME_UNKNOWN", "not found"));
    };
    if rest.is_empty() {
        return Ok(Response::new(Body::empty()));
    }

    let delay = if rest.contains("/manifests/") {
        options.manifest_delay
    } else if method == Method::GET && rest.contains("/blobs/sha256:") {
        options.blob_delay
    } else {
        None
    };
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let mut state = state.lock();
    let response = if let Some((name, id)) = rest.split_once("/blobs/uploads/") {
        upload(
            &mut state,
            &method,
            name,
            id,
            &query,
            content_range.as_deref(),
            body,
            options.short_ranges,
        )
    } else if let Some((_, digest)) = rest.rsplit_once("/blobs/") {
        blob(&state, &method, digest, range.as_deref(), options.ranges)
    } else if let Some((name, reference)) = rest.rsplit_once("/manifests/") {
        manifest(
            &mut state,
            &method,
            name,
            reference,
            content_type,
            body,
            options.allow_delete,
        )
    } else {
        error(StatusCode::NOT_FOUND, "NAME_UNKNOWN", "not found")
    };
    Ok(response)
}

#[allow(clippy::too_many_arguments)]
fn upload(
    state: &mut RegistryState,
    method: &Method,
    name: &str,
    id: &str,
    query: &str,
    content_range: Option<&str>,
    body: Vec<u8>,
    short_ranges: bool,
) -> Response<Body> {
    if *method == Method::POST && id.is_empty() {
        let id = state.next_upload;
        state.next_upload += 1;
        state.uploads.insert(id, Vec::new());
        return with_location(
            StatusCode::ACCEPTED,
            &format!("/v2/{}/blobs/uploads/{}", name, id),
        );
    }
    let Some(id) = id.parse::<u64>().ok().filter(|id| state.uploads.contains_key(id)) else {
        return error(StatusCode::NOT_FOUND, "BLOB_UPLOAD_UNKNOWN", "upload unknown");
    };
    let location = format!("/v2/{}/blobs/uploads/{}", name, id);

    match *method {
        Method::PATCH => {
            let Some(buffer) = state.uploads.get_mut(&id) else {
                return error(StatusCode::NOT_FOUND, "BLOB_UPLOAD_UNKNOWN", "upload unknown");
            };
            let start = content_range
                .and_then(|r| r.split_once('-'))
                .and_then(|(s, _)| s.parse::<usize>().ok());
            if start != Some(buffer.len()) {
                return error(StatusCode::RANGE_NOT_SATISFIABLE, "BLOB_UPLOAD_INVALID", "bad range");
            }
            buffer.extend_from_slice(&body);
            let mut end = buffer.len().saturating_sub(1);
            if short_ranges {
                end = end.saturating_sub(1);
            }
            let mut response = with_location(StatusCode::ACCEPTED, &location);
            response
                .headers_mut()
                .insert("Range", HeaderValue::from_str(&format!("0-{}", end)).unwrap());
            response
        }
        Method::PUT => {
            let Some(mut data) = state.uploads.remove(&id) else {
                return error(StatusCode::NOT_FOUND, "BLOB_UPLOAD_UNKNOWN", "upload unknown");
            };
            data.extend_from_slice(&body);
            let digest = query_param(query, "digest").unwrap_or_default();
            if sha256_digest(&data) != digest {
                return error(StatusCode::BAD_REQUEST, "DIGEST_INVALID", "digest mismatch");
            }
            state.blobs.insert(digest.clone(), data);
            with_location(StatusCode::CREATED, &format!("/v2/{}/blobs/{}", name, digest))
        }
        _ => error(StatusCode::METHOD_NOT_ALLOWED, "UNSUPPORTED", "unsupported"),
    }
}

fn blob(
    state: &RegistryState,
    method: &Method,
    digest: &str,
    range: Option<&str>,
    ranges: bool,
) -> Response<Body> {
    let Some(data) = state.blobs.get(digest) else {
        return error(StatusCode::NOT_FOUND, "BLOB_UNKNOWN", "blob unknown");
    };
    let offset = range
        .filter(|_| ranges && *method == Method::GET)
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.strip_suffix('-'))
        .and_then(|r| r.parse::<usize>().ok())
        .filter(|offset| *offset < data.len());

    let mut builder = Response::builder().header(DIGEST_HEADER, digest);
    if ranges {
        builder = builder.header("Accept-Ranges", "bytes");
    }
    let response = match offset {
        Some(offset) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                "Content-Range",
                format!("bytes {}-{}/{}", offset, data.len() - 1, data.len()),
            )
            .body(Body::from(data[offset..].to_vec())),
        None => builder.status(StatusCode::OK).body(Body::from(data.clone())),
    };
    response.unwrap()
}

fn manifest(
    state: &mut RegistryState,
    method: &Method,
    name: &str,
    reference: &str,
    content_type: Option<String>,
    body: Vec<u8>,
    allow_delete: bool,
) -> Response<Body> {
    let key = format!("{}/{}", name, reference);
    match *method {
        Method::PUT => {
            let digest = sha256_digest(&body);
            let media_type = content_type.unwrap_or_default();
            state
                .manifests
                .insert(format!("{}/{}", name, digest), (media_type.clone(), body.clone()));
            state.manifests.insert(key, (media_type, body));
            let mut response = with_location(
                StatusCode::CREATED,
                &format!("/v2/{}/manifests/{}", name, digest),
            );
            response
                .headers_mut()
                .insert(DIGEST_HEADER, HeaderValue::from_str(&digest).unwrap());
            response
        }
        Method::DELETE => {
            if !allow_delete {
                return error(StatusCode::METHOD_NOT_ALLOWED, "UNSUPPORTED", "delete disabled");
            }
            let prefix = format!("{}/", name);
            let before = state.manifests.len();
            state
                .manifests
                .retain(|k, (_, data)| !(k.starts_with(&prefix) && sha256_digest(data) == reference));
            if state.manifests.len() == before {
                return error(StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN", "manifest unknown");
            }
            Response::builder()
                .status(StatusCode::ACCEPTED)
                .body(Body::empty())
                .unwrap()
        }
        Method::GET | Method::HEAD => {
            let Some((media_type, data)) = state.manifests.get(&key) else {
                return error(StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN", "manifest unknown");
            };
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, media_type.as_str())
                .header(DIGEST_HEADER, sha256_digest(data))
                .body(Body::from(data.clone()))
                .unwrap()
        }
        _ => error(StatusCode::METHOD_NOT_ALLOWED, "UNSUPPORTED", "unsupported"),
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    let url = reqwest::Url::parse(&format!("http://mock/?{}", query)).ok()?;
    let value = url
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned());
    value
}

fn with_location(status: StatusCode, location: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(LOCATION, location)
        .body(Body::empty())
        .unwrap()
}

fn json(status: StatusCode, value: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
        .unwrap()
}

fn error(status: StatusCode, code: &str, message: &str) -> Response<Body> {
    json(
        status,
        serde_json::json!({ "errors": [{ "code": code, "message": message }] }),
    )
}
