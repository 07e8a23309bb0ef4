//! JSON over HTTP/1 transport for [`WorkloadService`]
//!
//! All routes live under `/taa/v1` except `/health`. Every response carries
//! permissive CORS headers and each route answers `OPTIONS` for preflight.

use crate::error::{Result, WorkloadError};
use crate::service::WorkloadService;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

pub const API_PREFIX: &str = "/taa/v1";
const APPLICATION_JSON: &str = "application/json";

/// Largest request body accepted; every request shape is a few KiB of JSON
pub const MAX_BODY_BYTES: usize = 64 * 1024;

type HttpResponse = Response<Full<Bytes>>;

/// Per-route header requirements
#[derive(Clone, Copy)]
struct JsonBody {
    require_accept: bool,
}

const JSON_BODY: JsonBody = JsonBody {
    require_accept: false,
};
const JSON_BODY_AND_REPLY: JsonBody = JsonBody {
    require_accept: true,
};

/// Dispatches one request to the service
pub async fn route(
    service: &WorkloadService,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> HttpResponse {
    if method == Method::GET && path == "/health" {
        return json_response(StatusCode::OK, br#"{"status":"ok"}"#.to_vec());
    }

    let Some(route) = path.strip_prefix(API_PREFIX) else {
        return not_found();
    };

    let known = matches!(
        route,
        "/version" | "/quote" | "/key" | "/token" | "/decrypt" | "/execute" | "/reset" | "/provision"
    );
    if known && method == Method::OPTIONS {
        return empty_response(StatusCode::OK);
    }

    let result = match (method, route) {
        (&Method::GET, "/version") => to_json(&service.version()),
        (&Method::POST, "/quote") => match decode(headers, &body, JSON_BODY_AND_REPLY) {
            Ok(req) => service.get_quote(req).await.and_then(|r| to_json(&r)),
            Err(e) => Err(e),
        },
        (&Method::POST, "/key") => match decode(headers, &body, JSON_BODY_AND_REPLY) {
            Ok(req) => service.get_key(req).await.and_then(|r| to_json(&r)),
            Err(e) => Err(e),
        },
        (&Method::GET, "/token") => service
            .get_attestation_token()
            .await
            .and_then(|r| to_json(&r)),
        (&Method::POST, "/decrypt") => match decode(headers, &body, JSON_BODY) {
            Ok(req) => service.decrypt(req).await.map(|()| no_content()),
            Err(e) => Err(e),
        },
        (&Method::POST, "/execute") => match decode(headers, &body, JSON_BODY) {
            Ok(req) => service.execute(req).await.and_then(|r| to_json(&r)),
            Err(e) => Err(e),
        },
        (&Method::POST, "/reset") => service.reset().await.map(|()| no_content()),
        (&Method::POST, "/provision") => match decode(headers, &body, JSON_BODY) {
            Ok(req) => service.provision(req).await.map(|()| no_content()),
            Err(e) => Err(e),
        },
        _ if known => return error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"),
        _ => return not_found(),
    };

    result.unwrap_or_else(|e| error_response(status_for(&e), &e.to_string()))
}

async fn handle_http_request(
    service: Arc<WorkloadService>,
    req: Request<Incoming>,
) -> std::result::Result<HttpResponse, Infallible> {
    let (parts, body) = req.into_parts();
    let response = match read_body(body).await {
        Ok(bytes) => route(&service, &parts.method, parts.uri.path(), &parts.headers, bytes).await,
        Err(response) => response,
    };

    debug!(
        method = %parts.method,
        path = parts.uri.path(),
        status = response.status().as_u16(),
        "Handled request"
    );
    Ok(response)
}

/// Collects a request body of at most [`MAX_BODY_BYTES`]
async fn read_body<B>(body: B) -> std::result::Result<Bytes, HttpResponse>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            &format!("request body exceeds {} bytes", MAX_BODY_BYTES),
        )),
        Err(e) => {
            error!("Failed to read request body: {}", e);
            Err(error_response(StatusCode::BAD_REQUEST, &e.to_string()))
        }
    }
}

/// Binds `addr` and serves until the listener fails
pub async fn serve(service: Arc<WorkloadService>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(service, listener).await
}

pub async fn serve_listener(service: Arc<WorkloadService>, listener: TcpListener) -> Result<()> {
    info!(address = %listener.local_addr()?, "HTTP server listening");

    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let service = Arc::clone(&service);

        tokio::spawn(async move {
            let handler = service_fn(move |req| handle_http_request(Arc::clone(&service), req));

            if let Err(e) = http1::Builder::new().serve_connection(io, handler).await {
                error!(remote_addr = %remote_addr, error = %e, "Connection error");
            }
        });
    }
}

fn decode<T: DeserializeOwned>(headers: &HeaderMap, body: &[u8], rules: JsonBody) -> Result<T> {
    if rules.require_accept && !is_json(headers.get(ACCEPT)) {
        return Err(WorkloadError::UnsupportedMediaType(format!(
            "Accept must be {}",
            APPLICATION_JSON
        )));
    }
    if !is_json(headers.get(CONTENT_TYPE)) {
        return Err(WorkloadError::UnsupportedMediaType(format!(
            "Content-Type must be {}",
            APPLICATION_JSON
        )));
    }
    if body.is_empty() {
        return Err(WorkloadError::BadRequest("empty request body".to_string()));
    }
    serde_json::from_slice(body)
        .map_err(|e| WorkloadError::BadRequest(format!("failed to decode JSON request body: {}", e)))
}

fn is_json(value: Option<&HeaderValue>) -> bool {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(APPLICATION_JSON))
}

fn status_for(e: &WorkloadError) -> StatusCode {
    StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn to_json<T: Serialize>(value: &T) -> Result<HttpResponse> {
    Ok(json_response(StatusCode::OK, serde_json::to_vec(value)?))
}

fn json_response(status: StatusCode, body: Vec<u8>) -> HttpResponse {
    let mut response = with_cors(Response::new(Full::new(Bytes::from(body))));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
    response
}

fn empty_response(status: StatusCode) -> HttpResponse {
    let mut response = with_cors(Response::new(Full::new(Bytes::new())));
    *response.status_mut() = status;
    response
}

fn no_content() -> HttpResponse {
    empty_response(StatusCode::NO_CONTENT)
}

fn error_response(status: StatusCode, message: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": message }).to_string();
    json_response(status, body.into_bytes())
}

fn not_found() -> HttpResponse {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

fn with_cors(mut response: HttpResponse) -> HttpResponse {
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Accept, Content-Type, x-api-key"),
    );
    response
}
