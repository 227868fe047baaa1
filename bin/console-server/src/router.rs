//! JSON routes for the cluster admin surface

use console_api::{ClusterCreate, DataSelectQuery, Page};
use console_core::{select, ClusterError, ClusterManager};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::sync::Arc;
use tracing::{debug, error};

const MAX_BODY_BYTES: usize = 1 << 20;

#[derive(Debug)]
enum ApiError {
    Cluster(ClusterError),
    BadRequest(String),
    NotFound,
    Encode(serde_json::Error),
}

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        ApiError::Cluster(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Cluster(err) => cluster_error_status(err),
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Cluster(err) => err.to_string(),
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::NotFound => "not found".to_string(),
            ApiError::Encode(err) => format!("failed to encode response: {err}"),
        }
    }

    fn into_response(self) -> Response<Full<Bytes>> {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.message());
        }
        let body = serde_json::json!({ "error": self.message() });
        json_bytes(status, body.to_string().into_bytes())
    }
}

fn cluster_error_status(err: &ClusterError) -> StatusCode {
    match err {
        ClusterError::InvalidParameters(_) => StatusCode::BAD_REQUEST,
        ClusterError::ImmutableCluster(_) => StatusCode::FORBIDDEN,
        ClusterError::ClusterNotFound(_) | ClusterError::UnknownResource { .. } => {
            StatusCode::NOT_FOUND
        }
        ClusterError::ClusterExists(_) => StatusCode::CONFLICT,
        ClusterError::ConnectionFailed { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Query parameters accepted by the cluster routes
#[derive(Debug, Default, Deserialize)]
struct ClusterQuery {
    force: Option<String>,
    name: Option<String>,
    limit: Option<i64>,
    page: Option<i64>,
}

impl ClusterQuery {
    fn parse(query: Option<&str>) -> Result<Self, ApiError> {
        serde_urlencoded::from_str(query.unwrap_or_default())
            .map_err(|e| ApiError::BadRequest(format!("invalid query string: {e}")))
    }

    fn is_forced(&self) -> bool {
        matches!(self.force.as_deref(), Some("true") | Some("1"))
    }

    fn selection(&self, available: usize) -> DataSelectQuery {
        let filter = self.name.clone().unwrap_or_default();
        match (self.limit, self.page) {
            (None, None) => {
                // Everything on one page.
                let limit = i64::try_from(available.max(1)).unwrap_or(i64::MAX);
                DataSelectQuery::new(filter, limit, 1)
            }
            (limit, page) => DataSelectQuery::new(filter, limit.unwrap_or(0), page.unwrap_or(0)),
        }
    }
}

/// Routes admin requests to the cluster manager
pub struct Router {
    manager: Arc<ClusterManager>,
}

impl Router {
    pub fn new(manager: Arc<ClusterManager>) -> Self {
        Self { manager }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);
        let query = query.as_deref();
        debug!("{} {}", method, path);

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let result = match (&method, segments.as_slice()) {
            (&Method::GET, ["healthz"]) => {
                let mut response = Response::new(Full::new(Bytes::from_static(b"OK\n")));
                *response.status_mut() = StatusCode::OK;
                return response;
            }
            (&Method::GET, ["api", "v1", "clusters"]) => self.list_clusters(query).await,
            (&Method::POST, ["api", "v1", "clusters"]) => self.create_cluster(req.into_body()).await,
            (&Method::GET, ["api", "v1", "clusters", name]) => self.get_cluster(name, query).await,
            (&Method::PUT, ["api", "v1", "clusters", name]) => {
                self.update_cluster(name, req.into_body()).await
            }
            (&Method::DELETE, ["api", "v1", "clusters", name]) => self.delete_cluster(name).await,
            _ => Err(ApiError::NotFound),
        };

        result.unwrap_or_else(ApiError::into_response)
    }

    async fn list_clusters(&self, query: Option<&str>) -> Result<Response<Full<Bytes>>, ApiError> {
        let query = ClusterQuery::parse(query)?;
        let infos = self.manager.cluster_infos(query.is_forced()).await;
        let selection = query.selection(infos.len());

        let page: Page<_> = select(infos, &selection);
        json(StatusCode::OK, &page)
    }

    async fn get_cluster(&self, segment: &str, query: Option<&str>) -> Result<Response<Full<Bytes>>, ApiError> {
        let name = decode_segment(segment)?;
        let query = ClusterQuery::parse(query)?;
        let info = self.manager.cluster_info(&name, query.is_forced()).await?;
        json(StatusCode::OK, &info)
    }

    async fn create_cluster<B>(&self, body: B) -> Result<Response<Full<Bytes>>, ApiError>
    where
        B: Body,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let request: ClusterCreate = read_json(body).await?;
        let name = self.manager.create_cluster(request).await?;
        let info = self.manager.cluster_info(&name, false).await?;
        json(StatusCode::CREATED, &info)
    }

    async fn update_cluster<B>(&self, segment: &str, body: B) -> Result<Response<Full<Bytes>>, ApiError>
    where
        B: Body,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let name = decode_segment(segment)?;
        let mut request: ClusterCreate = read_json(body).await?;
        // The path names the cluster.
        request.cluster_name = name;
        let (name, params) = request.into_parts().map_err(ClusterError::from)?;

        self.manager.update_cluster(&name, params).await?;
        let info = self.manager.cluster_info(&name, false).await?;
        json(StatusCode::OK, &info)
    }

    async fn delete_cluster(&self, segment: &str) -> Result<Response<Full<Bytes>>, ApiError> {
        let name = decode_segment(segment)?;
        self.manager.delete_cluster(&name).await?;
        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::NO_CONTENT;
        Ok(response)
    }
}

/// Percent-decode one path segment
fn decode_segment(segment: &str) -> Result<String, ApiError> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| ApiError::BadRequest(format!("path segment is not valid UTF-8: {segment}")))
}

async fn read_json<T, B>(body: B) -> Result<T, ApiError>
where
    T: serde::de::DeserializeOwned,
    B: Body,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let bytes = Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read request body: {e}")))?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<Full<Bytes>>, ApiError> {
    let body = serde_json::to_vec(value).map_err(ApiError::Encode)?;
    Ok(json_bytes(status, body))
}

fn json_bytes(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
