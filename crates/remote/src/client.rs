//! Resource API client for the clinic backend.
//!
//! Every call targets `{api}/api/businesses/{business}/locations/{location}/resources`
//! and names the resource type in the `x-resource-type` header.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::{Map, Value};

use clinicsync_core::config::{ChannelIdentity, REQUEST_TIMEOUT_SECS};
use clinicsync_core::resources::{QueryParams, RemoteResourceApi, SortDirection};
use clinicsync_core::search::SearchRequest;

use crate::auth::TokenProvider;
use crate::error::{ApiError, Result};

const MAX_LOG_BODY_CHARS: usize = 512;
const RESOURCE_TYPE_HEADER: &str = "x-resource-type";
const TEMP_ID_HEADER: &str = "x-temp-id";
/// Body field carrying the client temp id on create.
pub const TEMP_ID_BODY_FIELD: &str = "_tempId";

fn log_response(status: StatusCode, body: &str) {
    if status.is_success() {
        debug!("[ResourceApi] Response status: {}", status);
        return;
    }

    let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
    if body.chars().count() > MAX_LOG_BODY_CHARS {
        preview.push_str("...");
    }
    debug!("[ResourceApi] Response error ({}): {}", status, preview);
}

/// Query-string form of a JSON filter value.
fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Accepts `{ "data": ... }` envelopes as well as bare payloads.
fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn into_list(value: Value) -> Result<Vec<Value>> {
    match unwrap_envelope(value) {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(ApiError::api(
            200,
            format!("expected a list response, got {}", kind_of(&other)),
        )),
    }
}

fn into_object(value: Value) -> Result<Value> {
    match unwrap_envelope(value) {
        object @ Value::Object(_) => Ok(object),
        other => Err(ApiError::api(
            200,
            format!("expected an object response, got {}", kind_of(&other)),
        )),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Client for the remote resource service.
#[derive(Clone)]
pub struct ResourceApiClient {
    client: reqwest::Client,
    base_url: String,
    identity: ChannelIdentity,
    tokens: Arc<dyn TokenProvider>,
}

impl ResourceApiClient {
    pub fn new(
        base_url: &str,
        identity: ChannelIdentity,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        Self::with_timeout(
            base_url,
            identity,
            tokens,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn with_timeout(
        base_url: &str,
        identity: ChannelIdentity,
        tokens: Arc<dyn TokenProvider>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(ApiError::invalid_request("API base URL is empty"));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            identity,
            tokens,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self) -> String {
        format!(
            "{}/api/businesses/{}/locations/{}/resources",
            self.base_url,
            urlencoding::encode(&self.identity.business_id),
            urlencoding::encode(&self.identity.location_id)
        )
    }

    fn item_url(&self, id: &str) -> String {
        format!("{}/{}", self.collection_url(), urlencoding::encode(id))
    }

    async fn headers(&self, resource_type: &str, temp_id: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let token = self
            .tokens
            .access_token()
            .await?
            .ok_or_else(|| ApiError::auth("No access token available"))?;
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| ApiError::auth("Invalid access token format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let type_value = HeaderValue::from_str(resource_type)
            .map_err(|_| ApiError::invalid_request("Invalid resource type header"))?;
        headers.insert(RESOURCE_TYPE_HEADER, type_value);

        if let Some(temp_id) = temp_id {
            let temp_value = HeaderValue::from_str(temp_id)
                .map_err(|_| ApiError::invalid_request("Invalid temp id header"))?;
            headers.insert(TEMP_ID_HEADER, temp_value);
        }

        Ok(headers)
    }

    /// Reads the body; `Ok(None)` for 404, an error for any other non-success status.
    async fn read_body(response: reqwest::Response) -> Result<Option<Value>> {
        let status = response.status();
        let body = response.text().await?;
        log_response(status, &body);

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| {
                    v.get("message")
                        .or_else(|| v.get("error"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| format!("Request failed: {}", body));
            return Err(ApiError::api(status.as_u16(), message));
        }
        if body.trim().is_empty() {
            return Ok(Some(Value::Null));
        }
        Ok(Some(serde_json::from_str(&body)?))
    }

    fn not_found(resource_type: &str, id: &str) -> ApiError {
        ApiError::api(404, format!("{} {} not found", resource_type, id))
    }

    /// GET /resources with filters, sort, limit and include as query parameters.
    pub async fn list_resources(
        &self,
        resource_type: &str,
        params: &QueryParams,
    ) -> Result<Vec<Value>> {
        let mut query: Vec<(String, String)> = params
            .filters
            .iter()
            .map(|(field, value)| (field.clone(), query_value(value)))
            .collect();
        if let Some(sort) = &params.sort {
            query.push(("sort".to_string(), sort.field.clone()));
            let order = match sort.direction {
                SortDirection::Asc => "asc",
                SortDirection::Desc => "desc",
            };
            query.push(("order".to_string(), order.to_string()));
        }
        if let Some(limit) = params.limit {
            query.push(("limit".to_string(), limit.to_string()));
        }
        if !params.include.is_empty() {
            query.push(("include".to_string(), params.include.join(",")));
        }

        debug!("[ResourceApi] list {} {:?}", resource_type, query);
        let response = self
            .client
            .get(self.collection_url())
            .headers(self.headers(resource_type, None).await?)
            .query(&query)
            .send()
            .await?;

        match Self::read_body(response).await? {
            Some(value) => into_list(value),
            None => Ok(Vec::new()),
        }
    }

    /// GET /resources/{id}
    pub async fn get_resource(&self, resource_type: &str, id: &str) -> Result<Option<Value>> {
        let response = self
            .client
            .get(self.item_url(id))
            .headers(self.headers(resource_type, None).await?)
            .send()
            .await?;

        Self::read_body(response).await?.map(into_object).transpose()
    }

    /// POST /resources with the temp id in both the header and the body.
    pub async fn create_resource(
        &self,
        resource_type: &str,
        data: &Map<String, Value>,
        temp_id: &str,
    ) -> Result<Value> {
        let mut body = data.clone();
        body.insert(
            TEMP_ID_BODY_FIELD.to_string(),
            Value::String(temp_id.to_string()),
        );

        debug!("[ResourceApi] create {} ({})", resource_type, temp_id);
        let response = self
            .client
            .post(self.collection_url())
            .headers(self.headers(resource_type, Some(temp_id)).await?)
            .json(&body)
            .send()
            .await?;

        match Self::read_body(response).await? {
            Some(value) => into_object(value),
            None => Err(ApiError::api(404, "resource collection not found")),
        }
    }

    /// PUT /resources/{id}
    pub async fn update_resource(
        &self,
        resource_type: &str,
        id: &str,
        data: &Map<String, Value>,
    ) -> Result<Value> {
        let response = self
            .client
            .put(self.item_url(id))
            .headers(self.headers(resource_type, None).await?)
            .json(data)
            .send()
            .await?;

        match Self::read_body(response).await? {
            Some(value) => into_object(value),
            None => Err(Self::not_found(resource_type, id)),
        }
    }

    /// DELETE /resources/{id}; `false` when the server reports 404.
    pub async fn delete_resource(&self, resource_type: &str, id: &str) -> Result<bool> {
        let response = self
            .client
            .delete(self.item_url(id))
            .headers(self.headers(resource_type, None).await?)
            .send()
            .await?;

        Ok(Self::read_body(response).await?.is_some())
    }

    /// GET /resources?searchField=..&searchTerm=..
    pub async fn search_resources(&self, request: &SearchRequest) -> Result<Vec<Value>> {
        let mut query: Vec<(String, String)> = vec![
            ("searchField".to_string(), request.field.clone()),
            ("searchTerm".to_string(), request.term.clone()),
        ];
        if let Some(limit) = request.limit {
            query.push(("limit".to_string(), limit.to_string()));
        }
        for (field, value) in &request.filters {
            query.push((field.clone(), query_value(value)));
        }

        let response = self
            .client
            .get(self.collection_url())
            .headers(self.headers(&request.resource_type, None).await?)
            .query(&query)
            .send()
            .await?;

        match Self::read_body(response).await? {
            Some(value) => into_list(value),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl RemoteResourceApi for ResourceApiClient {
    async fn list(
        &self,
        resource_type: &str,
        params: &QueryParams,
    ) -> clinicsync_core::Result<Vec<Value>> {
        Ok(self.list_resources(resource_type, params).await?)
    }

    async fn get(&self, resource_type: &str, id: &str) -> clinicsync_core::Result<Option<Value>> {
        Ok(self.get_resource(resource_type, id).await?)
    }

    async fn create(
        &self,
        resource_type: &str,
        data: &Map<String, Value>,
        temp_id: &str,
    ) -> clinicsync_core::Result<Value> {
        Ok(self.create_resource(resource_type, data, temp_id).await?)
    }

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        data: &Map<String, Value>,
    ) -> clinicsync_core::Result<Value> {
        Ok(self.update_resource(resource_type, id, data).await?)
    }

    async fn delete(&self, resource_type: &str, id: &str) -> clinicsync_core::Result<bool> {
        Ok(self.delete_resource(resource_type, id).await?)
    }

    async fn search(&self, request: &SearchRequest) -> clinicsync_core::Result<Vec<Value>> {
        Ok(self.search_resources(request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use crate::test_server::{start_mock_server, MockOutcome};
    use clinicsync_core::errors::{Error, RemoteErrorKind};
    use serde_json::json;

    fn identity() -> ChannelIdentity {
        ChannelIdentity {
            business_id: "biz 1".to_string(),
            user_id: "u1".to_string(),
            location_id: "loc1".to_string(),
        }
    }

    fn client(base_url: &str) -> ResourceApiClient {
        ResourceApiClient::new(base_url, identity(), Arc::new(StaticTokenProvider::new("tok")))
            .expect("client")
    }

    #[tokio::test]
    async fn list_sends_headers_and_unwraps_data_envelope() {
        let (base_url, captured, server) = start_mock_server(vec![MockOutcome::respond(
            200,
            r#"{"data":[{"id":"p1"},{"id":"p2"}]}"#,
        )])
        .await;
        let api = client(&base_url);

        let params = QueryParams::new()
            .filter("ward", json!("a"))
            .sort_by("name", SortDirection::Desc)
            .limit(5);
        let items = api.list("patients", &params).await.unwrap();
        assert_eq!(items.len(), 2);

        let requests = captured.lock().await;
        let request = &requests[0];
        assert!(request
            .path
            .starts_with("/api/businesses/biz%201/locations/loc1/resources?"));
        assert!(request.path.contains("ward=a"));
        assert!(request.path.contains("order=desc"));
        assert!(request.path.contains("limit=5"));
        assert_eq!(request.header("x-resource-type"), Some("patients"));
        assert_eq!(request.header("authorization"), Some("Bearer tok"));
        server.abort();
    }

    #[tokio::test]
    async fn create_carries_temp_id_in_header_and_body() {
        let (base_url, captured, server) = start_mock_server(vec![MockOutcome::respond(
            201,
            r#"{"id":"srv-1","name":"Ana"}"#,
        )])
        .await;
        let api = client(&base_url);

        let data = json!({ "name": "Ana" }).as_object().cloned().unwrap();
        let created = api.create("patients", &data, "tmp_abc").await.unwrap();
        assert_eq!(created["id"], json!("srv-1"));

        let requests = captured.lock().await;
        let request = &requests[0];
        assert_eq!(request.method, "POST");
        assert_eq!(request.header("x-temp-id"), Some("tmp_abc"));
        let body: Value = serde_json::from_str(&request.body).unwrap();
        assert_eq!(body["_tempId"], json!("tmp_abc"));
        assert_eq!(body["name"], json!("Ana"));
        server.abort();
    }

    #[tokio::test]
    async fn not_found_maps_to_none_and_false() {
        let (base_url, _captured, server) = start_mock_server(vec![
            MockOutcome::respond(404, r#"{"message":"missing"}"#),
            MockOutcome::respond(404, r#"{"message":"missing"}"#),
        ])
        .await;
        let api = client(&base_url);

        assert_eq!(api.get("patients", "nope").await.unwrap(), None);
        assert!(!api.delete("patients", "nope").await.unwrap());
        server.abort();
    }

    #[tokio::test]
    async fn server_errors_become_recoverable_remote_errors() {
        let (base_url, _captured, server) = start_mock_server(vec![MockOutcome::respond(
            503,
            r#"{"message":"maintenance"}"#,
        )])
        .await;
        let api = client(&base_url);

        let err = api.list("patients", &QueryParams::new()).await.unwrap_err();
        match err {
            Error::Remote(remote) => {
                assert_eq!(remote.kind, RemoteErrorKind::Status(503));
                assert!(remote.is_recoverable());
                assert!(remote.message.contains("maintenance"));
            }
            other => panic!("unexpected {other:?}"),
        }
        server.abort();
    }

    #[tokio::test]
    async fn dropped_connection_is_a_network_failure() {
        let (base_url, _captured, server) =
            start_mock_server(vec![MockOutcome::DropConnection]).await;
        let api = client(&base_url);

        let err = api.get("patients", "p1").await.unwrap_err();
        assert!(err.is_remote_failure());
        server.abort();
    }

    #[tokio::test]
    async fn search_sends_search_parameters() {
        let (base_url, captured, server) =
            start_mock_server(vec![MockOutcome::respond(200, r#"[{"id":"p1"}]"#)]).await;
        let api = client(&base_url);

        let request = SearchRequest::new("patients", "name", "an").with_limit(3);
        let items = api.search(&request).await.unwrap();
        assert_eq!(items.len(), 1);

        let requests = captured.lock().await;
        assert!(requests[0].path.contains("searchField=name"));
        assert!(requests[0].path.contains("searchTerm=an"));
        assert!(requests[0].path.contains("limit=3"));
        server.abort();
    }

    #[tokio::test]
    async fn missing_token_fails_before_sending() {
        let (base_url, captured, server) = start_mock_server(Vec::new()).await;
        let api = ResourceApiClient::new(
            &base_url,
            identity(),
            Arc::new(StaticTokenProvider::none()),
        )
        .unwrap();

        let err = api.get("patients", "p1").await.unwrap_err();
        assert!(matches!(err, Error::Remote(ref r) if r.kind == RemoteErrorKind::Auth));
        assert!(captured.lock().await.is_empty());
        server.abort();
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let result =
            ResourceApiClient::new("  ", identity(), Arc::new(StaticTokenProvider::none()));
        assert!(matches!(result, Err(ApiError::InvalidRequest(_))));
    }
}
