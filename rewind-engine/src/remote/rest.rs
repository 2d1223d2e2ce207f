//! REST client for a live platform instance.
//!
//! Login uses the OAuth username-password flow. Data calls go to the
//! versioned REST endpoints of the instance returned at login; bulk writes
//! use the composite sObject collection endpoint, which accepts up to
//! [`COLLECTION_LIMIT`] records per request and reports per-record results.
//! Callers split larger batches; [`RestApi`] never sends more than one
//! collection request per call.

use super::{AuthGrant, QueryPage, Record, RemoteApi, WriteMode, WriteResult};
use crate::config::EnvironmentConfig;
use crate::schema::{FieldDescribe, FieldType, ObjectDescribe};
use crate::session::{Credentials, Session};
use crate::utils::errors::{RemoteError, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

/// Records per composite collection request.
pub const COLLECTION_LIMIT: usize = 200;

const QUERY_OPTIONS_HEADER: &str = "Sforce-Query-Options";

pub struct RestApi {
    client: Client,
    login_url: String,
    client_id: String,
    api_version: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    instance_url: String,
    /// Milliseconds since the epoch, as a string
    #[serde(default)]
    issued_at: Option<String>,
}

#[derive(Deserialize)]
struct DescribeResponse {
    name: String,
    fields: Vec<DescribeField>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeField {
    name: String,
    #[serde(rename = "type")]
    field_type: FieldType,
    nillable: bool,
    #[serde(default = "default_true")]
    createable: bool,
    #[serde(default)]
    reference_to: Vec<String>,
    #[serde(default)]
    relationship_name: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    total_size: u64,
    records: Vec<Record>,
    #[serde(default)]
    next_records_url: Option<String>,
}

#[derive(Deserialize)]
struct CollectionResult {
    #[serde(default)]
    id: Option<String>,
    success: bool,
    #[serde(default)]
    errors: Vec<CollectionError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionError {
    #[serde(default)]
    status_code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    fields: Vec<String>,
}

impl RestApi {
    pub fn new(env: &EnvironmentConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("rewind/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            login_url: env.login_url.trim_end_matches('/').to_string(),
            client_id: env.client_id.clone(),
            api_version: env.api_version.trim_start_matches('v').to_string(),
        })
    }

    fn data_url(&self, session: &Session, path: &str) -> String {
        format!(
            "{}/services/data/v{}/{}",
            session.instance_url().trim_end_matches('/'),
            self.api_version,
            path.trim_start_matches('/')
        )
    }

    fn request(&self, session: &Session, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(session.access_token())
    }

    async fn send(&self, request: RequestBuilder) -> std::result::Result<Response, RemoteError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn fetch_page(&self, request: RequestBuilder) -> std::result::Result<QueryPage, RemoteError> {
        let response = self.send(request).await?;
        let body: QueryResponse = response.json().await.map_err(decode_error)?;
        Ok(into_page(body))
    }
}

#[async_trait]
impl RemoteApi for RestApi {
    async fn authenticate(&self, credentials: &Credentials) -> std::result::Result<AuthGrant, RemoteError> {
        let url = format!("{}/services/oauth2/token", self.login_url);
        let password = credentials.password_with_token();
        let form = [
            ("grant_type", "password"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", credentials.client_secret()),
            ("username", credentials.username()),
            ("password", password.expose()),
        ];
        debug!(login_url = %self.login_url, "Requesting access token");

        let response = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match classify_status(status, &body) {
                RemoteError::InvalidSession(msg) | RemoteError::Rejected(msg) => RemoteError::AuthFailed(msg),
                other => other,
            });
        }

        let token: TokenResponse = response.json().await.map_err(decode_error)?;
        Ok(AuthGrant {
            issued_at: token
                .issued_at
                .as_deref()
                .and_then(parse_issued_at)
                .unwrap_or_else(Utc::now),
            access_token: token.access_token,
            instance_url: token.instance_url,
        })
    }

    async fn describe(&self, session: &Session, object: &str) -> std::result::Result<ObjectDescribe, RemoteError> {
        let url = self.data_url(session, &format!("sobjects/{}/describe", object));
        let response = self.send(self.request(session, Method::GET, &url)).await?;
        let body: DescribeResponse = response.json().await.map_err(decode_error)?;
        Ok(into_describe(body))
    }

    async fn query(
        &self,
        session: &Session,
        object: &str,
        fields: &[String],
        batch_size: usize,
    ) -> std::result::Result<QueryPage, RemoteError> {
        let url = self.data_url(session, "query");
        let soql = select_statement(object, fields);
        trace!(%soql, "Opening query cursor");
        let request = self
            .request(session, Method::GET, &url)
            .query(&[("q", soql.as_str())])
            .header(QUERY_OPTIONS_HEADER, format!("batchSize={}", batch_size));
        self.fetch_page(request).await
    }

    async fn query_more(&self, session: &Session, locator: &str) -> std::result::Result<QueryPage, RemoteError> {
        let url = format!("{}{}", session.instance_url().trim_end_matches('/'), locator);
        self.fetch_page(self.request(session, Method::GET, &url)).await
    }

    async fn bulk_write(
        &self,
        session: &Session,
        object: &str,
        mode: WriteMode,
        records: &[Record],
    ) -> std::result::Result<Vec<WriteResult>, RemoteError> {
        // One request per call: a retried call must never resend records
        // an earlier request already committed.
        if records.len() > COLLECTION_LIMIT {
            return Err(RemoteError::Rejected(format!(
                "{} records exceed the collection limit of {}",
                records.len(),
                COLLECTION_LIMIT
            )));
        }
        let url = self.data_url(session, "composite/sobjects");
        let method = match mode {
            WriteMode::Create => Method::POST,
            WriteMode::Update => Method::PATCH,
        };

        let body = collection_body(object, records);
        let request = self.request(session, method, &url).json(&body);
        let response = self.send(request).await?;
        let items: Vec<CollectionResult> = response.json().await.map_err(decode_error)?;
        Ok(items.into_iter().map(into_write_result).collect())
    }
}

fn select_statement(object: &str, fields: &[String]) -> String {
    format!("SELECT {} FROM {}", fields.join(", "), object)
}

fn collection_body(object: &str, records: &[Record]) -> Value {
    let records: Vec<Value> = records
        .iter()
        .map(|record| {
            let mut body = record.clone();
            body.insert("attributes".into(), json!({ "type": object }));
            Value::Object(body)
        })
        .collect();
    json!({ "allOrNone": false, "records": records })
}

fn into_page(body: QueryResponse) -> QueryPage {
    let records = body
        .records
        .into_iter()
        .map(|mut record| {
            record.remove("attributes");
            record
        })
        .collect();
    QueryPage {
        records,
        total_size: Some(body.total_size),
        next: body.next_records_url,
    }
}

fn into_describe(body: DescribeResponse) -> ObjectDescribe {
    let fields = body
        .fields
        .into_iter()
        .map(|f| FieldDescribe {
            name: f.name,
            field_type: f.field_type,
            nullable: f.nillable,
            createable: f.createable,
            reference_to: f.reference_to,
            relationship_name: f.relationship_name,
        })
        .collect();
    ObjectDescribe::new(body.name, fields)
}

fn into_write_result(item: CollectionResult) -> WriteResult {
    if item.success {
        return WriteResult {
            success: true,
            id: item.id,
            error: None,
        };
    }
    let error = item
        .errors
        .iter()
        .map(|e| {
            if e.fields.is_empty() {
                format!("{}: {}", e.status_code, e.message)
            } else {
                format!("{}: {} ({})", e.status_code, e.message, e.fields.join(", "))
            }
        })
        .collect::<Vec<_>>()
        .join("; ");
    WriteResult::failed(if error.is_empty() { "unknown error".to_string() } else { error })
}

fn parse_issued_at(millis: &str) -> Option<DateTime<Utc>> {
    let millis = millis.parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
    match status {
        StatusCode::UNAUTHORIZED => RemoteError::InvalidSession(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => RemoteError::Transient(message),
        s if s.is_server_error() => RemoteError::Transient(message),
        _ => RemoteError::Rejected(message),
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Transient(e.to_string())
    }
}

fn decode_error(e: reqwest::Error) -> RemoteError {
    if e.is_decode() {
        RemoteError::Rejected(format!("unexpected response body: {}", e))
    } else {
        transport_error(e)
    }
}
