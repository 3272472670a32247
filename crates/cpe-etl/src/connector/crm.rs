//! Salesforce REST connector
//!
//! Each call logs in with the OAuth2 username-password flow, runs the SOQL
//! query, and follows `nextRecordsUrl` until the result set is complete.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::normalize::normalize_output;
use super::SourceConnector;
use crate::error::{EtlError, Result};
use crate::model::{QueryOutput, QueryRef, SourceKind};
use crate::settings::CrmSettings;

const ATTRIBUTES_KEY: &str = "attributes";

/// Executes SOQL against the Salesforce REST API
#[derive(Debug, Clone)]
pub struct CrmConnector {
    client: Client,
    settings: CrmSettings,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    instance_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryPage {
    #[serde(default)]
    total_size: u64,
    done: bool,
    #[serde(default)]
    records: Vec<Map<String, Value>>,
    next_records_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiError {
    message: String,
    #[serde(default)]
    error_code: String,
}

struct Session {
    access_token: String,
    instance_url: String,
}

impl CrmConnector {
    pub fn new(client: Client, settings: CrmSettings) -> Self {
        Self { client, settings }
    }

    pub fn from_settings(settings: &CrmSettings) -> Result<Self> {
        for (name, value) in [
            ("SF_USERNAME", &settings.username),
            ("SF_PASSWORD", &settings.password),
            ("SF_SECURITY_TOKEN", &settings.security_token),
        ] {
            if value.is_none() {
                return Err(EtlError::configuration(format!("{name} is not set")));
            }
        }

        let client = Client::builder()
            .user_agent(concat!("cpe-etl/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EtlError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self::new(client, settings.clone()))
    }

    async fn login(&self) -> Result<Session> {
        let url = format!(
            "{}/services/oauth2/token",
            self.settings.login_url.trim_end_matches('/')
        );
        let password = format!(
            "{}{}",
            self.settings.password.as_deref().unwrap_or_default(),
            self.settings.security_token.as_deref().unwrap_or_default()
        );

        let mut form = vec![
            ("grant_type", "password"),
            ("username", self.settings.username.as_deref().unwrap_or_default()),
            ("password", password.as_str()),
        ];
        if let Some(client_id) = self.settings.client_id.as_deref() {
            form.push(("client_id", client_id));
        }
        if let Some(client_secret) = self.settings.client_secret.as_deref() {
            form.push(("client_secret", client_secret));
        }

        info!(
            "Connecting to Salesforce as: {}",
            self.settings.username.as_deref().unwrap_or_default()
        );

        let response = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| EtlError::connection(format!("Salesforce login request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EtlError::connection(format!(
                "Salesforce login rejected ({status}): {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| EtlError::connection(format!("invalid Salesforce token response: {e}")))?;

        debug!("Salesforce session opened on {}", token.instance_url);
        Ok(Session {
            access_token: token.access_token,
            instance_url: token.instance_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_page(&self, session: &Session, url: &str, soql: Option<&str>) -> Result<QueryPage> {
        let mut request = self.client.get(url).bearer_auth(&session.access_token);
        if let Some(soql) = soql {
            request = request.query(&[("q", soql)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EtlError::connection(format!("Salesforce query request failed: {e}")))?;

        let response = check_query_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| EtlError::query(format!("invalid Salesforce query response: {e}")))
    }

    async fn query_all(&self, soql: &str) -> Result<Vec<Map<String, Value>>> {
        let session = self.login().await?;
        let first_url = format!(
            "{}/services/data/{}/query",
            session.instance_url, self.settings.api_version
        );

        let mut page = self.fetch_page(&session, &first_url, Some(soql)).await?;
        let total = page.total_size;
        let mut records = std::mem::take(&mut page.records);

        while !page.done {
            let Some(next) = page.next_records_url.take() else {
                warn!("Salesforce reported more records but gave no nextRecordsUrl");
                break;
            };
            debug!("Fetching next Salesforce page ({}/{} records)", records.len(), total);
            page = self
                .fetch_page(&session, &format!("{}{}", session.instance_url, next), None)
                .await?;
            records.append(&mut page.records);
        }

        Ok(records)
    }
}

/// Auth and server errors are connectivity; other client errors reject the query
async fn check_query_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<Vec<ApiError>>(&body)
        .ok()
        .and_then(|errors| errors.into_iter().next())
        .map(|e| format!("{}: {}", e.error_code, e.message))
        .unwrap_or(body);

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(EtlError::connection(format!(
            "Salesforce session rejected ({status}): {detail}"
        ))),
        s if s.is_client_error() => Err(EtlError::query(format!(
            "Salesforce rejected query ({status}): {detail}"
        ))),
        _ => Err(EtlError::connection(format!(
            "Salesforce unavailable ({status}): {detail}"
        ))),
    }
}

/// Convert Salesforce records into positional rows
///
/// Columns come from the first record. Related lists become `"<n> records"`
/// and other nested objects are rendered as compact JSON.
pub fn records_to_output(records: Vec<Map<String, Value>>) -> QueryOutput {
    let Some(first) = records.first() else {
        return QueryOutput::empty();
    };

    let columns: Vec<String> = first
        .keys()
        .filter(|k| k.as_str() != ATTRIBUTES_KEY)
        .cloned()
        .collect();

    let rows = records
        .into_iter()
        .map(|mut record| {
            columns
                .iter()
                .map(|c| flatten_value(record.remove(c).unwrap_or(Value::Null)))
                .collect()
        })
        .collect();

    QueryOutput::new(columns, rows)
}

fn flatten_value(value: Value) -> Value {
    match value {
        Value::Object(mut nested) => {
            if let Some(related) = nested.get("records") {
                let count = related.as_array().map_or(0, Vec::len);
                Value::String(format!("{count} records"))
            } else {
                nested.remove(ATTRIBUTES_KEY);
                Value::String(Value::Object(nested).to_string())
            }
        },
        other => other,
    }
}

#[async_trait]
impl SourceConnector for CrmConnector {
    fn kind(&self) -> SourceKind {
        SourceKind::Crm
    }

    async fn execute(&self, query: &QueryRef) -> Result<QueryOutput> {
        let soql = query.load()?;
        let records = self.query_all(soql.trim()).await?;

        if records.is_empty() {
            warn!("Salesforce query {} returned no records", query.display_name());
        }

        let mut output = records_to_output(records);
        normalize_output(SourceKind::Crm, &mut output);
        info!(
            "Salesforce query {} returned {} rows",
            query.display_name(),
            output.row_count()
        );
        Ok(output)
    }
}
