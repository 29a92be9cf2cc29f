//! Admin dashboard API client.
//!
//! Authenticated HTTP communication with the admin dashboard: submission of
//! queued sales and the lightweight health probe used for reachability.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::config::GatewayCredentials;
use crate::connectivity::ConnectivityProbe;
use crate::error::{AuthorityError, ConfigError};
use crate::gateway::TransactionAuthority;
use crate::model::{CanonicalTransaction, LocalId, Transaction, TransactionPayload};

/// Timeout used specifically for the health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const TRANSACTIONS_PATH: &str = "/api/pos/transactions";
const HEALTH_PATH: &str = "/api/health";

/// Payload fields the server may echo back in its own version of the sale.
const MERGEABLE_FIELDS: &[&str] = &["items", "customerId", "payments", "discountAmount", "notes"];

// ---------------------------------------------------------------------------
// Error helpers
// ---------------------------------------------------------------------------

/// Convert a reqwest error into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach admin dashboard at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid admin dashboard URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Admin dashboard endpoint not found".to_string(),
        429 => "Queue is backed up, retry later".to_string(),
        s if s >= 500 => "Admin dashboard server error".to_string(),
        _ => "Unexpected response from admin dashboard".to_string(),
    }
}

/// Build a structured error from a non-success response. The message keeps
/// the server's validation details so dead letters explain themselves.
fn error_from_response(
    status: StatusCode,
    retry_after_header: Option<&str>,
    body_text: &str,
) -> AuthorityError {
    let body_text = body_text.trim();
    let json = serde_json::from_str::<Value>(body_text).ok();

    let message = match &json {
        Some(json) => {
            let message = json
                .get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| status_error(status));
            match json.get("details").or_else(|| json.get("errors")) {
                Some(details) => format!("{message} (HTTP {}): {details}", status.as_u16()),
                None => format!("{message} (HTTP {})", status.as_u16()),
            }
        }
        None if !body_text.is_empty() => {
            format!("{} (HTTP {}): {body_text}", status_error(status), status.as_u16())
        }
        None => format!("{} (HTTP {})", status_error(status), status.as_u16()),
    };

    let retry_after_secs = retry_after_header
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .or_else(|| {
            json.as_ref()
                .and_then(|j| j.get("retry_after_seconds").or_else(|| j.get("retryAfterSeconds")))
                .and_then(Value::as_u64)
        })
        .filter(|secs| *secs > 0);

    AuthorityError {
        status: Some(status.as_u16()),
        message,
        retry_after_secs,
    }
}

// ---------------------------------------------------------------------------
// Request / response shapes
// ---------------------------------------------------------------------------

/// Request body for one sale. `client_request_id` lets the server drop
/// replays of a submission whose response was lost.
fn transaction_body(transaction: &Transaction, terminal_id: Option<&str>) -> Value {
    let payload = &transaction.payload;
    let items: Vec<Value> = payload
        .items
        .iter()
        .map(|item| {
            json!({
                "product_id": item.product_id,
                "name": item.name,
                "quantity": item.quantity,
                "unit_price": item.unit_price,
            })
        })
        .collect();
    let payments: Vec<Value> = payload
        .payments
        .iter()
        .map(|p| json!({ "method": p.method, "amount": p.amount }))
        .collect();

    json!({
        "client_request_id": transaction.local_id.as_str(),
        "local_id": transaction.local_id.as_str(),
        "terminal_id": terminal_id,
        "created_at": transaction.created_at.to_rfc3339(),
        "items": items,
        "customer_id": payload.customer_id,
        "payments": payments,
        "discount_amount": payload.discount_amount,
        "notes": payload.notes,
    })
}

fn snake_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for c in key.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Unwrap `{ "data": {...} }` / `{ "transaction": {...} }` envelopes.
fn unwrap_record(body: &Value) -> &Value {
    ["data", "transaction"]
        .iter()
        .find_map(|key| body.get(*key).filter(|v| v.is_object()))
        .unwrap_or(body)
}

fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.round() as i64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Stock figures as either `{ "<product>": qty }` or
/// `[{ "product_id": .., "quantity" | "stock_quantity": .. }]`.
fn parse_stock_levels(value: &Value) -> Option<BTreeMap<String, i64>> {
    let levels: BTreeMap<String, i64> = match value {
        Value::Object(map) => map
            .iter()
            .filter_map(|(product, qty)| Some((product.clone(), value_as_i64(qty)?)))
            .collect(),
        Value::Array(rows) => rows
            .iter()
            .filter_map(|row| {
                let product = row
                    .get("product_id")
                    .or_else(|| row.get("productId"))
                    .and_then(value_as_id)?;
                let qty = row
                    .get("stock_quantity")
                    .or_else(|| row.get("quantity"))
                    .and_then(value_as_i64)?;
                Some((product, qty))
            })
            .collect(),
        _ => return None,
    };
    Some(levels)
}

/// The server's record merged over our payload, field by field.
fn merge_payload(local: &TransactionPayload, record: &Value) -> TransactionPayload {
    let Some(server) = record.as_object() else {
        return local.clone();
    };
    let Ok(Value::Object(mut merged)) = serde_json::to_value(local) else {
        return local.clone();
    };

    let mut touched = false;
    for (key, value) in server {
        let key = snake_to_camel(key);
        if MERGEABLE_FIELDS.contains(&key.as_str()) && !value.is_null() {
            merged.insert(key, value.clone());
            touched = true;
        }
    }
    if !touched {
        return local.clone();
    }

    match serde_json::from_value::<TransactionPayload>(Value::Object(merged)) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "Server transaction fields not understood, keeping local payload");
            local.clone()
        }
    }
}

/// Turn a successful response body into the canonical transaction.
pub fn parse_canonical(transaction: &Transaction, body: &Value) -> Result<CanonicalTransaction, AuthorityError> {
    let record = unwrap_record(body);

    let server_id = ["id", "transaction_id", "transactionId"]
        .iter()
        .find_map(|key| record.get(*key).and_then(value_as_id))
        .ok_or_else(|| AuthorityError::network("Admin dashboard response is missing a transaction id"))?;

    let local_id = ["local_id", "localId", "client_request_id"]
        .iter()
        .find_map(|key| record.get(*key).and_then(Value::as_str))
        .and_then(|raw| LocalId::parse(raw).ok())
        .unwrap_or_else(|| transaction.local_id.clone());

    let stock_levels = ["stock_levels", "stockLevels"]
        .iter()
        .find_map(|key| record.get(*key).or_else(|| body.get(*key)))
        .and_then(parse_stock_levels);

    let confirmed_at = ["created_at", "createdAt", "updated_at"]
        .iter()
        .find_map(|key| record.get(*key).and_then(Value::as_str))
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(CanonicalTransaction {
        server_id,
        local_id,
        payload: merge_payload(&transaction.payload, record),
        stock_levels,
        confirmed_at,
    })
}

/// A 409 for a key the server has already seen means an earlier attempt went
/// through and only its acknowledgement was lost. When the body names the
/// stored sale, that is the confirmation.
fn duplicate_confirmation(transaction: &Transaction, body_text: &str) -> Option<CanonicalTransaction> {
    let body: Value = serde_json::from_str(body_text).ok()?;
    let canonical = parse_canonical(transaction, &body).ok()?;
    (canonical.local_id == transaction.local_id).then_some(canonical)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// reqwest-backed [`TransactionAuthority`] and [`ConnectivityProbe`].
pub struct AdminApiClient {
    client: Client,
    credentials: GatewayCredentials,
}

impl AdminApiClient {
    /// `timeout` bounds each submission; the health probe uses its own
    /// shorter limit.
    pub fn new(credentials: GatewayCredentials, timeout: Duration) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self { client, credentials })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.credentials.admin_url)
    }

    fn terminal_id(&self) -> &str {
        self.credentials.terminal_id.as_deref().unwrap_or_default()
    }
}

#[async_trait]
impl TransactionAuthority for AdminApiClient {
    async fn create_authoritative_transaction(
        &self,
        transaction: &Transaction,
    ) -> Result<CanonicalTransaction, AuthorityError> {
        let url = self.url(TRANSACTIONS_PATH);
        let body = transaction_body(transaction, self.credentials.terminal_id.as_deref());

        let resp = self
            .client
            .post(&url)
            .header("X-POS-API-Key", &self.credentials.api_key)
            .header("x-terminal-id", self.terminal_id())
            .header("Idempotency-Key", transaction.local_id.as_str())
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthorityError::network(friendly_error(&self.credentials.admin_url, &e)))?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body_text = resp.text().await.unwrap_or_default();

        if status == StatusCode::CONFLICT {
            if let Some(canonical) = duplicate_confirmation(transaction, &body_text) {
                info!(
                    local_id = %transaction.local_id,
                    server_id = %canonical.server_id,
                    "Admin dashboard already holds this transaction; treating as confirmed"
                );
                return Ok(canonical);
            }
        }

        if !status.is_success() {
            let err = error_from_response(status, retry_after.as_deref(), &body_text);
            debug!(
                local_id = %transaction.local_id,
                status = status.as_u16(),
                error = %err.message,
                "Admin dashboard refused transaction"
            );
            return Err(err);
        }

        let json: Value = if body_text.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(&body_text).map_err(|e| {
                AuthorityError::network(format!("Invalid JSON from admin dashboard: {e}"))
            })?
        };
        parse_canonical(transaction, &json)
    }
}

#[async_trait]
impl ConnectivityProbe for AdminApiClient {
    /// Any answer short of a server error counts as reachable.
    async fn check(&self) -> bool {
        let url = self.url(HEALTH_PATH);
        match self
            .client
            .head(&url)
            .timeout(PROBE_TIMEOUT)
            .header("X-POS-API-Key", &self.credentials.api_key)
            .send()
            .await
        {
            Ok(resp) => !resp.status().is_server_error(),
            Err(e) => {
                debug!(error = %friendly_error(&self.credentials.admin_url, &e), "Health probe failed");
                false
            }
        }
    }
}
