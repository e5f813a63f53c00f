//! Admin dashboard API client.
//!
//! Authenticated HTTP access to the order endpoints plus the lightweight
//! health check the engine uses for online detection. The [`OrdersApi`]
//! trait is the seam: the engine and distributor only see the trait, so
//! tests substitute scripted servers without any network.
//!
//! Remote payloads are parsed tolerantly from `Value` rather than strict
//! structs: admin deployments disagree about camelCase vs snake_case and
//! about envelope shapes, and one malformed order must not poison a whole
//! snapshot.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{from_reqwest, from_status, SyncError};
use crate::model::{
    ItemRef, ItemStatus, Order, OrderFilter, OrderItem, OrderRecord, OrderStatus, OrderType,
    PaymentStatus, SyncStatus,
};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity check.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the admin dashboard URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Pull the human-readable message out of an error response body, falling
/// back to the raw text. Admin endpoints answer with `{"error": ...}` or
/// `{"message": ...}`, sometimes with a `details` payload worth keeping.
fn extract_error_detail(body_text: &str) -> String {
    let Ok(json) = serde_json::from_str::<Value>(body_text) else {
        return body_text.trim().to_string();
    };
    let message = json
        .get("error")
        .or_else(|| json.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body_text.trim().to_string());
    match json.get("details").or_else(|| json.get("errors")) {
        Some(details) => format!("{message}: {details}"),
        None => message,
    }
}

// ---------------------------------------------------------------------------
// Trait and wire types
// ---------------------------------------------------------------------------

/// Offset pagination for snapshot fetches.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

/// One page of the server's order snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotPage {
    pub orders: Vec<OrderRecord>,
    pub has_more: bool,
    pub sync_timestamp: Option<String>,
}

/// Server acknowledgement for a created or updated order.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub id: String,
    pub order_number: Option<String>,
    pub token_number: Option<i64>,
    pub total_amount: Option<f64>,
}

/// Result of a connectivity check.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything the engine asks of the admin dashboard.
#[async_trait]
pub trait OrdersApi: Send + Sync {
    async fn fetch_orders(&self, filter: &OrderFilter, page: Page)
        -> Result<SnapshotPage, SyncError>;
    async fn create_order(&self, record: &OrderRecord) -> Result<OrderAck, SyncError>;
    async fn update_order(&self, record: &OrderRecord) -> Result<OrderAck, SyncError>;
    /// Idempotent on the server side: repeating the same status is a no-op.
    async fn update_item_status(
        &self,
        order_id: &str,
        item_id: &str,
        status: ItemStatus,
    ) -> Result<(), SyncError>;
    async fn delete_order(&self, order_id: &str) -> Result<(), SyncError>;
    async fn check_health(&self) -> ConnectivityResult;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpOrdersApi {
    base_url: String,
    api_key: String,
    tenant_id: String,
    client: Client,
    health_client: Client,
}

impl HttpOrdersApi {
    pub fn new(
        admin_url: &str,
        api_key: &str,
        tenant_id: &str,
    ) -> Result<HttpOrdersApi, SyncError> {
        let base_url = normalize_admin_url(admin_url);
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| from_reqwest(&base_url, &e))?;
        let health_client = Client::builder()
            .timeout(CONNECTIVITY_TIMEOUT)
            .build()
            .map_err(|e| from_reqwest(&base_url, &e))?;
        Ok(HttpOrdersApi {
            base_url,
            api_key: api_key.to_string(),
            tenant_id: tenant_id.to_string(),
            client,
            health_client,
        })
    }

    /// Send an authenticated request and hand back the raw status and body.
    /// `path` includes the leading slash, e.g. `/api/pos/orders`.
    async fn send_raw(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(StatusCode, String), SyncError> {
        let full_url = format!("{}{path}", self.base_url);
        let mut req = self
            .client
            .request(method, &full_url)
            .header("X-POS-API-Key", &self.api_key)
            .header("Content-Type", "application/json");
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| from_reqwest(&self.base_url, &e))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        Ok((status, text))
    }

    /// Perform an authenticated request, mapping failure statuses and
    /// parsing the body as JSON.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, SyncError> {
        let (status, text) = self.send_raw(method, path, body).await?;

        if !status.is_success() {
            let detail = extract_error_detail(&text);
            debug!(path, status = status.as_u16(), detail = %detail, "Request rejected");
            return Err(from_status(status, &detail));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            SyncError::Rejected(format!("Admin dashboard returned invalid JSON: {e}"))
        })
    }
}

#[async_trait]
impl OrdersApi for HttpOrdersApi {
    async fn fetch_orders(
        &self,
        filter: &OrderFilter,
        page: Page,
    ) -> Result<SnapshotPage, SyncError> {
        let mut path = format!(
            "/api/pos/orders?limit={}&offset={}",
            page.limit, page.offset
        );
        if !filter.statuses.is_empty() {
            let statuses = filter
                .statuses
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(",");
            path.push_str(&format!("&status={}", percent_encode(&statuses)));
        }
        if let Some(order_type) = filter.order_type {
            path.push_str(&format!("&orderType={}", order_type.as_str()));
        }
        if let Some(branch) = &filter.branch_id {
            path.push_str(&format!("&branchId={}", percent_encode(branch)));
        }
        if filter.include_deleted {
            path.push_str("&includeDeleted=true");
        }

        let value = self.request(Method::GET, &path, None).await?;
        Ok(parse_snapshot(&value, page.limit, &self.tenant_id))
    }

    async fn create_order(&self, record: &OrderRecord) -> Result<OrderAck, SyncError> {
        let body = order_to_wire(record);
        let value = self
            .request(Method::POST, "/api/pos/orders", Some(&body))
            .await?;
        let ack = parse_ack(&value).ok_or_else(|| {
            SyncError::Rejected("Create response is missing the order id".to_string())
        })?;
        info!(order_id = %record.order.id, remote_id = %ack.id, "Order created on server");
        Ok(ack)
    }

    async fn update_order(&self, record: &OrderRecord) -> Result<OrderAck, SyncError> {
        let server_id = record
            .order
            .remote_id
            .as_deref()
            .unwrap_or(record.order.id.as_str());
        let body = order_to_wire(record);
        let path = format!("/api/pos/orders/{}", percent_encode(server_id));
        let value = self.request(Method::PUT, &path, Some(&body)).await?;
        // Some deployments answer an update with 204 and no body.
        Ok(parse_ack(&value).unwrap_or(OrderAck {
            id: server_id.to_string(),
            order_number: None,
            token_number: None,
            total_amount: None,
        }))
    }

    async fn update_item_status(
        &self,
        order_id: &str,
        item_id: &str,
        status: ItemStatus,
    ) -> Result<(), SyncError> {
        let path = format!(
            "/api/pos/orders/{}/items/{}/status",
            percent_encode(order_id),
            percent_encode(item_id)
        );
        self.request(Method::PATCH, &path, Some(&json!({ "status": status.as_str() })))
            .await?;
        Ok(())
    }

    async fn delete_order(&self, order_id: &str) -> Result<(), SyncError> {
        let path = format!("/api/pos/orders/{}", percent_encode(order_id));
        let (status, text) = self.send_raw(Method::DELETE, &path, None).await?;
        // An already-missing order counts as deleted. Queue redelivery
        // after a lost ack lands here.
        if status == StatusCode::NOT_FOUND {
            debug!(order_id, "Order already absent on server, treating delete as done");
            return Ok(());
        }
        if !status.is_success() {
            let detail = extract_error_detail(&text);
            return Err(from_status(status, &detail));
        }
        Ok(())
    }

    async fn check_health(&self) -> ConnectivityResult {
        let health_url = format!("{}/api/health", self.base_url);
        let start = Instant::now();
        let resp = match self
            .health_client
            .get(&health_url)
            .header("X-POS-API-Key", &self.api_key)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return ConnectivityResult {
                    success: false,
                    latency_ms: None,
                    error: Some(from_reqwest(&self.base_url, &e).to_string()),
                };
            }
        };

        let latency = start.elapsed().as_millis() as u64;
        let status = resp.status();
        if status.is_success() {
            ConnectivityResult {
                success: true,
                latency_ms: Some(latency),
                error: None,
            }
        } else {
            ConnectivityResult {
                success: false,
                latency_ms: Some(latency),
                error: Some(from_status(status, "").to_string()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Wire parsing
// ---------------------------------------------------------------------------

fn get_str(obj: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| obj.get(k).and_then(Value::as_str))
        .map(str::to_string)
}

fn get_f64(obj: &Value, keys: &[&str]) -> f64 {
    keys.iter()
        .find_map(|k| {
            let v = obj.get(k)?;
            v.as_f64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
        .unwrap_or(0.0)
}

fn get_i64(obj: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| {
        let v = obj.get(k)?;
        v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    })
}

/// Parse one page out of whatever envelope the server used: `{"orders": []}`,
/// `{"data": []}`, or a bare array.
pub fn parse_snapshot(value: &Value, limit: u32, tenant_id: &str) -> SnapshotPage {
    let rows = value
        .get("orders")
        .or_else(|| value.get("data"))
        .and_then(Value::as_array)
        .or_else(|| value.as_array())
        .cloned()
        .unwrap_or_default();

    let mut orders = Vec::with_capacity(rows.len());
    for row in &rows {
        match order_from_remote(row, tenant_id) {
            Some(record) => orders.push(record),
            None => warn!("Skipping malformed order in snapshot"),
        }
    }

    let has_more = value
        .get("hasMore")
        .or_else(|| value.get("has_more"))
        .and_then(Value::as_bool)
        .unwrap_or(rows.len() as u32 >= limit && limit > 0);

    SnapshotPage {
        orders,
        has_more,
        sync_timestamp: get_str(value, &["syncTimestamp", "sync_timestamp", "timestamp"]),
    }
}

/// Materialize a server order into the local record shape. Returns `None`
/// when the row has no usable id.
pub fn order_from_remote(value: &Value, tenant_id: &str) -> Option<OrderRecord> {
    let id = get_str(value, &["id", "orderId", "order_id"])?;
    let now = chrono::Utc::now().to_rfc3339();
    let created_at = get_str(value, &["createdAt", "created_at"]).unwrap_or_else(|| now.clone());
    let updated_at =
        get_str(value, &["updatedAt", "updated_at"]).unwrap_or_else(|| created_at.clone());
    let order_date =
        get_str(value, &["orderDate", "order_date"]).unwrap_or_else(|| created_at.clone());

    let order = Order {
        order_number: get_str(value, &["orderNumber", "order_number"]).unwrap_or_else(|| id.clone()),
        tenant_id: get_str(value, &["tenantId", "tenant_id"])
            .unwrap_or_else(|| tenant_id.to_string()),
        branch_id: get_str(value, &["branchId", "branch_id"]),
        table_number: get_str(value, &["tableNumber", "table_number"]),
        customer_name: get_str(value, &["customerName", "customer_name"]),
        order_type: OrderType::parse(
            &get_str(value, &["orderType", "order_type"]).unwrap_or_default(),
        ),
        status: OrderStatus::parse(&get_str(value, &["status"]).unwrap_or_default()),
        payment_status: PaymentStatus::parse(
            &get_str(value, &["paymentStatus", "payment_status"]).unwrap_or_default(),
        ),
        subtotal: get_f64(value, &["subtotal"]),
        discount_amount: get_f64(value, &["discountAmount", "discount_amount", "discount"]),
        tax_amount: get_f64(value, &["taxAmount", "tax_amount", "tax"]),
        delivery_fee: get_f64(value, &["deliveryFee", "delivery_fee"]),
        total_amount: get_f64(value, &["totalAmount", "total_amount", "total"]),
        special_instructions: get_str(value, &["specialInstructions", "special_instructions"]),
        order_date,
        created_at,
        updated_at,
        sync_status: SyncStatus::Synced,
        remote_id: Some(id.clone()),
        deleted_at: get_str(value, &["deletedAt", "deleted_at"]),
        id,
    };

    let items = value
        .get("items")
        .or_else(|| value.get("orderItems"))
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| item_from_remote(row, &order.id))
                .collect()
        })
        .unwrap_or_default();

    Some(OrderRecord { order, items })
}

fn item_from_remote(value: &Value, order_id: &str) -> Option<OrderItem> {
    let id = get_str(value, &["id", "itemId", "item_id"])?;
    let item_ref = ItemRef::from_columns(
        get_str(value, &["foodItemId", "food_item_id"]),
        get_str(value, &["buffetId", "buffet_id"]),
        get_str(value, &["comboMealId", "combo_meal_id"]),
    )
    .ok()?;
    let now = chrono::Utc::now().to_rfc3339();
    let created_at = get_str(value, &["createdAt", "created_at"]).unwrap_or_else(|| now.clone());
    Some(OrderItem {
        order_id: order_id.to_string(),
        item_ref,
        name: get_str(value, &["name", "itemName", "item_name"]).unwrap_or_default(),
        quantity: get_i64(value, &["quantity", "qty"]).unwrap_or(1),
        unit_price: get_f64(value, &["unitPrice", "unit_price", "price"]),
        subtotal: get_f64(value, &["subtotal"]),
        variation: get_str(value, &["variation", "variant"]),
        addons: value
            .get("addons")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default(),
        special_instructions: get_str(value, &["specialInstructions", "special_instructions"]),
        status: ItemStatus::parse(&get_str(value, &["status"]).unwrap_or_default()),
        updated_at: get_str(value, &["updatedAt", "updated_at"]).unwrap_or_else(|| created_at.clone()),
        created_at,
        id,
    })
}

fn parse_ack(value: &Value) -> Option<OrderAck> {
    let obj = value.get("order").or_else(|| value.get("data")).unwrap_or(value);
    let id = get_str(obj, &["id", "orderId", "order_id"])?;
    Some(OrderAck {
        id,
        order_number: get_str(obj, &["orderNumber", "order_number"]),
        token_number: get_i64(obj, &["tokenNumber", "token_number"]),
        total_amount: get_i64(obj, &["totalAmount"])
            .map(|v| v as f64)
            .or_else(|| obj.get("totalAmount").and_then(Value::as_f64))
            .or_else(|| obj.get("total_amount").and_then(Value::as_f64)),
    })
}

/// Serialize a record for the wire, camelCase, with the local id carried as
/// `clientOrderId` so the server can link its copy back to ours.
pub fn order_to_wire(record: &OrderRecord) -> Value {
    let order = &record.order;
    let items: Vec<Value> = record
        .items
        .iter()
        .map(|item| {
            let (food_item_id, buffet_id, combo_meal_id) = item.item_ref.as_columns();
            json!({
                "id": item.id,
                "foodItemId": food_item_id,
                "buffetId": buffet_id,
                "comboMealId": combo_meal_id,
                "name": item.name,
                "quantity": item.quantity,
                "unitPrice": item.unit_price,
                "subtotal": item.subtotal,
                "variation": item.variation,
                "addons": item.addons,
                "specialInstructions": item.special_instructions,
                "status": item.status.as_str(),
            })
        })
        .collect();

    json!({
        "clientOrderId": order.id,
        "orderNumber": order.order_number,
        "tenantId": order.tenant_id,
        "branchId": order.branch_id,
        "tableNumber": order.table_number,
        "customerName": order.customer_name,
        "orderType": order.order_type.as_str(),
        "status": order.status.as_str(),
        "paymentStatus": order.payment_status.as_str(),
        "subtotal": order.subtotal,
        "discountAmount": order.discount_amount,
        "taxAmount": order.tax_amount,
        "deliveryFee": order.delivery_fee,
        "totalAmount": order.total_amount,
        "specialInstructions": order.special_instructions,
        "orderDate": order.order_date,
        "createdAt": order.created_at,
        "updatedAt": order.updated_at,
        "items": items,
    })
}
