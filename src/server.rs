//! HTTP surface over the mail service
//!
//! Thin JSON routes under `/api`. Handlers parse query and path input, call
//! [`MailService`], and let [`AppError`] pick the status code. Paging input is
//! lenient: a missing or out-of-range `limit`/`page` falls back to the default.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use serde::Deserialize;

use crate::config::parse_bool_value;
use crate::errors::{AppError, AppResult};
use crate::mailbox::MailboxConnector;
use crate::models::{CredentialsUpdate, NewAccount};
use crate::service::{MAX_PAGE_LIMIT, MailService};

/// Default page size for message listings
const DEFAULT_MESSAGE_LIMIT: u32 = 12;
/// Default page size for account listings
const DEFAULT_ACCOUNT_LIMIT: u32 = 20;

const TOTAL_COUNT: HeaderName = HeaderName::from_static("x-total-count");

type Shared<C> = State<Arc<MailService<C>>>;

/// Build the router with all routes
pub fn router<C: MailboxConnector>(service: Arc<MailService<C>>) -> Router {
    Router::new()
        .route("/api/health", get(health::<C>))
        .route(
            "/api/imap/accounts",
            get(list_accounts::<C>).post(create_account::<C>),
        )
        .route("/api/imap/accounts/{id}", delete(delete_account::<C>))
        .route(
            "/api/imap/accounts/{id}/credentials",
            put(update_credentials::<C>),
        )
        .route("/api/imap/messages", get(list_messages::<C>))
        .route("/api/imap/messages/{uid}", get(get_message::<C>))
        .with_state(service)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageQuery {
    #[serde(default)]
    account_id: String,
    limit: Option<String>,
    page: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AccountQuery {
    limit: Option<String>,
    page: Option<String>,
    compact: Option<String>,
}

async fn health<C: MailboxConnector>(State(service): Shared<C>) -> AppResult<Response> {
    Ok(Json(service.health()?).into_response())
}

async fn list_accounts<C: MailboxConnector>(
    State(service): Shared<C>,
    Query(query): Query<AccountQuery>,
) -> AppResult<Response> {
    let limit = limit_or(query.limit.as_deref(), DEFAULT_ACCOUNT_LIMIT);
    let page = page_or_first(query.page.as_deref());
    let compact = query
        .compact
        .as_deref()
        .and_then(parse_bool_value)
        .unwrap_or(false);
    let listing = service.list_accounts(page, limit, compact)?;
    Ok(with_total(listing.total, Json(listing.accounts)))
}

async fn create_account<C: MailboxConnector>(
    State(service): Shared<C>,
    Json(input): Json<NewAccount>,
) -> AppResult<Response> {
    let info = service.register_account(input)?;
    Ok((StatusCode::CREATED, Json(info)).into_response())
}

async fn update_credentials<C: MailboxConnector>(
    State(service): Shared<C>,
    Path(id): Path<String>,
    Json(update): Json<CredentialsUpdate>,
) -> AppResult<StatusCode> {
    service.update_credentials(&id, update)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_account<C: MailboxConnector>(
    State(service): Shared<C>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    service.delete_account(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_messages<C: MailboxConnector>(
    State(service): Shared<C>,
    Query(query): Query<MessageQuery>,
) -> AppResult<Response> {
    let limit = limit_or(query.limit.as_deref(), DEFAULT_MESSAGE_LIMIT);
    let page = page_or_first(query.page.as_deref());
    let listing = service
        .list_messages(&query.account_id, limit, page)
        .await?;
    Ok(with_total(listing.total, Json(listing.messages)))
}

async fn get_message<C: MailboxConnector>(
    State(service): Shared<C>,
    Path(uid): Path<String>,
    Query(query): Query<MessageQuery>,
) -> AppResult<Response> {
    let uid = uid
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|&uid| uid > 0)
        .ok_or_else(|| AppError::invalid("uid must be a positive integer"))?;
    let message = service.get_message(&query.account_id, uid).await?;
    Ok(Json(message).into_response())
}

fn with_total(total: u64, body: impl IntoResponse) -> Response {
    let mut response = body.into_response();
    response
        .headers_mut()
        .insert(TOTAL_COUNT, HeaderValue::from(total));
    response
}

fn limit_or(raw: Option<&str>, default: u32) -> u32 {
    raw.and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|l| (1..=MAX_PAGE_LIMIT).contains(l))
        .unwrap_or(default)
}

fn page_or_first(raw: Option<&str>) -> u32 {
    raw.and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|&p| p > 0)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::Router;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::{limit_or, page_or_first, router};
    use crate::service::tests::{Fixture, fixture};
    use crate::testing::{FakeServer, TEST_PASSWORD};

    fn app() -> (Router, FakeServer, String) {
        let Fixture {
            server,
            service,
            account,
            ..
        } = fixture();
        (router(Arc::new(service)), server, account.id)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Option<String>, Value) {
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let total = response
            .headers()
            .get("x-total-count")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, total, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).expect("request")
    }

    fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn health_reports_accounts_and_cache() {
        let (app, _, _) = app();
        let (status, _, body) = send(&app, get("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["accounts"], 1);
        assert_eq!(body["listCache"]["ttlSeconds"], 30);
    }

    #[tokio::test]
    async fn message_listing_sets_total_header() {
        let (app, server, account_id) = app();
        server.append_messages(4);
        let uri = format!("/api/imap/messages?accountId={account_id}&limit=3&page=1");
        let (status, total, body) = send(&app, get(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(total.as_deref(), Some("4"));
        let items = body.as_array().expect("array");
        assert_eq!(items.len(), 3);
        assert_eq!(items[0]["uid"], server.max_uid());
        assert!(items[0]["snippet"].as_str().expect("snippet").contains("message"));
    }

    #[tokio::test]
    async fn message_detail_and_errors() {
        let (app, server, _) = app();
        server.append_messages(2);
        let uid = server.max_uid();

        let (status, _, body) = send(&app, get(&format!("/api/imap/messages/{uid}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["subject"], format!("message {uid}"));

        let (status, _, body) = send(&app, get("/api/imap/messages/abc")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_input");

        let (status, _, body) = send(&app, get("/api/imap/messages/4242")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");

        server.fail_connect(true);
        let (status, _, body) = send(&app, get("/api/imap/messages/4243")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "connection");
    }

    #[tokio::test]
    async fn account_lifecycle() {
        let (app, _, _) = app();
        let (status, _, created) = send(
            &app,
            json_request(
                "POST",
                "/api/imap/accounts",
                &json!({
                    "host": "imap.example.net",
                    "port": 143,
                    "username": "ops@example.net",
                    "password": TEST_PASSWORD,
                    "tlsMode": "starttls"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["tlsMode"], "starttls");
        assert!(created.get("password").is_none());
        let id = created["id"].as_str().expect("id").to_owned();

        let (status, total, listed) = send(&app, get("/api/imap/accounts?compact=yes")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(total.as_deref(), Some("2"));
        assert!(listed[0].get("lastUid").is_none());

        let (status, _, _) = send(
            &app,
            json_request(
                "PUT",
                &format!("/api/imap/accounts/{id}/credentials"),
                &json!({ "password": "rotated" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let delete = Request::delete(format!("/api/imap/accounts/{id}"))
            .body(Body::empty())
            .expect("request");
        let (status, _, _) = send(&app, delete).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let again = Request::delete(format!("/api/imap/accounts/{id}"))
            .body(Body::empty())
            .expect("request");
        let (status, _, _) = send(&app, again).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn registration_validation_maps_to_bad_request() {
        let (app, _, _) = app();
        let (status, _, body) = send(
            &app,
            json_request(
                "POST",
                "/api/imap/accounts",
                &json!({ "host": "bad host", "username": "u", "password": "p" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_input");
    }

    #[test]
    fn paging_input_is_lenient() {
        assert_eq!(limit_or(None, 12), 12);
        assert_eq!(limit_or(Some("25"), 12), 25);
        assert_eq!(limit_or(Some("0"), 12), 12);
        assert_eq!(limit_or(Some("101"), 12), 12);
        assert_eq!(limit_or(Some("ten"), 12), 12);
        assert_eq!(page_or_first(Some(" 3 ")), 3);
        assert_eq!(page_or_first(Some("-1")), 1);
    }
}
