use std::{collections::HashMap, convert::Infallible, env, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{DateTime, Duration as ChronoDuration, Months, Utc};
use futures_util::{Stream, StreamExt};
use rand::Rng;
use regex::Regex;
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use url::{Host, Url};
use uuid::Uuid;

use crate::line::{self, LineClient};
use crate::types::*;

const FALLBACK_SENDER_NAME: &str = "User";
const AUTO_REPLY_SENDER_NAME: &str = "Auto Reply";
const OUTBOUND_SENDER_NAME: &str = "Me";
const IMAGE_PLACEHOLDER: &str = "[รูปภาพ]";
const IMAGE_BLOCKED_PLACEHOLDER: &str = "[รูปภาพ - ไม่สามารถส่งได้]";
const IMAGE_BLOCKED_NOTICE: &str =
    "📷 [รูปภาพ]\n\n⚠️ ไม่สามารถส่งรูปได้เนื่องจากใช้ localhost";
const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "lineoa".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

fn sticker_placeholder(package_id: &str, sticker_id: &str) -> String {
    format!("[สติกเกอร์: {package_id}/{sticker_id}]")
}

#[derive(Debug)]
struct InboundContent {
    text: String,
    message_type: String,
    sticker_package_id: Option<String>,
    sticker_id: Option<String>,
}

fn classify_inbound(message: &line::EventMessage) -> InboundContent {
    match message.message_type.as_str() {
        "text" => InboundContent {
            text: message.text.clone().unwrap_or_default(),
            message_type: "text".to_string(),
            sticker_package_id: None,
            sticker_id: None,
        },
        "image" => InboundContent {
            text: IMAGE_PLACEHOLDER.to_string(),
            message_type: "image".to_string(),
            sticker_package_id: None,
            sticker_id: None,
        },
        "sticker" => {
            let package_id = message.package_id.clone().unwrap_or_default();
            let sticker_id = message.sticker_id.clone().unwrap_or_default();
            InboundContent {
                text: sticker_placeholder(&package_id, &sticker_id),
                message_type: "sticker".to_string(),
                sticker_package_id: Some(package_id),
                sticker_id: Some(sticker_id),
            }
        }
        other => InboundContent {
            text: format!("[{other}]"),
            message_type: other.to_string(),
            sticker_package_id: None,
            sticker_id: None,
        },
    }
}

fn rule_matches(keyword: &str, text: &str) -> bool {
    let keyword = keyword.trim();
    !keyword.is_empty() && text.to_lowercase().contains(&keyword.to_lowercase())
}

fn license_is_valid(expiry: Option<&str>) -> bool {
    expiry
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| Utc::now() < t.with_timezone(&Utc))
        .unwrap_or(false)
}

fn calculate_expiry(
    from: DateTime<Utc>,
    duration: &LicenseDuration,
) -> DateTime<Utc> {
    let mut expiry = from;
    if let Some(minutes) = duration.minutes {
        expiry += ChronoDuration::minutes(minutes as i64);
    }
    if let Some(days) = duration.days {
        expiry += ChronoDuration::days(days as i64);
    }
    let months = duration.months.unwrap_or(0) + duration.years.unwrap_or(0) * 12;
    if months > 0 {
        expiry = expiry
            .checked_add_months(Months::new(months as u32))
            .unwrap_or(expiry);
    }
    expiry
}

fn generate_license_key() -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::rng();
    (0..5)
        .map(|_| {
            (0..5)
                .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn valid_license_key_format(key: &str) -> bool {
    Regex::new(r"^[A-Z0-9]{5}(?:-[A-Z0-9]{5}){4}$")
        .map(|re| re.is_match(key.trim()))
        .unwrap_or(false)
}

fn resolve_image_url(public_base_url: &str, raw: &str) -> String {
    if raw.starts_with("http") {
        raw.to_string()
    } else {
        format!("{public_base_url}{raw}")
    }
}

/// The upstream provider fetches image URLs itself, so anything resolving to
/// a loopback or private host can never be delivered.
fn is_internal_image_url(raw: &str) -> bool {
    let Ok(url) = Url::parse(raw) else {
        return true;
    };
    if url.scheme() != "http" && url.scheme() != "https" {
        return true;
    }
    match url.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            domain == "localhost"
                || domain.ends_with(".localhost")
                || domain.ends_with(".local")
                || domain.ends_with(".internal")
        }
        Some(Host::Ipv4(ip)) => {
            ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
        }
        Some(Host::Ipv6(ip)) => {
            ip.is_loopback() || ip.is_unspecified() || (ip.segments()[0] & 0xfe00) == 0xfc00
        }
        None => true,
    }
}

fn is_safe_upload_file_name(file_name: &str) -> bool {
    !file_name.is_empty()
        && file_name.len() <= 120
        && !file_name.starts_with('.')
        && file_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !file_name.contains("..")
}

fn upload_content_type(extension: &str) -> Option<&'static str> {
    match extension {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

// ----- row parsing -----

fn parse_channel_row(row: sqlx::postgres::PgRow) -> Channel {
    Channel {
        id: row.get("id"),
        channel_secret: row.get("channel_secret"),
        channel_access_token: row.get("channel_access_token"),
        channel_name: row.get("channel_name"),
        color: row.get("color"),
        user_id: row.get("user_id"),
        created_at: row.get("created_at"),
    }
}

fn parse_message_row(row: sqlx::postgres::PgRow) -> StoredMessage {
    StoredMessage {
        id: row.get("id"),
        channel_id: row.get("channel_id"),
        channel_name: row.get("channel_name"),
        user_id: row.get("user_id"),
        user_name: row.get("user_name"),
        text: row.get("text"),
        message_type: row.get("message_type"),
        image_url: row.get("image_url"),
        sticker_package_id: row.get("sticker_package_id"),
        sticker_id: row.get("sticker_id"),
        timestamp: row.get("timestamp"),
        direction: row.get("direction"),
        is_read: row.get("is_read"),
        is_auto_reply: row.get("is_auto_reply"),
    }
}

fn parse_auto_reply_row(row: sqlx::postgres::PgRow) -> AutoReplyRule {
    AutoReplyRule {
        id: row.get("id"),
        keyword: row.get("keyword"),
        reply: row.get("reply"),
        user_id: row.get("user_id"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
    }
}

fn parse_agent_row(row: sqlx::postgres::PgRow) -> AgentSummary {
    AgentSummary {
        id: row.get("id"),
        name: row.get("name"),
        username: row.get("username"),
        user_id: row.get("user_id"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
    }
}

fn parse_license_row(row: sqlx::postgres::PgRow) -> License {
    License {
        id: row.get("id"),
        license_key: row.get("license_key"),
        duration_minutes: row.get("duration_minutes"),
        duration_days: row.get("duration_days"),
        duration_months: row.get("duration_months"),
        duration_years: row.get("duration_years"),
        status: row.get("status"),
        activated_by: row.get("activated_by"),
        activated_at: row.get("activated_at"),
        expires_at: row.get("expires_at"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
    }
}

fn parse_user_summary_row(row: sqlx::postgres::PgRow) -> UserSummary {
    let license_expiry: Option<String> = row.get("license_expiry");
    UserSummary {
        id: row.get("id"),
        username: row.get("username"),
        role: row.get("role"),
        license_key: row.get("license_key"),
        is_license_valid: license_is_valid(license_expiry.as_deref()),
        license_expiry,
        created_at: row.get("created_at"),
    }
}

// ----- shared persistence helpers -----

async fn find_channel_by_id(pool: &PgPool, channel_id: &str) -> Option<Channel> {
    let row = sqlx::query(
        "SELECT id, channel_secret, channel_access_token, channel_name, color, user_id, created_at \
         FROM channels WHERE id = $1",
    )
    .bind(channel_id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()?;
    Some(parse_channel_row(row))
}

async fn insert_message(pool: &PgPool, message: &StoredMessage) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO messages (
            id, channel_id, channel_name, user_id, user_name, text, message_type,
            image_url, sticker_package_id, sticker_id, timestamp, direction, is_read, is_auto_reply
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
        "#,
    )
    .bind(&message.id)
    .bind(&message.channel_id)
    .bind(&message.channel_name)
    .bind(&message.user_id)
    .bind(&message.user_name)
    .bind(&message.text)
    .bind(&message.message_type)
    .bind(&message.image_url)
    .bind(&message.sticker_package_id)
    .bind(&message.sticker_id)
    .bind(message.timestamp)
    .bind(&message.direction)
    .bind(message.is_read)
    .bind(message.is_auto_reply)
    .execute(pool)
    .await
    .map(|_| ())
}

/// First active rule (storage order) whose keyword is a case-insensitive
/// substring of the text. No priority ordering beyond insertion order.
async fn match_auto_reply(pool: &PgPool, owner_user_id: &str, text: &str) -> Option<AutoReplyRule> {
    let rows = sqlx::query(
        "SELECT id, keyword, reply, user_id, is_active, created_at \
         FROM auto_replies WHERE user_id = $1 AND is_active = TRUE \
         ORDER BY created_at ASC",
    )
    .bind(owner_user_id)
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    rows.into_iter()
        .map(parse_auto_reply_row)
        .find(|rule| rule_matches(&rule.keyword, text))
}

async fn require_admin(pool: &PgPool, admin_user_id: &str) -> bool {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM users WHERE id = $1 AND role = 'admin'")
        .bind(admin_user_id)
        .fetch_one(pool)
        .await
        .unwrap_or(0)
        > 0
}

async fn issue_auth_token(pool: &PgPool, account_id: &str, account_kind: &str) -> Option<String> {
    let token = Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        "INSERT INTO auth_tokens (token, account_id, account_kind, created_at) VALUES ($1,$2,$3,$4)",
    )
    .bind(&token)
    .bind(account_id)
    .bind(account_kind)
    .bind(now_iso())
    .execute(pool)
    .await
    .is_ok();
    if inserted {
        Some(token)
    } else {
        None
    }
}

// ----- core pipeline: webhook ingestion -----

async fn line_webhook_event(
    Path(channel_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(channel) = find_channel_by_id(&state.db, &channel_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Channel not found" })),
        )
            .into_response();
    };

    let signature = headers
        .get("x-line-signature")
        .and_then(|v| v.to_str().ok());
    if !line::verify_line_signature(&channel.channel_secret, signature, &body) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid webhook signature" })),
        )
            .into_response();
    }

    let payload = serde_json::from_slice::<line::WebhookBody>(&body).unwrap_or_default();
    let client = LineClient::new(state.http.clone(), channel.channel_access_token.clone());

    for event in payload.events {
        if event.event_type != "message" {
            continue;
        }
        let Some(event_message) = event.message.as_ref() else {
            continue;
        };
        let Some(external_user_id) = event.source.user_id.clone() else {
            continue;
        };

        // Profile lookup failure must never abort the event.
        let user_name = match client.get_profile(&external_user_id).await {
            Ok(profile) => profile.display_name,
            Err(err) => {
                warn!("[webhook] profile lookup failed for {external_user_id}: {err}");
                FALLBACK_SENDER_NAME.to_string()
            }
        };

        let content = classify_inbound(event_message);
        let inbound = StoredMessage {
            id: Uuid::new_v4().to_string(),
            channel_id: channel.id.clone(),
            channel_name: channel.channel_name.clone(),
            user_id: external_user_id,
            user_name,
            text: content.text.clone(),
            message_type: content.message_type.clone(),
            image_url: None,
            sticker_package_id: content.sticker_package_id,
            sticker_id: content.sticker_id,
            timestamp: event.timestamp,
            direction: "received".to_string(),
            is_read: false,
            is_auto_reply: false,
        };

        // A failed insert loses this event but must not abort siblings or the
        // webhook response; an error status would trigger provider retries and
        // duplicate the rows that did persist.
        if let Err(err) = insert_message(&state.db, &inbound).await {
            error!("[webhook] failed to persist inbound message: {err}");
            continue;
        }

        // Broadcast before auto-reply evaluation so the inbox is not blocked
        // on auto-reply latency.
        state.broadcaster.broadcast_new_message(&inbound);

        if inbound.message_type != "text" {
            continue;
        }
        let Some(rule) = match_auto_reply(&state.db, &channel.user_id, &inbound.text).await else {
            continue;
        };
        let Some(reply_token) = event.reply_token.as_deref() else {
            continue;
        };
        info!("[webhook] auto reply triggered for keyword {:?}", rule.keyword);

        match client
            .reply_message(reply_token, &line::text_message(&rule.reply))
            .await
        {
            Ok(()) => {
                let reply = StoredMessage {
                    id: Uuid::new_v4().to_string(),
                    channel_id: channel.id.clone(),
                    channel_name: channel.channel_name.clone(),
                    user_id: inbound.user_id.clone(),
                    user_name: AUTO_REPLY_SENDER_NAME.to_string(),
                    text: rule.reply.clone(),
                    message_type: "text".to_string(),
                    image_url: None,
                    sticker_package_id: None,
                    sticker_id: None,
                    timestamp: now_ms(),
                    direction: "sent".to_string(),
                    is_read: true,
                    is_auto_reply: true,
                };
                match insert_message(&state.db, &reply).await {
                    Ok(()) => state.broadcaster.broadcast_new_message(&reply),
                    Err(err) => error!("[webhook] failed to persist auto reply: {err}"),
                }
            }
            Err(err) => warn!("[webhook] auto reply delivery failed: {err}"),
        }
    }

    (StatusCode::OK, Json(json!({ "success": true }))).into_response()
}

// ----- core pipeline: live viewer stream -----

async fn message_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let viewer = state.broadcaster.viewer();
    let stream = viewer.map(|payload| Ok::<_, Infallible>(Event::default().data(payload)));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

// ----- core pipeline: outbound send -----

async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessageBody>,
) -> impl IntoResponse {
    let Some(channel) = find_channel_by_id(&state.db, &body.channel_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "message": "Channel not found" })),
        )
            .into_response();
    };

    // Admin role bypasses license validity everywhere in the outbound path.
    if let Some(sender_id) = body.sender_id.as_deref().filter(|v| !v.is_empty()) {
        let sender = sqlx::query("SELECT role, license_expiry FROM users WHERE id = $1")
            .bind(sender_id)
            .fetch_optional(&state.db)
            .await
            .ok()
            .flatten();
        if let Some(row) = sender {
            let role: String = row.get("role");
            if role != "admin" {
                let expiry: Option<String> = row.get("license_expiry");
                if !license_is_valid(expiry.as_deref()) {
                    return (
                        StatusCode::FORBIDDEN,
                        Json(json!({
                            "success": false,
                            "message": "License expired",
                            "code": "LICENSE_EXPIRED"
                        })),
                    )
                        .into_response();
                }
            }
        }
    }

    let client = LineClient::new(state.http.clone(), channel.channel_access_token.clone());
    let message_type = body
        .message_type
        .clone()
        .unwrap_or_else(|| "text".to_string());

    let mut display_text = body.text.clone();
    let payload: Value;
    match message_type.as_str() {
        "image" if body.image_url.as_deref().is_some_and(|u| !u.is_empty()) => {
            let full_url =
                resolve_image_url(&state.public_base_url, body.image_url.as_deref().unwrap_or(""));
            if is_internal_image_url(&full_url) {
                payload = line::text_message(IMAGE_BLOCKED_NOTICE);
                display_text = IMAGE_BLOCKED_PLACEHOLDER.to_string();
            } else {
                payload = line::image_message(&full_url);
                display_text = IMAGE_PLACEHOLDER.to_string();
            }
        }
        "sticker"
            if body.sticker_package_id.as_deref().is_some_and(|v| !v.is_empty())
                && body.sticker_id.as_deref().is_some_and(|v| !v.is_empty()) =>
        {
            let package_id = body.sticker_package_id.as_deref().unwrap_or("");
            let sticker_id = body.sticker_id.as_deref().unwrap_or("");
            payload = line::sticker_message(package_id, sticker_id);
            display_text = sticker_placeholder(package_id, sticker_id);
        }
        _ => {
            payload = line::text_message(&body.text);
        }
    }

    if let Err(err) = client.push_message(&body.user_id, &payload).await {
        error!("[send] push delivery failed: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "message": "Failed to send message" })),
        )
            .into_response();
    }

    let message = StoredMessage {
        id: Uuid::new_v4().to_string(),
        channel_id: channel.id.clone(),
        channel_name: channel.channel_name.clone(),
        user_id: body.user_id.clone(),
        user_name: OUTBOUND_SENDER_NAME.to_string(),
        text: display_text,
        message_type,
        image_url: body.image_url.clone(),
        sticker_package_id: body.sticker_package_id.clone(),
        sticker_id: body.sticker_id.clone(),
        timestamp: now_ms(),
        direction: "sent".to_string(),
        is_read: true,
        is_auto_reply: false,
    };
    if let Err(err) = insert_message(&state.db, &message).await {
        error!("[send] failed to persist sent message: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "message": "Failed to send message" })),
        )
            .into_response();
    }

    state.broadcaster.broadcast_new_message(&message);

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "Message sent successfully",
            "data": message
        })),
    )
        .into_response()
}

// ----- auth -----

async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> impl IntoResponse {
    let row = sqlx::query(
        "SELECT id, username, password_hash, role, license_key, license_expiry, created_at \
         FROM users WHERE username = $1",
    )
    .bind(&body.username)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();

    if let Some(row) = row {
        let password_hash: String = row.get("password_hash");
        if verify(&body.password, &password_hash).unwrap_or(false) {
            let user = parse_user_summary_row(row);
            let Some(token) = issue_auth_token(&state.db, &user.id, "user").await else {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "success": false, "message": "Server error" })),
                )
                    .into_response();
            };
            return (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "token": token,
                    "user": user,
                    "message": "Login successful"
                })),
            )
                .into_response();
        }
    }

    let agent_row = sqlx::query(
        "SELECT id, username, password_hash, user_id, created_at \
         FROM agents WHERE username = $1 AND is_active = TRUE",
    )
    .bind(&body.username)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();

    if let Some(row) = agent_row {
        let password_hash: String = row.get("password_hash");
        if verify(&body.password, &password_hash).unwrap_or(false) {
            let agent_id: String = row.get("id");
            let Some(token) = issue_auth_token(&state.db, &agent_id, "agent").await else {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "success": false, "message": "Server error" })),
                )
                    .into_response();
            };
            return (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "token": token,
                    "user": {
                        "id": agent_id,
                        "username": row.get::<String, _>("username"),
                        "role": "agent",
                        "ownerId": row.get::<String, _>("user_id"),
                        "licenseExpiry": Value::Null,
                        "isLicenseValid": true,
                        "createdAt": row.get::<String, _>("created_at"),
                    },
                    "message": "Login successful"
                })),
            )
                .into_response();
        }
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "success": false, "message": "Invalid username or password" })),
    )
        .into_response()
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> impl IntoResponse {
    if body.username.trim().is_empty() || body.password.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "Username and password are required" })),
        )
            .into_response();
    }
    if body.username.len() < 3 || body.password.len() < 6 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "Username >= 3 chars, Password >= 6 chars" })),
        )
            .into_response();
    }

    let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM users WHERE username = $1")
        .bind(&body.username)
        .fetch_one(&state.db)
        .await
        .unwrap_or(0)
        > 0;
    if exists {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "Username already exists" })),
        )
            .into_response();
    }

    let Ok(password_hash) = hash(&body.password, DEFAULT_COST) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "message": "Server error" })),
        )
            .into_response();
    };

    let user_id = Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        "INSERT INTO users (id, username, password_hash, role, created_at) VALUES ($1,$2,$3,'user',$4)",
    )
    .bind(&user_id)
    .bind(&body.username)
    .bind(&password_hash)
    .bind(now_iso())
    .execute(&state.db)
    .await
    .is_ok();

    if !inserted {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "message": "Server error" })),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "Registration successful",
            "user": { "id": user_id, "username": body.username, "role": "user" }
        })),
    )
        .into_response()
}

// ----- channels -----

async fn get_channels(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let user_id = params.get("userId").cloned().unwrap_or_default();
    let agent_id = params.get("agentId").cloned().unwrap_or_default();
    if user_id.is_empty() && agent_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "User ID or Agent ID is required" })),
        )
            .into_response();
    }

    let rows = if !agent_id.is_empty() {
        sqlx::query(
            "SELECT c.id, c.channel_secret, c.channel_access_token, c.channel_name, c.color, c.user_id, c.created_at \
             FROM channels c \
             INNER JOIN agent_channels ac ON c.id = ac.channel_id \
             WHERE ac.agent_id = $1 \
             ORDER BY c.created_at DESC",
        )
        .bind(&agent_id)
        .fetch_all(&state.db)
        .await
    } else {
        sqlx::query(
            "SELECT id, channel_secret, channel_access_token, channel_name, color, user_id, created_at \
             FROM channels WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(&user_id)
        .fetch_all(&state.db)
        .await
    }
    .unwrap_or_default();

    let channels = rows.into_iter().map(parse_channel_row).collect::<Vec<_>>();
    (
        StatusCode::OK,
        Json(json!({ "success": true, "channels": channels })),
    )
        .into_response()
}

async fn create_channel(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateChannelBody>,
) -> impl IntoResponse {
    if body.channel_secret.is_empty() || body.channel_access_token.is_empty() || body.user_id.is_empty()
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "Missing required fields" })),
        )
            .into_response();
    }

    let channel_id = Uuid::new_v4().to_string();
    let channel_name = body
        .channel_name
        .clone()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| format!("LINE Channel {channel_id}"));

    let inserted = sqlx::query(
        "INSERT INTO channels (id, channel_secret, channel_access_token, channel_name, color, user_id, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7)",
    )
    .bind(&channel_id)
    .bind(&body.channel_secret)
    .bind(&body.channel_access_token)
    .bind(&channel_name)
    .bind(&body.color)
    .bind(&body.user_id)
    .bind(now_iso())
    .execute(&state.db)
    .await
    .is_ok();

    if !inserted {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "message": "Server error" })),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "Channel added successfully",
            "channel": { "id": channel_id }
        })),
    )
        .into_response()
}

async fn delete_channel(
    Path(channel_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let user_id = params.get("userId").cloned().unwrap_or_default();
    if user_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "User ID is required" })),
        )
            .into_response();
    }

    let owned =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM channels WHERE id = $1 AND user_id = $2")
            .bind(&channel_id)
            .bind(&user_id)
            .fetch_one(&state.db)
            .await
            .unwrap_or(0)
            > 0;
    if !owned {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "message": "Channel not found or no permission" })),
        )
            .into_response();
    }

    // Cascades remove agent channel assignments; message history stays.
    let _ = sqlx::query("DELETE FROM channels WHERE id = $1")
        .bind(&channel_id)
        .execute(&state.db)
        .await;

    (
        StatusCode::OK,
        Json(json!({ "success": true, "message": "Channel removed successfully" })),
    )
        .into_response()
}

// ----- message listing / read state -----

async fn get_messages(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let user_id = params.get("userId").cloned().unwrap_or_default();
    let agent_id = params.get("agentId").cloned().unwrap_or_default();
    if user_id.is_empty() && agent_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "User ID or Agent ID is required" })),
        )
            .into_response();
    }

    let rows = if !agent_id.is_empty() {
        sqlx::query(
            "SELECT m.id, m.channel_id, m.channel_name, m.user_id, m.user_name, m.text, m.message_type, \
                    m.image_url, m.sticker_package_id, m.sticker_id, m.timestamp, m.direction, m.is_read, m.is_auto_reply \
             FROM messages m \
             INNER JOIN agent_channels ac ON m.channel_id = ac.channel_id \
             WHERE ac.agent_id = $1 \
             ORDER BY m.timestamp ASC",
        )
        .bind(&agent_id)
        .fetch_all(&state.db)
        .await
    } else {
        sqlx::query(
            "SELECT m.id, m.channel_id, m.channel_name, m.user_id, m.user_name, m.text, m.message_type, \
                    m.image_url, m.sticker_package_id, m.sticker_id, m.timestamp, m.direction, m.is_read, m.is_auto_reply \
             FROM messages m \
             INNER JOIN channels c ON m.channel_id = c.id \
             WHERE c.user_id = $1 \
             ORDER BY m.timestamp ASC",
        )
        .bind(&user_id)
        .fetch_all(&state.db)
        .await
    }
    .unwrap_or_default();

    let messages = rows.into_iter().map(parse_message_row).collect::<Vec<_>>();
    (
        StatusCode::OK,
        Json(json!({ "success": true, "messages": messages })),
    )
        .into_response()
}

async fn mark_messages_read(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MarkReadBody>,
) -> impl IntoResponse {
    // is_read only ever transitions false -> true, and only on received rows.
    let result = if let Some(channel_id) = body.channel_id.as_deref().filter(|v| !v.is_empty()) {
        sqlx::query(
            "UPDATE messages SET is_read = TRUE \
             WHERE user_id = $1 AND channel_id = $2 AND direction = 'received' AND is_read = FALSE",
        )
        .bind(&body.user_id)
        .bind(channel_id)
        .execute(&state.db)
        .await
    } else {
        sqlx::query(
            "UPDATE messages SET is_read = TRUE \
             WHERE user_id = $1 AND direction = 'received' AND is_read = FALSE",
        )
        .bind(&body.user_id)
        .execute(&state.db)
        .await
    };

    if result.is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "message": "Server error" })),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(json!({ "success": true, "message": "Messages marked as read" })),
    )
        .into_response()
}

// ----- agents -----

async fn get_agents(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let user_id = params.get("userId").cloned().unwrap_or_default();
    if user_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "User ID is required" })),
        )
            .into_response();
    }

    let rows = sqlx::query(
        "SELECT id, name, username, user_id, is_active, created_at \
         FROM agents WHERE user_id = $1 ORDER BY created_at DESC",
    )
    .bind(&user_id)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();

    let agents = rows.into_iter().map(parse_agent_row).collect::<Vec<_>>();
    (
        StatusCode::OK,
        Json(json!({ "success": true, "agents": agents })),
    )
        .into_response()
}

async fn create_agent(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateAgentBody>,
) -> impl IntoResponse {
    if body.username.is_empty() || body.password.is_empty() || body.user_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "Missing required fields" })),
        )
            .into_response();
    }

    let user_taken = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM users WHERE username = $1")
        .bind(&body.username)
        .fetch_one(&state.db)
        .await
        .unwrap_or(0)
        > 0;
    let agent_taken = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM agents WHERE username = $1")
        .bind(&body.username)
        .fetch_one(&state.db)
        .await
        .unwrap_or(0)
        > 0;
    if user_taken || agent_taken {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "Username already exists" })),
        )
            .into_response();
    }

    let Ok(password_hash) = hash(&body.password, DEFAULT_COST) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "message": "Server error" })),
        )
            .into_response();
    };

    let agent_id = Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        "INSERT INTO agents (id, name, username, password_hash, user_id, is_active, created_at) \
         VALUES ($1,$2,$3,$4,$5,TRUE,$6)",
    )
    .bind(&agent_id)
    .bind(&body.name)
    .bind(&body.username)
    .bind(&password_hash)
    .bind(&body.user_id)
    .bind(now_iso())
    .execute(&state.db)
    .await
    .is_ok();

    if !inserted {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "message": "Server error" })),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "Agent created successfully",
            "agent": { "id": agent_id }
        })),
    )
        .into_response()
}

async fn agent_owned_by(pool: &PgPool, agent_id: &str, user_id: &str) -> bool {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM agents WHERE id = $1 AND user_id = $2")
        .bind(agent_id)
        .bind(user_id)
        .fetch_one(pool)
        .await
        .unwrap_or(0)
        > 0
}

async fn update_agent(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateAgentBody>,
) -> impl IntoResponse {
    if !agent_owned_by(&state.db, &agent_id, &body.user_id).await {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "message": "Agent not found or no permission" })),
        )
            .into_response();
    }

    if let Some(name) = &body.name {
        let _ = sqlx::query("UPDATE agents SET name = $1 WHERE id = $2")
            .bind(name)
            .bind(&agent_id)
            .execute(&state.db)
            .await;
    }
    if let Some(username) = &body.username {
        let _ = sqlx::query("UPDATE agents SET username = $1 WHERE id = $2")
            .bind(username)
            .bind(&agent_id)
            .execute(&state.db)
            .await;
    }
    if let Some(password) = body.password.as_deref().filter(|v| !v.is_empty()) {
        if let Ok(password_hash) = hash(password, DEFAULT_COST) {
            let _ = sqlx::query("UPDATE agents SET password_hash = $1 WHERE id = $2")
                .bind(&password_hash)
                .bind(&agent_id)
                .execute(&state.db)
                .await;
        }
    }
    if let Some(is_active) = body.is_active {
        let _ = sqlx::query("UPDATE agents SET is_active = $1 WHERE id = $2")
            .bind(is_active)
            .bind(&agent_id)
            .execute(&state.db)
            .await;
    }

    (
        StatusCode::OK,
        Json(json!({ "success": true, "message": "Agent updated successfully" })),
    )
        .into_response()
}

async fn delete_agent(
    Path(agent_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let user_id = params.get("userId").cloned().unwrap_or_default();
    if !agent_owned_by(&state.db, &agent_id, &user_id).await {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "message": "Agent not found or no permission" })),
        )
            .into_response();
    }

    let _ = sqlx::query("DELETE FROM agents WHERE id = $1")
        .bind(&agent_id)
        .execute(&state.db)
        .await;

    (
        StatusCode::OK,
        Json(json!({ "success": true, "message": "Agent deleted successfully" })),
    )
        .into_response()
}

async fn get_agent_channels(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let channel_ids = sqlx::query_scalar::<_, String>(
        "SELECT channel_id FROM agent_channels WHERE agent_id = $1",
    )
    .bind(&agent_id)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();

    (
        StatusCode::OK,
        Json(json!({ "success": true, "channelIds": channel_ids })),
    )
        .into_response()
}

async fn set_agent_channels(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AssignChannelsBody>,
) -> impl IntoResponse {
    if !agent_owned_by(&state.db, &agent_id, &body.user_id).await {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "message": "Agent not found" })),
        )
            .into_response();
    }

    let _ = sqlx::query("DELETE FROM agent_channels WHERE agent_id = $1")
        .bind(&agent_id)
        .execute(&state.db)
        .await;
    for channel_id in &body.channel_ids {
        let _ = sqlx::query("INSERT INTO agent_channels (agent_id, channel_id) VALUES ($1,$2)")
            .bind(&agent_id)
            .bind(channel_id)
            .execute(&state.db)
            .await;
    }

    (
        StatusCode::OK,
        Json(json!({ "success": true, "message": "Channels assigned successfully" })),
    )
        .into_response()
}

// ----- auto replies -----

async fn get_auto_replies(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let user_id = params.get("userId").cloned().unwrap_or_default();
    if user_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "User ID is required" })),
        )
            .into_response();
    }

    let rows = sqlx::query(
        "SELECT id, keyword, reply, user_id, is_active, created_at \
         FROM auto_replies WHERE user_id = $1 ORDER BY created_at DESC",
    )
    .bind(&user_id)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();

    let auto_replies = rows.into_iter().map(parse_auto_reply_row).collect::<Vec<_>>();
    (
        StatusCode::OK,
        Json(json!({ "success": true, "autoReplies": auto_replies })),
    )
        .into_response()
}

async fn create_auto_reply(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateAutoReplyBody>,
) -> impl IntoResponse {
    if body.keyword.is_empty() || body.reply.is_empty() || body.user_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "Missing required fields" })),
        )
            .into_response();
    }

    let rule_id = Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        "INSERT INTO auto_replies (id, keyword, reply, user_id, is_active, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6)",
    )
    .bind(&rule_id)
    .bind(&body.keyword)
    .bind(&body.reply)
    .bind(&body.user_id)
    .bind(body.is_active.unwrap_or(true))
    .bind(now_iso())
    .execute(&state.db)
    .await
    .is_ok();

    if !inserted {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "message": "Server error" })),
        )
            .into_response();
    }

    info!("[auto-reply] rule created: {:?} -> {:?}", body.keyword, body.reply);
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "Auto reply created successfully",
            "autoReply": { "id": rule_id }
        })),
    )
        .into_response()
}

async fn auto_reply_owned_by(pool: &PgPool, rule_id: &str, user_id: &str) -> bool {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM auto_replies WHERE id = $1 AND user_id = $2")
        .bind(rule_id)
        .bind(user_id)
        .fetch_one(pool)
        .await
        .unwrap_or(0)
        > 0
}

async fn update_auto_reply(
    Path(rule_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateAutoReplyBody>,
) -> impl IntoResponse {
    if !auto_reply_owned_by(&state.db, &rule_id, &body.user_id).await {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "message": "Auto reply not found or no permission" })),
        )
            .into_response();
    }

    if let Some(keyword) = &body.keyword {
        let _ = sqlx::query("UPDATE auto_replies SET keyword = $1 WHERE id = $2")
            .bind(keyword)
            .bind(&rule_id)
            .execute(&state.db)
            .await;
    }
    if let Some(reply) = &body.reply {
        let _ = sqlx::query("UPDATE auto_replies SET reply = $1 WHERE id = $2")
            .bind(reply)
            .bind(&rule_id)
            .execute(&state.db)
            .await;
    }
    if let Some(is_active) = body.is_active {
        let _ = sqlx::query("UPDATE auto_replies SET is_active = $1 WHERE id = $2")
            .bind(is_active)
            .bind(&rule_id)
            .execute(&state.db)
            .await;
    }

    (
        StatusCode::OK,
        Json(json!({ "success": true, "message": "Auto reply updated successfully" })),
    )
        .into_response()
}

async fn delete_auto_reply(
    Path(rule_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let user_id = params.get("userId").cloned().unwrap_or_default();
    if !auto_reply_owned_by(&state.db, &rule_id, &user_id).await {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "message": "Auto reply not found or no permission" })),
        )
            .into_response();
    }

    let _ = sqlx::query("DELETE FROM auto_replies WHERE id = $1")
        .bind(&rule_id)
        .execute(&state.db)
        .await;

    (
        StatusCode::OK,
        Json(json!({ "success": true, "message": "Auto reply deleted successfully" })),
    )
        .into_response()
}

async fn toggle_auto_reply(
    Path(rule_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ToggleAutoReplyBody>,
) -> impl IntoResponse {
    let row = sqlx::query("SELECT is_active FROM auto_replies WHERE id = $1 AND user_id = $2")
        .bind(&rule_id)
        .bind(&body.user_id)
        .fetch_optional(&state.db)
        .await
        .ok()
        .flatten();
    let Some(row) = row else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "message": "Auto reply not found or no permission" })),
        )
            .into_response();
    };

    let new_status = !row.get::<bool, _>("is_active");
    let _ = sqlx::query("UPDATE auto_replies SET is_active = $1 WHERE id = $2")
        .bind(new_status)
        .bind(&rule_id)
        .execute(&state.db)
        .await;

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "Auto reply status toggled",
            "isActive": new_status
        })),
    )
        .into_response()
}

// ----- conversation groups -----

async fn get_groups(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let user_id = params.get("userId").cloned().unwrap_or_default();
    if user_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "User ID is required" })),
        )
            .into_response();
    }

    let rows = sqlx::query(
        "SELECT id, name, user_id, created_at, updated_at \
         FROM conversation_groups WHERE user_id = $1 ORDER BY updated_at DESC",
    )
    .bind(&user_id)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();

    let mut groups = Vec::with_capacity(rows.len());
    for row in rows {
        let group_id: String = row.get("id");
        let conversation_rows = sqlx::query(
            "SELECT user_id, channel_id FROM group_conversations WHERE group_id = $1",
        )
        .bind(&group_id)
        .fetch_all(&state.db)
        .await
        .unwrap_or_default();
        let conversations = conversation_rows
            .into_iter()
            .map(|conv| GroupConversation {
                user_id: conv.get("user_id"),
                channel_id: conv.get("channel_id"),
            })
            .collect::<Vec<_>>();
        groups.push(ConversationGroup {
            id: group_id,
            name: row.get("name"),
            user_id: row.get("user_id"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            conversations,
        });
    }

    (
        StatusCode::OK,
        Json(json!({ "success": true, "groups": groups })),
    )
        .into_response()
}

async fn create_group(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateGroupBody>,
) -> impl IntoResponse {
    if body.name.is_empty() || body.user_id.is_empty() || body.conversations.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "Missing required fields" })),
        )
            .into_response();
    }

    let group_id = Uuid::new_v4().to_string();
    let now = now_iso();
    let inserted = sqlx::query(
        "INSERT INTO conversation_groups (id, name, user_id, created_at, updated_at) VALUES ($1,$2,$3,$4,$5)",
    )
    .bind(&group_id)
    .bind(&body.name)
    .bind(&body.user_id)
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await
    .is_ok();

    if !inserted {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "message": "Server error" })),
        )
            .into_response();
    }

    for conv in &body.conversations {
        let _ = sqlx::query(
            "INSERT INTO group_conversations (group_id, user_id, channel_id) VALUES ($1,$2,$3)",
        )
        .bind(&group_id)
        .bind(&conv.user_id)
        .bind(&conv.channel_id)
        .execute(&state.db)
        .await;
    }

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "Group created successfully",
            "group": { "id": group_id }
        })),
    )
        .into_response()
}

async fn group_owned_by(pool: &PgPool, group_id: &str, user_id: &str) -> bool {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(1) FROM conversation_groups WHERE id = $1 AND user_id = $2",
    )
    .bind(group_id)
    .bind(user_id)
    .fetch_one(pool)
    .await
    .unwrap_or(0)
        > 0
}

async fn update_group(
    Path(group_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateGroupBody>,
) -> impl IntoResponse {
    if !group_owned_by(&state.db, &group_id, &body.user_id).await {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "message": "Group not found or no permission" })),
        )
            .into_response();
    }

    if let Some(name) = body.name.as_deref().filter(|v| !v.is_empty()) {
        let _ = sqlx::query(
            "UPDATE conversation_groups SET name = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(name)
        .bind(now_iso())
        .bind(&group_id)
        .execute(&state.db)
        .await;
    }

    if let Some(conversations) = &body.conversations {
        let _ = sqlx::query("DELETE FROM group_conversations WHERE group_id = $1")
            .bind(&group_id)
            .execute(&state.db)
            .await;
        for conv in conversations {
            let _ = sqlx::query(
                "INSERT INTO group_conversations (group_id, user_id, channel_id) VALUES ($1,$2,$3)",
            )
            .bind(&group_id)
            .bind(&conv.user_id)
            .bind(&conv.channel_id)
            .execute(&state.db)
            .await;
        }
    }

    (
        StatusCode::OK,
        Json(json!({ "success": true, "message": "Group updated successfully" })),
    )
        .into_response()
}

async fn delete_group(
    Path(group_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let user_id = params.get("userId").cloned().unwrap_or_default();
    if !group_owned_by(&state.db, &group_id, &user_id).await {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "message": "Group not found or no permission" })),
        )
            .into_response();
    }

    // Cascade removes group_conversations rows.
    let _ = sqlx::query("DELETE FROM conversation_groups WHERE id = $1")
        .bind(&group_id)
        .execute(&state.db)
        .await;

    (
        StatusCode::OK,
        Json(json!({ "success": true, "message": "Group deleted successfully" })),
    )
        .into_response()
}

// ----- licenses -----

async fn generate_license(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GenerateLicenseBody>,
) -> impl IntoResponse {
    if !require_admin(&state.db, &body.admin_user_id).await {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "success": false, "message": "Access denied. Admin only." })),
        )
            .into_response();
    }

    let duration = body.duration.unwrap_or_default();
    if duration.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "Duration is required" })),
        )
            .into_response();
    }

    let license_key = generate_license_key();
    let expires_at = calculate_expiry(Utc::now(), &duration).to_rfc3339();
    let license_id = Uuid::new_v4().to_string();

    let inserted = sqlx::query(
        "INSERT INTO licenses (id, license_key, duration_minutes, duration_days, duration_months, duration_years, \
                               status, expires_at, created_by, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,'unused',$7,$8,$9)",
    )
    .bind(&license_id)
    .bind(&license_key)
    .bind(duration.minutes)
    .bind(duration.days)
    .bind(duration.months)
    .bind(duration.years)
    .bind(&expires_at)
    .bind(&body.admin_user_id)
    .bind(now_iso())
    .execute(&state.db)
    .await
    .is_ok();

    if !inserted {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "message": "Server error" })),
        )
            .into_response();
    }

    info!("[license] generated {license_key}");
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "License generated successfully",
            "license": { "id": license_id, "key": license_key, "expiresAt": expires_at }
        })),
    )
        .into_response()
}

async fn get_licenses(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let admin_user_id = params.get("adminUserId").cloned().unwrap_or_default();
    if !require_admin(&state.db, &admin_user_id).await {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "success": false, "message": "Access denied. Admin only." })),
        )
            .into_response();
    }

    let rows = sqlx::query(
        "SELECT id, license_key, duration_minutes, duration_days, duration_months, duration_years, \
                status, activated_by, activated_at, expires_at, created_by, created_at \
         FROM licenses ORDER BY created_at DESC",
    )
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();

    let licenses = rows.into_iter().map(parse_license_row).collect::<Vec<_>>();
    (
        StatusCode::OK,
        Json(json!({ "success": true, "licenses": licenses })),
    )
        .into_response()
}

async fn delete_license(
    Path(license_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AdminActionBody>,
) -> impl IntoResponse {
    if !require_admin(&state.db, &body.admin_user_id).await {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "success": false, "message": "Access denied. Admin only." })),
        )
            .into_response();
    }

    let row = sqlx::query("SELECT license_key FROM licenses WHERE id = $1")
        .bind(&license_id)
        .fetch_optional(&state.db)
        .await
        .ok()
        .flatten();
    let Some(row) = row else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "message": "License not found" })),
        )
            .into_response();
    };

    let _ = sqlx::query("DELETE FROM licenses WHERE id = $1")
        .bind(&license_id)
        .execute(&state.db)
        .await;

    info!("[license] deleted {}", row.get::<String, _>("license_key"));
    (
        StatusCode::OK,
        Json(json!({ "success": true, "message": "License deleted successfully" })),
    )
        .into_response()
}

async fn activate_license(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ActivateLicenseBody>,
) -> impl IntoResponse {
    let license_key = body.license_key.trim().to_string();
    if license_key.is_empty() || body.user_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "License key and user ID are required" })),
        )
            .into_response();
    }

    let user_exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM users WHERE id = $1")
        .bind(&body.user_id)
        .fetch_one(&state.db)
        .await
        .unwrap_or(0)
        > 0;
    if !user_exists {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "message": "User not found" })),
        )
            .into_response();
    }

    if !valid_license_key_format(&license_key) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "message": "License Key ไม่ถูกต้องหรือไม่มีในระบบ" })),
        )
            .into_response();
    }

    let row = sqlx::query(
        "SELECT id, license_key, duration_minutes, duration_days, duration_months, duration_years, \
                status, activated_by, activated_at, expires_at, created_by, created_at \
         FROM licenses WHERE license_key = $1",
    )
    .bind(&license_key)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();
    let Some(row) = row else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "message": "License Key ไม่ถูกต้องหรือไม่มีในระบบ" })),
        )
            .into_response();
    };
    let license = parse_license_row(row);

    // An activated key is dead for everyone, including its own activator.
    if license.status == "active" {
        let message = if license.activated_by.as_deref() == Some(body.user_id.as_str()) {
            "คุณได้ใช้งาน License Key นี้ไปแล้ว ไม่สามารถใช้ซ้ำได้"
        } else {
            "License Key นี้ถูกใช้งานโดยผู้ใช้อื่นแล้ว ไม่สามารถใช้ซ้ำได้"
        };
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": message })),
        )
            .into_response();
    }

    if license
        .expires_at
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .is_some_and(|t| t.with_timezone(&Utc) < Utc::now())
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "License Key นี้หมดอายุแล้ว" })),
        )
            .into_response();
    }

    let duration = LicenseDuration {
        minutes: license.duration_minutes,
        days: license.duration_days,
        months: license.duration_months,
        years: license.duration_years,
    };
    let expires_at = calculate_expiry(Utc::now(), &duration).to_rfc3339();

    // Two independent statements, deliberately not wrapped in a transaction;
    // a crash between them leaves the license active with the user row stale.
    let license_updated = sqlx::query(
        "UPDATE licenses SET status = 'active', activated_by = $1, activated_at = $2, expires_at = $3 \
         WHERE license_key = $4",
    )
    .bind(&body.user_id)
    .bind(now_iso())
    .bind(&expires_at)
    .bind(&license_key)
    .execute(&state.db)
    .await
    .is_ok();
    if !license_updated {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "message": "เกิดข้อผิดพลาดของระบบ" })),
        )
            .into_response();
    }

    let _ = sqlx::query("UPDATE users SET license_key = $1, license_expiry = $2 WHERE id = $3")
        .bind(&license_key)
        .bind(&expires_at)
        .bind(&body.user_id)
        .execute(&state.db)
        .await;

    info!("[license] activated {license_key} for user {}", body.user_id);
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "เปิดใช้งาน License สำเร็จ",
            "expiresAt": expires_at
        })),
    )
        .into_response()
}

async fn get_license_status(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let user_id = params.get("userId").cloned().unwrap_or_default();
    if user_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "User ID is required" })),
        )
            .into_response();
    }

    let row = sqlx::query("SELECT license_key, license_expiry FROM users WHERE id = $1")
        .bind(&user_id)
        .fetch_optional(&state.db)
        .await
        .ok()
        .flatten();
    let Some(row) = row else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "message": "User not found" })),
        )
            .into_response();
    };

    let license_key: Option<String> = row.get("license_key");
    let license_expiry: Option<String> = row.get("license_expiry");
    let is_valid = license_is_valid(license_expiry.as_deref());
    let remaining_ms = if is_valid {
        license_expiry
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| (t.with_timezone(&Utc) - Utc::now()).num_milliseconds().max(0))
            .unwrap_or(0)
    } else {
        0
    };

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "hasLicense": license_key.is_some(),
            "licenseKey": license_key,
            "expiresAt": license_expiry,
            "isValid": is_valid,
            "remainingTime": remaining_ms
        })),
    )
        .into_response()
}

async fn add_license_to_user(
    Path(user_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddLicenseBody>,
) -> impl IntoResponse {
    if !require_admin(&state.db, &body.admin_user_id).await {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "success": false, "message": "Access denied. Admin only." })),
        )
            .into_response();
    }

    let row = sqlx::query(
        "SELECT id, license_key, duration_minutes, duration_days, duration_months, duration_years, \
                status, activated_by, activated_at, expires_at, created_by, created_at \
         FROM licenses WHERE license_key = $1",
    )
    .bind(&body.license_key)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();
    let Some(row) = row else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "message": "Invalid license key" })),
        )
            .into_response();
    };
    let license = parse_license_row(row);

    if license.status == "active" && license.activated_by.as_deref() != Some(user_id.as_str()) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "License already used by another user" })),
        )
            .into_response();
    }

    let duration = LicenseDuration {
        minutes: license.duration_minutes,
        days: license.duration_days,
        months: license.duration_months,
        years: license.duration_years,
    };
    let expires_at = calculate_expiry(Utc::now(), &duration).to_rfc3339();

    let _ = sqlx::query(
        "UPDATE licenses SET status = 'active', activated_by = $1, activated_at = $2, expires_at = $3 \
         WHERE license_key = $4",
    )
    .bind(&user_id)
    .bind(now_iso())
    .bind(&expires_at)
    .bind(&body.license_key)
    .execute(&state.db)
    .await;

    let _ = sqlx::query("UPDATE users SET license_key = $1, license_expiry = $2 WHERE id = $3")
        .bind(&body.license_key)
        .bind(&expires_at)
        .bind(&user_id)
        .execute(&state.db)
        .await;

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "License added successfully",
            "expiresAt": expires_at
        })),
    )
        .into_response()
}

// ----- admin user management -----

async fn get_users(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let admin_user_id = params.get("adminUserId").cloned().unwrap_or_default();
    if !require_admin(&state.db, &admin_user_id).await {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "success": false, "message": "Access denied. Admin only." })),
        )
            .into_response();
    }

    let rows = sqlx::query(
        "SELECT id, username, role, license_key, license_expiry, created_at \
         FROM users ORDER BY created_at DESC",
    )
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();

    let users = rows.into_iter().map(parse_user_summary_row).collect::<Vec<_>>();
    (
        StatusCode::OK,
        Json(json!({ "success": true, "users": users })),
    )
        .into_response()
}

async fn update_user_role(
    Path(user_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateRoleBody>,
) -> impl IntoResponse {
    if !require_admin(&state.db, &body.admin_user_id).await {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "success": false, "message": "Access denied. Admin only." })),
        )
            .into_response();
    }
    if body.role != "user" && body.role != "admin" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "Invalid role" })),
        )
            .into_response();
    }

    let _ = sqlx::query("UPDATE users SET role = $1 WHERE id = $2")
        .bind(&body.role)
        .bind(&user_id)
        .execute(&state.db)
        .await;

    (
        StatusCode::OK,
        Json(json!({ "success": true, "message": "User role updated successfully" })),
    )
        .into_response()
}

async fn reset_user_password(
    Path(user_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ResetPasswordBody>,
) -> impl IntoResponse {
    if !require_admin(&state.db, &body.admin_user_id).await {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "success": false, "message": "Access denied. Admin only." })),
        )
            .into_response();
    }
    if body.new_password.len() < 6 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "Password must be at least 6 characters" })),
        )
            .into_response();
    }

    let Ok(password_hash) = hash(&body.new_password, DEFAULT_COST) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "message": "Server error" })),
        )
            .into_response();
    };
    let _ = sqlx::query("UPDATE users SET password_hash = $1 WHERE id = $2")
        .bind(&password_hash)
        .bind(&user_id)
        .execute(&state.db)
        .await;

    (
        StatusCode::OK,
        Json(json!({ "success": true, "message": "Password reset successfully" })),
    )
        .into_response()
}

async fn delete_user(
    Path(user_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let admin_user_id = params.get("adminUserId").cloned().unwrap_or_default();
    if !require_admin(&state.db, &admin_user_id).await {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "success": false, "message": "Access denied. Admin only." })),
        )
            .into_response();
    }
    if user_id == admin_user_id {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "Cannot delete your own account" })),
        )
            .into_response();
    }

    let _ = sqlx::query("DELETE FROM users WHERE id = $1")
        .bind(&user_id)
        .execute(&state.db)
        .await;

    (
        StatusCode::OK,
        Json(json!({ "success": true, "message": "User deleted successfully" })),
    )
        .into_response()
}

// ----- uploads -----

async fn upload_image(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("image") {
            continue;
        }
        let original_name = field.file_name().unwrap_or_default().to_string();
        let extension = original_name
            .rsplit('.')
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        if upload_content_type(&extension).is_none() {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "message": "Only image files are allowed!" })),
            )
                .into_response();
        }

        let Ok(data) = field.bytes().await else {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "message": "Failed to read upload" })),
            )
                .into_response();
        };
        if data.len() > MAX_UPLOAD_BYTES {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "message": "File too large" })),
            )
                .into_response();
        }

        let file_name = format!("{}.{extension}", Uuid::new_v4());
        if tokio::fs::write(state.upload_dir.join(&file_name), &data)
            .await
            .is_err()
        {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "message": "Failed to upload image" })),
            )
                .into_response();
        }

        return (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "imageUrl": format!("/uploads/{file_name}"),
                "message": "Image uploaded successfully"
            })),
        )
            .into_response();
    }

    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "message": "No file uploaded" })),
    )
        .into_response()
}

async fn serve_upload(
    Path(file_name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if !is_safe_upload_file_name(&file_name) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid file name" })),
        )
            .into_response();
    }

    let path = state.upload_dir.join(&file_name);
    let Ok(bytes) = tokio::fs::read(&path).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "file not found" })),
        )
            .into_response();
    };

    let extension = file_name
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    let content_type = upload_content_type(&extension).unwrap_or("application/octet-stream");

    let mut response = axum::response::Response::new(axum::body::Body::from(bytes));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response.into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

pub async fn run() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let port = env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(5000);
    let database_url = resolve_database_url();
    let upload_dir = env::var("UPLOAD_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./uploads"));
    let public_base_url = env::var("API_PUBLIC_URL")
        .unwrap_or_else(|_| format!("http://localhost:{port}"))
        .trim_end_matches('/')
        .to_string();

    if let Err(err) = tokio::fs::create_dir_all(&upload_dir).await {
        panic!(
            "failed to create upload directory {}: {}",
            upload_dir.display(),
            err
        );
    }

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    let state = Arc::new(AppState {
        db,
        broadcaster: Arc::new(crate::broadcast::Broadcaster::new()),
        http: reqwest::Client::new(),
        upload_dir,
        public_base_url,
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/webhook/{channel_id}", post(line_webhook_event))
        .route("/api/login", post(login))
        .route("/api/register", post(register))
        .route("/api/messages/stream", get(message_stream))
        .route("/api/messages", get(get_messages))
        .route("/api/messages/send", post(send_message))
        .route("/api/messages/mark-read", post(mark_messages_read))
        .route("/api/channels", get(get_channels).post(create_channel))
        .route("/api/channels/{channel_id}", delete(delete_channel))
        .route("/api/agents", get(get_agents).post(create_agent))
        .route(
            "/api/agents/{agent_id}",
            put(update_agent).delete(delete_agent),
        )
        .route(
            "/api/agents/{agent_id}/channels",
            get(get_agent_channels).post(set_agent_channels),
        )
        .route(
            "/api/auto-replies",
            get(get_auto_replies).post(create_auto_reply),
        )
        .route(
            "/api/auto-replies/{rule_id}",
            put(update_auto_reply).delete(delete_auto_reply),
        )
        .route("/api/auto-replies/{rule_id}/toggle", patch(toggle_auto_reply))
        .route("/api/groups", get(get_groups).post(create_group))
        .route(
            "/api/groups/{group_id}",
            put(update_group).delete(delete_group),
        )
        .route("/api/admin/licenses/generate", post(generate_license))
        .route("/api/admin/licenses", get(get_licenses))
        .route("/api/licenses/delete/{license_id}", delete(delete_license))
        .route("/api/license/activate", post(activate_license))
        .route("/api/license/status", get(get_license_status))
        .route("/api/admin/users", get(get_users))
        .route("/api/admin/users/{user_id}/role", put(update_user_role))
        .route(
            "/api/admin/users/{user_id}/reset-password",
            put(reset_user_password),
        )
        .route("/api/admin/users/{user_id}", delete(delete_user))
        .route(
            "/api/admin/users/{user_id}/add-license",
            post(add_license_to_user),
        )
        .route("/api/upload/image", post(upload_image))
        .route("/uploads/{file_name}", get(serve_upload))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 64 * 1024))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    info!("lineoa server running at http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event_message(kind: &str, text: Option<&str>) -> line::EventMessage {
        serde_json::from_value(json!({
            "type": kind,
            "text": text,
        }))
        .unwrap()
    }

    #[test]
    fn classify_text_keeps_raw_body() {
        let content = classify_inbound(&event_message("text", Some("สวัสดีครับ")));
        assert_eq!(content.message_type, "text");
        assert_eq!(content.text, "สวัสดีครับ");
        assert!(content.sticker_package_id.is_none());
    }

    #[test]
    fn classify_image_uses_placeholder_without_fetching() {
        let content = classify_inbound(&event_message("image", None));
        assert_eq!(content.message_type, "image");
        assert_eq!(content.text, IMAGE_PLACEHOLDER);
    }

    #[test]
    fn classify_sticker_retains_structured_ids() {
        let message = serde_json::from_value::<line::EventMessage>(json!({
            "type": "sticker",
            "packageId": "446",
            "stickerId": "1988",
        }))
        .unwrap();
        let content = classify_inbound(&message);
        assert_eq!(content.message_type, "sticker");
        assert_eq!(content.sticker_package_id.as_deref(), Some("446"));
        assert_eq!(content.sticker_id.as_deref(), Some("1988"));

        // the placeholder body parses back to the same pair
        let inner = content
            .text
            .strip_prefix("[สติกเกอร์: ")
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap();
        let (package_id, sticker_id) = inner.split_once('/').unwrap();
        assert_eq!(package_id, "446");
        assert_eq!(sticker_id, "1988");
    }

    #[test]
    fn classify_unknown_kind_embeds_raw_kind() {
        let content = classify_inbound(&event_message("video", None));
        assert_eq!(content.message_type, "video");
        assert_eq!(content.text, "[video]");
    }

    #[test]
    fn keyword_match_is_case_insensitive_substring() {
        assert!(rule_matches("hello", "well HELLO there"));
        assert!(rule_matches("Hello", "say hello"));
        assert!(!rule_matches("hello", "goodbye"));
        assert!(!rule_matches("", "anything"));
        assert!(!rule_matches("   ", "anything"));
    }

    #[test]
    fn license_validity_requires_strictly_future_expiry() {
        let future = (Utc::now() + ChronoDuration::hours(1)).to_rfc3339();
        let past = (Utc::now() - ChronoDuration::hours(1)).to_rfc3339();
        assert!(license_is_valid(Some(&future)));
        assert!(!license_is_valid(Some(&past)));
        assert!(!license_is_valid(None));
        assert!(!license_is_valid(Some("not-a-date")));
    }

    #[test]
    fn expiry_arithmetic_per_duration_unit() {
        let from = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();

        let minutes = LicenseDuration { minutes: Some(30), ..Default::default() };
        assert_eq!(calculate_expiry(from, &minutes), from + ChronoDuration::minutes(30));

        let days = LicenseDuration { days: Some(7), ..Default::default() };
        assert_eq!(calculate_expiry(from, &days), from + ChronoDuration::days(7));

        // calendar month arithmetic clamps Jan 31 + 1 month to Feb 29 (leap year)
        let months = LicenseDuration { months: Some(1), ..Default::default() };
        assert_eq!(
            calculate_expiry(from, &months),
            Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap()
        );

        let years = LicenseDuration { years: Some(1), ..Default::default() };
        assert_eq!(
            calculate_expiry(from, &years),
            Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap()
        );

        let combined = LicenseDuration {
            minutes: Some(1),
            days: Some(1),
            months: Some(1),
            years: None,
        };
        let expected = (from + ChronoDuration::minutes(1) + ChronoDuration::days(1))
            .checked_add_months(Months::new(1))
            .unwrap();
        assert_eq!(calculate_expiry(from, &combined), expected);
    }

    #[test]
    fn generated_keys_match_the_published_format() {
        for _ in 0..20 {
            let key = generate_license_key();
            assert!(valid_license_key_format(&key), "bad key: {key}");
        }
        assert!(!valid_license_key_format("ABCDE-ABCDE"));
        assert!(!valid_license_key_format("abcde-abcde-abcde-abcde-abcde"));
        assert!(!valid_license_key_format(""));
    }

    #[test]
    fn internal_image_urls_are_rejected() {
        assert!(is_internal_image_url("http://localhost:5000/uploads/a.png"));
        assert!(is_internal_image_url("http://127.0.0.1/a.png"));
        assert!(is_internal_image_url("https://10.1.2.3/a.png"));
        assert!(is_internal_image_url("https://192.168.1.10/a.png"));
        assert!(is_internal_image_url("http://intranet.local/a.png"));
        assert!(is_internal_image_url("ftp://cdn.example.com/a.png"));
        assert!(is_internal_image_url("not a url"));
        assert!(!is_internal_image_url("https://cdn.example.com/a.png"));
        assert!(!is_internal_image_url("http://93.184.216.34/a.png"));
    }

    #[test]
    fn relative_image_urls_resolve_against_public_base() {
        assert_eq!(
            resolve_image_url("http://localhost:5000", "/uploads/a.png"),
            "http://localhost:5000/uploads/a.png"
        );
        assert_eq!(
            resolve_image_url("http://localhost:5000", "https://cdn.example.com/a.png"),
            "https://cdn.example.com/a.png"
        );
    }

    #[test]
    fn upload_file_name_safety() {
        assert!(is_safe_upload_file_name("9b2d1c.png"));
        assert!(is_safe_upload_file_name("photo_2024-01.webp"));
        assert!(!is_safe_upload_file_name("../etc/passwd"));
        assert!(!is_safe_upload_file_name(".hidden"));
        assert!(!is_safe_upload_file_name("a/b.png"));
        assert!(!is_safe_upload_file_name(""));
    }
}
