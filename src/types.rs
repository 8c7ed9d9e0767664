use std::{path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::broadcast::Broadcaster;

/// Tenant-owned LINE integration credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub channel_secret: String,
    pub channel_access_token: String,
    pub channel_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub user_id: String,
    pub created_at: String,
}

/// One inbound or outbound communication. Rows are immutable except for the
/// `is_read` flag, which only ever flips false -> true.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub user_id: String,
    pub user_name: String,
    pub text: String,
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticker_package_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticker_id: Option<String>,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub direction: String,
    pub is_read: bool,
    #[serde(default)]
    pub is_auto_reply: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    pub username: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_expiry: Option<String>,
    pub is_license_valid: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub username: String,
    pub user_id: String,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoReplyRule {
    pub id: String,
    pub keyword: String,
    pub reply: String,
    pub user_id: String,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct License {
    pub id: String,
    pub license_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_days: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_months: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_years: Option<i32>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    pub created_by: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationGroup {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub conversations: Vec<GroupConversation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConversation {
    pub user_id: String,
    pub channel_id: String,
}

pub struct AppState {
    pub db: PgPool,
    pub broadcaster: Arc<Broadcaster>,
    pub http: reqwest::Client,
    pub upload_dir: PathBuf,
    pub public_base_url: String,
}

// ----- request bodies -----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginBody {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannelBody {
    pub channel_secret: String,
    pub channel_access_token: String,
    #[serde(default)]
    pub channel_name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub channel_id: String,
    /// External LINE user id of the recipient.
    pub user_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub sticker_package_id: Option<String>,
    #[serde(default)]
    pub sticker_id: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadBody {
    pub user_id: String,
    #[serde(default)]
    pub channel_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgentBody {
    #[serde(default)]
    pub name: Option<String>,
    pub username: String,
    pub password: String,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAgentBody {
    pub name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub is_active: Option<bool>,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignChannelsBody {
    #[serde(default)]
    pub channel_ids: Vec<String>,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAutoReplyBody {
    pub keyword: String,
    pub reply: String,
    pub user_id: String,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAutoReplyBody {
    pub keyword: Option<String>,
    pub reply: Option<String>,
    pub is_active: Option<bool>,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleAutoReplyBody {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupBody {
    pub name: String,
    pub conversations: Vec<GroupConversation>,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGroupBody {
    pub name: Option<String>,
    pub conversations: Option<Vec<GroupConversation>>,
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseDuration {
    #[serde(default)]
    pub minutes: Option<i32>,
    #[serde(default)]
    pub days: Option<i32>,
    #[serde(default)]
    pub months: Option<i32>,
    #[serde(default)]
    pub years: Option<i32>,
}

impl LicenseDuration {
    pub fn is_empty(&self) -> bool {
        self.minutes.is_none() && self.days.is_none() && self.months.is_none() && self.years.is_none()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateLicenseBody {
    #[serde(default)]
    pub duration: Option<LicenseDuration>,
    pub admin_user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminActionBody {
    pub admin_user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateLicenseBody {
    pub license_key: String,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRoleBody {
    pub role: String,
    pub admin_user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordBody {
    pub new_password: String,
    pub admin_user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddLicenseBody {
    pub license_key: String,
    pub admin_user_id: String,
}
