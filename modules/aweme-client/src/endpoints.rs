//! Web API endpoints and their fixed query parameters.

use aweme_common::{lenient_u64, RawItem, Source, UserRef};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{FetchError, Result};
use crate::session::Session;
use crate::transport::{params, RetryingTransport};

pub const POST_LIST_URL: &str = "https://www.douyin.com/aweme/v1/web/aweme/post/";
pub const POST_DETAIL_URL: &str = "https://www.douyin.com/aweme/v1/web/aweme/detail/";
pub const FOLLOWING_URL: &str = "https://www.douyin.com/aweme/v1/web/user/following/list/";
pub const PROFILE_URL: &str = "https://www.douyin.com/aweme/v1/web/user/profile/other/";
pub const SELF_URL: &str = "https://www.douyin.com/aweme/v1/web/query/user/";

/// Page size requested from the post listing.
pub const POST_PAGE_SIZE: &str = "18";

pub(crate) fn post_list_params(user: &UserRef) -> Vec<(String, String)> {
    let mut p = params(&[
        ("aid", "6383"),
        ("count", POST_PAGE_SIZE),
        ("version_code", "170400"),
    ]);
    p.extend(user.query_params());
    p
}

pub(crate) fn following_params(user: &UserRef) -> Vec<(String, String)> {
    let mut p = params(&[
        ("aid", "6383"),
        ("max_time", "0"),
        ("source_type", "1"),
        ("version_code", "170400"),
    ]);
    p.extend(user.query_params());
    p
}

/// The detail endpoint only answers requests that look like a desktop
/// browser.
fn post_detail_params(id: u64) -> Vec<(String, String)> {
    let mut p = params(&[
        ("device_platform", "webapp"),
        ("aid", "6383"),
        ("channel", "channel_pc_web"),
        ("pc_client_type", "1"),
        ("version_code", "190500"),
        ("version_name", "19.5.0"),
        ("cookie_enabled", "true"),
        ("screen_width", "1920"),
        ("screen_height", "1080"),
        ("browser_language", "en-US"),
        ("browser_platform", "MacIntel"),
        ("browser_name", "Chrome"),
        ("browser_version", "120.0.0.0"),
        ("browser_online", "true"),
        ("engine_name", "Blink"),
        ("engine_version", "120.0.0.0"),
        ("os_name", "Mac OS"),
        ("os_version", "10.15.7"),
        ("cpu_core_num", "8"),
        ("device_memory", "8"),
        ("platform", "PC"),
        ("downlink", "10"),
        ("effective_type", "4g"),
        ("round_trip_time", "50"),
        ("webid", "7311600805983176230"),
    ]);
    p.push(("aweme_id".to_string(), id.to_string()));
    p
}

/// Fetch one post from the detail endpoint.
pub async fn post_detail(
    transport: &RetryingTransport,
    session: &mut Session,
    id: u64,
) -> Result<RawItem> {
    let mut body = transport
        .get_envelope(session, POST_DETAIL_URL, &post_detail_params(id))
        .await?;

    if let Some(stray) = body
        .keys()
        .find(|k| !matches!(k.as_str(), "aweme_detail" | "log_pb" | "status_code"))
    {
        return Err(FetchError::Envelope {
            url: POST_DETAIL_URL.to_string(),
            detail: format!("unexpected key '{stray}' for post {id}"),
        });
    }

    let detail = match body.remove("aweme_detail") {
        Some(Value::Object(detail)) => detail,
        _ => {
            return Err(FetchError::Envelope {
                url: POST_DETAIL_URL.to_string(),
                detail: format!("no aweme_detail for post {id}"),
            })
        }
    };

    let item = RawItem::new(Source::Page, detail).map_err(|e| FetchError::Envelope {
        url: POST_DETAIL_URL.to_string(),
        detail: e.to_string(),
    })?;
    if item.id != id {
        return Err(FetchError::Envelope {
            url: POST_DETAIL_URL.to_string(),
            detail: format!("asked for post {id}, got {}", item.id),
        });
    }
    Ok(item)
}

/// Fetch a user's public profile. Returns the `user` object.
pub async fn user_profile(
    transport: &RetryingTransport,
    session: &mut Session,
    user: &UserRef,
) -> Result<Map<String, Value>> {
    let mut p = params(&[("aid", "6383"), ("version_code", "170400")]);
    p.extend(user.query_params());

    let mut body = transport.get_envelope(session, PROFILE_URL, &p).await?;
    match body.remove("user") {
        Some(Value::Object(profile)) => Ok(profile),
        _ => Err(FetchError::Envelope {
            url: PROFILE_URL.to_string(),
            detail: format!("no user object for {user}"),
        }),
    }
}

/// The numeric id of the account the session is logged in as.
pub async fn self_user_id(transport: &RetryingTransport, session: &mut Session) -> Result<u64> {
    let p = params(&[
        ("device_platform", "webapp"),
        ("aid", "6383"),
        ("version_code", "170400"),
    ]);
    let body = transport.get_json(session, SELF_URL, &p).await?;
    let uid = body
        .get("user_uid")
        .and_then(lenient_u64)
        .ok_or_else(|| FetchError::Envelope {
            url: SELF_URL.to_string(),
            detail: "missing user_uid".into(),
        })?;
    info!(session = %session.id(), uid, "resolved logged-in account");
    Ok(uid)
}
