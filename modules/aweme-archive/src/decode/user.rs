use aweme_common::lenient_u64;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use super::{lenient_id, strip_ignored, FieldSink};
use crate::error::{ArchiveError, Result};
use crate::record::CanonicalRecord;

const ENTITY: &str = "user";
const IP_PREFIX: &str = "IP属地：";

pub const USER_IGNORED_KEYS: &[&str] = &[
    // alternate renditions of data we already keep
    "share_info",
    "white_cover_url",
    "cover_and_head_image_info",
    "cover_url",
    "cover_colour",
    "avatar_168x168",
    "avatar_300x300",
    "avatar_medium",
    "avatar_thumb",
    "signature_display_lines",
    "signature_extra",
    "signature_language",
    "urge_detail",
    "sync_to_toutiao",
    "enterprise_user_info",
    "commerce_user_info",
    "commerce_info",
    "card_entries",
    "official_cooperation",
    // live room state changes by the minute
    "live_status",
    "room_id",
    "room_id_str",
    "room_data",
    // relation to the viewing account
    "follow_guide",
    "is_top",
    "favorite_permission",
    // constant across the corpus
    "apple_account",
    "aweme_count_correction_threshold",
    "can_set_item_cover",
    "close_friend_type",
    "commerce_user_level",
    "has_e_account_role",
    "image_send_exempt",
    "ins_id",
    "is_ban",
    "is_block",
    "is_blocked",
    "is_effect_artist",
    "is_gov_media_vip",
    "is_not_show",
    "is_series_user",
    "is_sharing_profile_user",
    "is_star",
    "life_story_block",
    "original_musician",
    "pigeon_daren_status",
    "pigeon_daren_warn_tag",
    "profile_tab_type",
    "r_fans_group_info",
    "recommend_reason_relation",
    "recommend_user_reason_source",
    "risk_notice_text",
    "series_count",
    "special_follow_status",
    "tab_settings",
    "total_favorited_correction_threshold",
    "twitter_id",
    "twitter_name",
    "video_cover",
    "video_icon",
    "watch_status",
    "with_commerce_enterprise_tab_entry",
    "with_new_goods",
    "youtube_channel_id",
    "youtube_channel_title",
    "enable_ai_double",
    "enable_wish",
    "enterprise_verify_reason",
    "dynamic_cover",
    "is_activity_user",
    "follower_request_status",
    "dongtai_count",
    "message_chat_entry",
    "user_not_see",
    "user_not_show",
];

#[derive(Debug, Deserialize)]
struct UserPayload {
    #[serde(deserialize_with = "lenient_id")]
    uid: u64,
    sec_uid: String,
    #[serde(default)]
    unique_id: Option<String>,
    #[serde(default)]
    short_id: Option<Value>,
    #[serde(default)]
    avatar_larger: Option<UrlList>,
    #[serde(default)]
    ip_location: Option<String>,
    #[serde(default)]
    user_age: Option<i64>,
    #[serde(default)]
    birthday_hide_level: Option<i64>,
    #[serde(default)]
    general_permission: Option<Map<String, Value>>,
    #[serde(default)]
    user_permissions: Option<Vec<Permission>>,
    #[serde(default)]
    follow_status: Option<i64>,
    #[serde(default)]
    follower_status: Option<i64>,
    #[serde(default)]
    remark_name: Option<String>,
    #[serde(default)]
    live_status: Option<i64>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct UrlList {
    #[serde(default)]
    url_list: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Permission {
    key: String,
    value: Value,
}

pub fn homepage(sec_uid: &str) -> String {
    format!("https://www.douyin.com/user/{sec_uid}")
}

/// Decode a profile object (the `user` value of the profile endpoint).
pub fn decode_user(profile: Map<String, Value>, fetched_at: DateTime<Utc>) -> Result<CanonicalRecord> {
    let hint = profile.get("uid").and_then(lenient_u64).unwrap_or(0);
    let payload: UserPayload = serde_json::from_value(Value::Object(profile))
        .map_err(|e| ArchiveError::drift(ENTITY, hint, "payload", e.to_string()))?;
    let UserPayload {
        uid,
        sec_uid,
        unique_id,
        short_id,
        avatar_larger,
        ip_location,
        user_age,
        birthday_hide_level,
        general_permission,
        user_permissions,
        follow_status,
        follower_status,
        remark_name,
        live_status,
        mut rest,
    } = payload;
    let drift = |field: &str, detail: String| ArchiveError::drift(ENTITY, uid, field, detail);

    let mut sink = FieldSink::new(ENTITY, uid);
    let home = homepage(&sec_uid);
    sink.set("sec_uid", sec_uid);
    sink.set("homepage", home.clone());

    let unique_id = unique_id.unwrap_or_default();
    match short_id.as_ref().and_then(lenient_u64).filter(|s| *s != 0) {
        Some(short) if unique_id.is_empty() => sink.set("unique_id", short.to_string()),
        Some(short) => {
            return Err(drift("short_id", format!("{short} alongside unique_id {unique_id}")));
        }
        None => sink.set("unique_id", unique_id),
    }

    if let Some(url) = avatar_larger.and_then(|a| a.url_list.into_iter().next()) {
        let bare = url.split('?').next().unwrap_or(&url).to_string();
        sink.set("avatar", bare);
    }

    if let Some(ip) = ip_location.filter(|ip| !ip.is_empty()) {
        let stripped = ip
            .strip_prefix(IP_PREFIX)
            .ok_or_else(|| drift("ip_location", format!("unexpected format '{ip}'")))?;
        sink.set("ip", stripped.to_string());
    }

    if birthday_hide_level != Some(1) {
        if let Some(age) = user_age.filter(|a| *a > 0) {
            sink.set("age", age);
        }
    }

    let toast = general_permission.is_some_and(|p| !p.is_empty());
    sink.set("follow_list_toast", i64::from(toast));

    for permission in user_permissions.unwrap_or_default() {
        if permission.key != "douplus_user_type" {
            return Err(drift("user_permissions", format!("unknown key {}", permission.key)));
        }
        let value = lenient_u64(&permission.value)
            .ok_or_else(|| drift("user_permissions", permission.value.to_string()))?;
        sink.set("douplus_user_type", value);
    }

    let following = follow_status.unwrap_or(0);
    let followed = follower_status.unwrap_or(0);
    if !(0..=2).contains(&following) || !(0..=1).contains(&followed) {
        return Err(drift(
            "follow_status",
            format!("follow_status={following} follower_status={followed}"),
        ));
    }
    sink.set("following", following != 0);
    sink.set("followed", followed != 0);

    sink.set_opt("username", remark_name);

    if live_status == Some(1) {
        info!(user = uid, homepage = %home, "user is live");
    }

    strip_ignored(&mut rest, USER_IGNORED_KEYS);
    // the profile endpoint leaks these as placeholders for "unset"
    rest.retain(|_, v| !matches!(v.as_str(), Some("0") | Some("{}")));
    sink.merge("payload", rest)?;
    sink.set(
        "updated_at",
        fetched_at.to_rfc3339_opts(SecondsFormat::Micros, true),
    );

    Ok(CanonicalRecord::new(uid, sink.finish()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::user_profile;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn profile(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn profile_is_normalized() {
        let rec = decode_user(profile(user_profile(42, "MS4wAuthor")), now()).unwrap();
        assert_eq!(rec.id, 42);
        assert_eq!(rec.str_field("homepage"), Some("https://www.douyin.com/user/MS4wAuthor"));
        assert_eq!(rec.str_field("avatar"), Some("https://p3.douyinpic.com/avatar.jpeg"));
        assert_eq!(rec.str_field("ip"), Some("上海"));
        assert_eq!(rec.get("following"), Some(&json!(true)));
        assert_eq!(rec.get("followed"), Some(&json!(false)));
        assert_eq!(rec.str_field("updated_at"), Some("2024-05-01T00:00:00.000000Z"));
        assert!(rec.get("share_info").is_none());
    }

    #[test]
    fn short_id_promoted_to_unique_id() {
        let mut body = user_profile(42, "MS4w");
        body["unique_id"] = json!("");
        body["short_id"] = json!("12345");
        let rec = decode_user(profile(body), now()).unwrap();
        assert_eq!(rec.str_field("unique_id"), Some("12345"));
    }

    #[test]
    fn short_id_with_unique_id_is_drift() {
        let mut body = user_profile(42, "MS4w");
        body["short_id"] = json!("12345");
        assert!(decode_user(profile(body), now()).is_err());
    }

    #[test]
    fn hidden_birthday_drops_age() {
        let mut body = user_profile(42, "MS4w");
        body["user_age"] = json!(25);
        body["birthday_hide_level"] = json!(1);
        let rec = decode_user(profile(body), now()).unwrap();
        assert!(rec.get("age").is_none());
    }

    #[test]
    fn malformed_ip_is_drift() {
        let mut body = user_profile(42, "MS4w");
        body["ip_location"] = json!("Shanghai");
        let err = decode_user(profile(body), now()).unwrap_err();
        assert!(matches!(err, ArchiveError::SchemaDrift { ref field, .. } if field == "ip_location"));
    }

    #[test]
    fn placeholder_strings_are_dropped() {
        let mut body = user_profile(42, "MS4w");
        body["city"] = json!("0");
        body["school_name"] = json!("{}");
        let rec = decode_user(profile(body), now()).unwrap();
        assert!(rec.get("city").is_none());
        assert!(rec.get("school_name").is_none());
    }

    #[test]
    fn remark_becomes_username() {
        let mut body = user_profile(42, "MS4w");
        body["remark_name"] = json!("Friend");
        let rec = decode_user(profile(body), now()).unwrap();
        assert_eq!(rec.str_field("username"), Some("Friend"));
    }
}
