use std::collections::BTreeSet;

use aweme_common::FieldMap;
use serde_json::Value;

/// Derive a missing field from another one by trimming punctuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fallback {
    pub field: &'static str,
    pub from: &'static str,
    pub trim: &'static [char],
}

impl Fallback {
    pub fn derive(&self, fields: &FieldMap) -> Option<Value> {
        let base = fields.get(self.from)?.as_str()?;
        let derived = base.trim_matches(self.trim);
        (!derived.is_empty()).then(|| Value::from(derived))
    }
}

/// Destination shape of one entity kind. Schema-agnostic storage only needs
/// to know which fields are known, which fluctuate, and which may only
/// move forward.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    pub entity: &'static str,
    pub columns: BTreeSet<String>,
    pub volatile: BTreeSet<String>,
    pub monotonic: BTreeSet<String>,
    pub required: Vec<&'static str>,
    pub fallbacks: Vec<Fallback>,
}

const NAME_TRIM: &[char] = &['-', '_'];

const POST_COLUMNS: &[&str] = &[
    "id",
    "user_id",
    "sec_uid",
    "username",
    "nickname",
    "create_time",
    "desc",
    "blog_url",
    "region",
    "location",
    "location_id",
    "longitude",
    "latitude",
    "tags",
    "at_users",
    "video_tag",
    "admire_count",
    "collect_count",
    "comment_count",
    "digg_count",
    "play_count",
    "share_count",
    "recommend_count",
    "user_digged",
    "collect_stat",
    "img_ids",
    "img_urls",
    "video_id",
    "video_url",
    "content_size",
    "content_hash",
    "duration",
    "bit_rate",
    "height",
    "width",
    "is_source_hdr",
    "is_long_video",
    "is_video",
    "is_h265",
    "is_bytevc1",
    "is_life_item",
    "is_story",
    "is_image_beat",
    "is_multi_content",
    "category_da",
    "fps",
    "gear_name",
    "ratio",
    "source",
    "aweme_type",
    "danmaku_cnt",
    "original",
    "preview_video_status",
    "download_mask_panel",
    "group_id",
    "comment_gid",
    "activity_video_type",
    "updated_at",
];

const POST_VOLATILE: &[&str] = &[
    "admire_count",
    "collect_count",
    "comment_count",
    "digg_count",
    "play_count",
    "share_count",
    "recommend_count",
    "img_urls",
    "video_url",
];

const USER_COLUMNS: &[&str] = &[
    "id",
    "sec_uid",
    "unique_id",
    "username",
    "nickname",
    "signature",
    "school_name",
    "age",
    "gender",
    "following_count",
    "follower_count",
    "followed",
    "following",
    "max_follower_count",
    "aweme_count",
    "forward_count",
    "favoriting_count",
    "total_favorited",
    "show_favorite_list",
    "province",
    "city",
    "district",
    "ip",
    "country",
    "iso_country_code",
    "homepage",
    "avatar",
    "im_primary_role_id",
    "im_role_ids",
    "role_id",
    "publish_landing_tab",
    "follow_list_toast",
    "has_subscription",
    "live_commerce",
    "public_collects_count",
    "with_commerce_entry",
    "with_fusion_shop_entry",
    "show_subscription",
    "mplatform_followers_count",
    "is_mix_user",
    "can_show_group_card",
    "verification_type",
    "custom_verify",
    "douplus_user_type",
    "mix_count",
    "secret",
    "new_friend_type",
    "account_info_url",
    "updated_at",
];

const USER_VOLATILE: &[&str] = &[
    "follower_count",
    "max_follower_count",
    "aweme_count",
    "mplatform_followers_count",
    "total_favorited",
];

fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl EntitySchema {
    pub fn posts() -> Self {
        Self {
            entity: "post",
            columns: set(POST_COLUMNS),
            volatile: set(POST_VOLATILE),
            monotonic: set(&["updated_at"]),
            required: vec!["user_id", "create_time", "blog_url", "username"],
            fallbacks: vec![Fallback {
                field: "username",
                from: "nickname",
                trim: NAME_TRIM,
            }],
        }
    }

    pub fn users() -> Self {
        Self {
            entity: "user",
            columns: set(USER_COLUMNS),
            volatile: set(USER_VOLATILE),
            monotonic: set(&["updated_at"]),
            required: vec!["sec_uid", "nickname", "username", "homepage"],
            fallbacks: vec![Fallback {
                field: "username",
                from: "nickname",
                trim: NAME_TRIM,
            }],
        }
    }

    /// Add operator-configured volatile fields.
    pub fn with_volatile<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.volatile.extend(extra.into_iter().map(Into::into));
        self
    }

    pub fn is_known(&self, field: &str) -> bool {
        self.columns.contains(field)
    }

    pub fn is_volatile(&self, field: &str) -> bool {
        self.volatile.contains(field)
    }

    pub fn is_monotonic(&self, field: &str) -> bool {
        self.monotonic.contains(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fallback_trims_punctuation() {
        let schema = EntitySchema::posts();
        let mut fields = FieldMap::new();
        fields.insert("nickname".into(), json!("--cat_lover__"));
        assert_eq!(schema.fallbacks[0].derive(&fields), Some(json!("cat_lover")));

        fields.insert("nickname".into(), json!("-_-"));
        assert_eq!(schema.fallbacks[0].derive(&fields), None);
    }

    #[test]
    fn extra_volatile_fields() {
        let schema = EntitySchema::users().with_volatile(["following_count"]);
        assert!(schema.is_volatile("following_count"));
        assert!(schema.is_volatile("follower_count"));
        assert!(!schema.is_volatile("nickname"));
    }

    #[test]
    fn every_volatile_field_is_a_column() {
        for schema in [EntitySchema::posts(), EntitySchema::users()] {
            assert!(schema.volatile.is_subset(&schema.columns), "{}", schema.entity);
            assert!(schema.is_monotonic("updated_at"));
        }
    }
}
