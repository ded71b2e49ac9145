use aweme_common::{blog_url, RawItem};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use super::{lenient_id, lenient_opt_f64, lenient_opt_id, nested, strip_ignored, FieldSink};
use crate::error::{ArchiveError, Result};
use crate::record::CanonicalRecord;

const ENTITY: &str = "post";

/// Top-level keys that carry nothing worth keeping: UI switches, tracking
/// blobs, and flags that have been constant for every post ever seen.
pub const POST_IGNORED_KEYS: &[&str] = &[
    // presentation and tracking
    "image_album_music_info",
    "video_control",
    "visual_search_info",
    "is_use_music",
    "impression_data",
    "share_info",
    "photo_search_entrance",
    "authentication_token",
    "interaction_stickers",
    "entertainment_product_info",
    "comment_permission_info",
    "boost_status",
    "risk_infos",
    "xigua_base_info",
    "status",
    "vtag_search",
    "main_arch_common",
    "music",
    "seo_info",
    "charge_info",
    "fall_card_struct",
    "incentive_item_type",
    "enable_comment_sticker_rec",
    "share_url",
    "duet_origin_item",
    "duet_origin_item_id",
    "guide_scene_info",
    "should_open_ad_report",
    "is_share_post",
    "report_action",
    "comment_words_recommend",
    "common_bar_info",
    "is_ads",
    "guide_btn_type",
    "prevent_download",
    "mark_largely_following",
    "search_impr",
    "horizontal_type",
    "mix_info",
    // listing position, not a property of the post
    "is_top",
    // constant across the corpus
    "author_mask_tag",
    "aweme_control",
    "collection_corner_mark",
    "component_info_v2",
    "disable_relation_bar",
    "distribute_circle",
    "duet_aggregate_in_music_tab",
    "image_crop_ctrl",
    "is_collects_selected",
    "is_duet_sing",
    "item_title",
    "item_warn_notification",
    "series_paid_info",
    "user_recommend_status",
];

/// Cover art, thumbnails and flags of the `video` block that say nothing
/// about the file we download.
const VIDEO_IGNORED_KEYS: &[&str] = &[
    "cover",
    "origin_cover",
    "gaussian_cover",
    "dynamic_cover",
    "animated_cover",
    "optimized_cover",
    "cover_original_scale",
    "use_static_cover",
    "meta",
    "height",
    "width",
    "big_thumbs",
    "misc_download_addrs",
    "horizontal_type",
    "is_h265",
    "cdn_url_expired",
    "bit_rate_audio",
    "audio",
    "has_watermark",
    "has_download_suffix_logo_addr",
];

/// Alternate addresses of the same stream; each must point at the main uri.
const VIDEO_ALT_ADDRS: &[&str] = &[
    "download_addr",
    "download_suffix_logo_addr",
    "play_addr_265",
    "play_addr_h264",
];

const RENDITION_IGNORED_KEYS: &[&str] = &[
    "quality_type",
    "video_extra",
    "HDR_bit",
    "HDR_type",
    "video_model",
];

const PLAY_ADDR_IGNORED_KEYS: &[&str] = &["url_key", "file_cs"];

/// What an image post still carries in its `video` block.
const IMAGE_VIDEO_IGNORED_KEYS: &[&str] = &[
    "cover",
    "origin_cover",
    "big_thumbs",
    "bit_rate_audio",
    "audio",
    "has_watermark",
    "is_h265",
    "meta",
    "height",
    "width",
];

const IMAGE_IGNORED_KEYS: &[&str] = &[
    "width",
    "height",
    "download_url_list",
    "watermark_free_download_url_list",
    "mask_url_list",
    "interaction_stickers",
    "clip_type",
    "live_photo_type",
    "video",
];

fn aweme_type_name(code: i64) -> Option<&'static str> {
    Some(match code {
        0 => "GENERAL",
        51 => "DUET_VIDEO",
        53 => "MV",
        55 => "STICK_POINT_VIDEO",
        61 => "IMAGE_VIDEO",
        66 => "RECOMMEND_TMPL_MV",
        68 => "IMAGE_PUBLISH",
        109 => "CANVAS",
        110 => "KARAOKE",
        _ => return None,
    })
}

#[derive(Debug, Deserialize)]
struct PostPayload {
    #[serde(deserialize_with = "lenient_id")]
    aweme_id: u64,
    author: Author,
    #[serde(default, deserialize_with = "lenient_opt_id")]
    author_user_id: Option<u64>,
    create_time: i64,
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    preview_title: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    region: Option<String>,
    aweme_type: i64,
    #[serde(default)]
    text_extra: Option<Vec<TextExtra>>,
    #[serde(default)]
    video_tag: Option<Vec<VideoTag>>,
    #[serde(default)]
    statistics: Option<Map<String, Value>>,
    #[serde(default)]
    images: Option<Vec<Image>>,
    #[serde(default)]
    video: Option<Video>,
    #[serde(default)]
    media_type: Option<i64>,
    #[serde(default)]
    duration: Option<i64>,
    #[serde(default)]
    danmaku_control: Option<DanmakuControl>,
    #[serde(default, deserialize_with = "lenient_opt_id")]
    group_id: Option<u64>,
    #[serde(default)]
    aweme_acl: Option<Value>,
    #[serde(default)]
    anchor_info: Option<AnchorInfo>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

/// Only the identity is taken from the embedded author; profile fields come
/// from the profile endpoint.
#[derive(Debug, Deserialize)]
struct Author {
    #[serde(deserialize_with = "lenient_id")]
    uid: u64,
    #[serde(default)]
    sec_uid: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TextExtra {
    #[serde(rename = "type", default)]
    kind: Option<i64>,
    #[serde(default)]
    hashtag_name: Option<String>,
    #[serde(default)]
    sec_uid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoTag {
    #[serde(default)]
    tag_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Image {
    uri: String,
    #[serde(default)]
    url_list: Vec<String>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct Video {
    #[serde(default)]
    bit_rate: Option<Vec<Rendition>>,
    #[serde(default)]
    duration: Option<i64>,
    #[serde(default)]
    ratio: Option<String>,
    #[serde(default)]
    play_addr: Option<PlayAddr>,
    #[serde(rename = "is_source_HDR", default)]
    is_source_hdr: Option<i64>,
    #[serde(default)]
    is_long_video: Option<i64>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct Rendition {
    bit_rate: i64,
    #[serde(default)]
    gear_name: Option<String>,
    #[serde(rename = "FPS", default)]
    fps: Option<i64>,
    #[serde(default)]
    is_h265: Option<i64>,
    #[serde(default)]
    is_bytevc1: Option<i64>,
    #[serde(rename = "is_source_HDR", default)]
    is_source_hdr: Option<i64>,
    #[serde(default)]
    is_long_video: Option<i64>,
    #[serde(default)]
    format: Option<String>,
    play_addr: PlayAddr,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct PlayAddr {
    uri: String,
    #[serde(default)]
    url_list: Vec<String>,
    #[serde(default)]
    data_size: Option<u64>,
    #[serde(default)]
    file_hash: Option<String>,
    #[serde(default)]
    height: Option<i64>,
    #[serde(default)]
    width: Option<i64>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct DanmakuControl {
    #[serde(default)]
    danmaku_cnt: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AnchorInfo {
    /// JSON document encoded as a string.
    #[serde(default)]
    extra: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnchorExtra {
    #[serde(default)]
    address_info: Option<Value>,
    #[serde(default, deserialize_with = "lenient_opt_id")]
    poi_id: Option<u64>,
    #[serde(default)]
    poi_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    poi_longitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    poi_latitude: Option<f64>,
    #[serde(default)]
    ext_json: Option<String>,
}

/// Point of interest tagged on a post.
#[derive(Debug, Clone, PartialEq)]
struct Location {
    id: u64,
    name: String,
    longitude: f64,
    latitude: f64,
}

/// Decode one post payload, from either source, into a flat record.
pub fn decode_post(item: &RawItem) -> Result<CanonicalRecord> {
    let id = item.id;
    let drift = |field: &str, detail: String| ArchiveError::drift(ENTITY, id, field, detail);

    let payload: PostPayload = serde_json::from_value(Value::Object(item.body.clone()))
        .map_err(|e| drift("payload", e.to_string()))?;
    let PostPayload {
        aweme_id,
        author,
        author_user_id,
        create_time,
        desc,
        preview_title,
        caption,
        region,
        aweme_type,
        text_extra,
        video_tag,
        statistics,
        images,
        video,
        media_type,
        duration,
        danmaku_control,
        group_id,
        aweme_acl,
        anchor_info,
        mut rest,
    } = payload;

    if aweme_id != id {
        return Err(drift("aweme_id", format!("payload says {aweme_id}")));
    }
    if let Some(uid) = author_user_id.filter(|uid| *uid != author.uid) {
        return Err(drift(
            "author_user_id",
            format!("{uid} but author.uid is {}", author.uid),
        ));
    }

    let desc = desc.unwrap_or_default().trim().to_string();
    if let Some(title) = preview_title.filter(|t| !desc.contains(t.as_str())) {
        return Err(drift("preview_title", format!("'{title}' not in desc")));
    }
    if let Some(caption) = caption {
        let squash = |s: &str| s.split_whitespace().collect::<String>();
        if !squash(&desc).contains(&squash(&caption)) {
            return Err(drift("caption", format!("'{caption}' not in desc")));
        }
    }

    let location = match anchor_info {
        Some(anchor) => decode_anchor(id, anchor)?,
        None => None,
    };
    let desc = match &location {
        Some(_) if desc.ends_with('📍') => {
            return Err(drift("desc", "already ends with a location pin".into()));
        }
        Some(loc) => format!("{desc} 📍{}", loc.name).trim_start().to_string(),
        None => desc,
    };

    let type_name = aweme_type_name(aweme_type)
        .ok_or_else(|| drift("aweme_type", format!("unknown code {aweme_type}")))?;

    let mut sink = FieldSink::new(ENTITY, id);
    sink.set("user_id", author.uid);
    sink.set_opt("sec_uid", author.sec_uid);
    sink.set_opt("nickname", author.nickname);
    sink.set("create_time", create_time);
    sink.set("desc", desc);
    sink.set_opt("region", region);
    sink.set("aweme_type", type_name);
    sink.set("source", item.source.as_str());
    sink.set("blog_url", blog_url(id, images.as_ref().is_some_and(|i| !i.is_empty())));
    sink.set_opt("group_id", group_id);
    sink.set("download_mask_panel", i64::from(aweme_acl.is_some()));
    if let Some(loc) = location {
        sink.set("location", loc.name);
        sink.set("location_id", loc.id);
        sink.set("longitude", loc.longitude);
        sink.set("latitude", loc.latitude);
    }

    let (tags, at_users) = split_text_extra(id, text_extra.unwrap_or_default())?;
    sink.set("tags", tags);
    sink.set("at_users", at_users);
    let video_tags: Vec<String> = video_tag
        .unwrap_or_default()
        .into_iter()
        .filter_map(|t| t.tag_name.filter(|n| !n.is_empty()))
        .collect();
    sink.set("video_tag", video_tags);

    if let Some(mut stats) = statistics {
        if let Some(stat_id) = stats.remove("aweme_id") {
            if aweme_common::lenient_u64(&stat_id) != Some(id) {
                return Err(drift("statistics.aweme_id", stat_id.to_string()));
            }
        }
        sink.merge("statistics", stats)?;
    }

    let media = match images.filter(|list| !list.is_empty()) {
        Some(images) => image_fields(id, images, video)?,
        None => {
            let video = video.ok_or_else(|| drift("video", "neither images nor video".into()))?;
            video_fields(id, video)?
        }
    };
    let is_video = media.get("is_video").and_then(Value::as_bool).unwrap_or(false);
    let media_duration = media.get("duration").and_then(Value::as_i64).unwrap_or(0);
    sink.merge("media", media)?;

    if let Some(mt) = media_type {
        let expected = if is_video { 4 } else { 2 };
        if mt != expected {
            return Err(drift("media_type", format!("{mt}, expected {expected}")));
        }
    }
    if let Some(d) = duration.filter(|d| *d != media_duration) {
        return Err(drift("duration", format!("{d} but media says {media_duration}")));
    }
    if let Some(cnt) = danmaku_control.and_then(|d| d.danmaku_cnt) {
        if !is_video {
            return Err(drift("danmaku_control", "danmaku on an image post".into()));
        }
        sink.set("danmaku_cnt", cnt);
    }

    strip_ignored(&mut rest, POST_IGNORED_KEYS);
    sink.merge("payload", rest)?;

    Ok(CanonicalRecord::new(id, sink.finish()))
}

fn split_text_extra(id: u64, extras: Vec<TextExtra>) -> Result<(Vec<String>, Vec<String>)> {
    let mut tags = Vec::new();
    let mut at_users = Vec::new();
    for extra in extras {
        match (extra.kind, extra.hashtag_name, extra.sec_uid) {
            (Some(1), Some(tag), _) => tags.push(tag),
            (Some(0), _, Some(sec_uid)) => at_users.push(sec_uid),
            // caption-only segments carry positions and nothing else
            (_, None, None) => {}
            (kind, tag, sec_uid) => {
                return Err(ArchiveError::drift(
                    ENTITY,
                    id,
                    "text_extra",
                    format!("type {kind:?} with hashtag {tag:?} and sec_uid {sec_uid:?}"),
                ))
            }
        }
    }
    Ok((tags, at_users))
}

/// Location of a POI anchor, `None` for anchors that are not places.
fn decode_anchor(id: u64, anchor: AnchorInfo) -> Result<Option<Location>> {
    let drift = |detail: String| ArchiveError::drift(ENTITY, id, "anchor_info", detail);

    let Some(extra) = anchor.extra else {
        return Ok(None);
    };
    let extra: AnchorExtra = serde_json::from_str(&extra).map_err(|e| drift(e.to_string()))?;
    if extra.address_info.is_none() {
        return Ok(None);
    }
    let (Some(poi_id), Some(name), Some(longitude), Some(latitude)) = (
        extra.poi_id,
        extra.poi_name.filter(|n| !n.is_empty()),
        extra.poi_longitude,
        extra.poi_latitude,
    ) else {
        return Err(drift("address without poi id, name or coordinates".into()));
    };

    let prefix = match extra.ext_json {
        Some(raw) => {
            let ext: Value = serde_json::from_str(&raw).map_err(|e| drift(e.to_string()))?;
            ext.pointer("/item_ext/anchor_info/type_name")
                .and_then(Value::as_str)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
        }
        None => None,
    };
    let name = match prefix {
        Some(prefix) => format!("{prefix}·{name}"),
        None => name,
    };
    Ok(Some(Location {
        id: poi_id,
        name,
        longitude,
        latitude,
    }))
}

fn image_fields(id: u64, images: Vec<Image>, video: Option<Video>) -> Result<Map<String, Value>> {
    let count = images.len();
    let mut ids = Vec::with_capacity(count);
    let mut urls = Vec::with_capacity(count);
    let mut out = Map::new();
    for (i, image) in images.into_iter().enumerate() {
        let url = image.url_list.into_iter().next().ok_or_else(|| {
            ArchiveError::drift(ENTITY, id, "images", format!("{} has no url", image.uri))
        })?;
        ids.push(Value::from(image.uri));
        urls.push(Value::from(url));
        // one slot per image so leftovers keep their position
        for (key, value) in nested("images", image.rest, IMAGE_IGNORED_KEYS) {
            if let Value::Array(slots) = out
                .entry(key)
                .or_insert_with(|| Value::Array(vec![Value::Null; count]))
            {
                slots[i] = value;
            }
        }
    }
    if let Some(video) = video {
        out.extend(nested("video", video.rest, IMAGE_VIDEO_IGNORED_KEYS));
    }
    out.insert("img_ids".into(), Value::Array(ids));
    out.insert("img_urls".into(), Value::Array(urls));
    out.insert("is_video".into(), Value::Bool(false));
    Ok(out)
}

/// Two places may report the same flag; they must agree.
fn agree(id: u64, field: &str, a: Option<i64>, b: Option<i64>) -> Result<Option<i64>> {
    match (a, b) {
        (Some(x), Some(y)) if x != y => Err(ArchiveError::drift(
            ENTITY,
            id,
            field,
            format!("rendition says {x}, video says {y}"),
        )),
        (a, b) => Ok(a.or(b)),
    }
}

fn video_fields(id: u64, video: Video) -> Result<Map<String, Value>> {
    let drift = |field: &str, detail: String| ArchiveError::drift(ENTITY, id, field, detail);

    let Video {
        bit_rate,
        duration,
        ratio,
        play_addr,
        is_source_hdr,
        is_long_video,
        rest,
    } = video;
    let mut renditions = bit_rate.unwrap_or_default().into_iter();
    let best = renditions
        .next()
        .ok_or_else(|| drift("video.bit_rate", "no renditions".into()))?;
    let uri = play_addr
        .as_ref()
        .map(|p| p.uri.clone())
        .unwrap_or_else(|| best.play_addr.uri.clone());

    if best.play_addr.uri != uri {
        return Err(drift("video.bit_rate", format!("{} != {uri}", best.play_addr.uri)));
    }
    for other in renditions {
        if other.play_addr.uri != uri {
            return Err(drift("video.bit_rate", format!("{} != {uri}", other.play_addr.uri)));
        }
        if other.bit_rate > best.bit_rate {
            warn!(post = id, best = best.bit_rate, other = other.bit_rate, "first rendition is not the highest bit rate");
        }
    }
    if let Some(format) = best.format.as_deref().filter(|f| *f != "mp4") {
        return Err(drift("video.format", format.to_string()));
    }

    let mut leftovers = rest;
    for key in VIDEO_ALT_ADDRS {
        if let Some(addr) = leftovers.remove(*key) {
            if addr.get("uri").and_then(Value::as_str) != Some(uri.as_str()) {
                return Err(drift(&format!("video.{key}"), format!("does not point at {uri}")));
            }
        }
    }
    let mut extra = nested("video", leftovers, VIDEO_IGNORED_KEYS);
    extra.extend(nested("video.bit_rate", best.rest, RENDITION_IGNORED_KEYS));
    extra.extend(nested("video.bit_rate.play_addr", best.play_addr.rest, PLAY_ADDR_IGNORED_KEYS));

    let is_source_hdr = agree(id, "is_source_hdr", best.is_source_hdr, is_source_hdr)?;
    let is_long_video = agree(id, "is_long_video", best.is_long_video, is_long_video)?;

    let PlayAddr {
        url_list,
        data_size,
        file_hash,
        height,
        width,
        ..
    } = best.play_addr;
    let url = url_list
        .into_iter()
        .last()
        .ok_or_else(|| drift("video.url_list", "empty".into()))?;

    let mut out = Map::new();
    let mut put = |k: &str, v: Option<Value>| {
        if let Some(v) = v {
            out.insert(k.to_string(), v);
        }
    };
    put("is_video", Some(Value::Bool(true)));
    put("video_id", Some(uri.into()));
    put("video_url", Some(url.into()));
    put("content_size", data_size.map(Value::from));
    put("content_hash", file_hash.map(Value::from));
    put("duration", duration.map(Value::from));
    put("bit_rate", Some(best.bit_rate.into()));
    put("height", height.map(Value::from));
    put("width", width.map(Value::from));
    put("fps", best.fps.map(Value::from));
    put("gear_name", best.gear_name.map(Value::from));
    put("ratio", ratio.map(Value::from));
    put("is_h265", best.is_h265.map(Value::from));
    put("is_bytevc1", best.is_bytevc1.map(Value::from));
    put("is_source_hdr", is_source_hdr.map(Value::from));
    put("is_long_video", is_long_video.map(Value::from));
    out.extend(extra);
    Ok(out)
}
