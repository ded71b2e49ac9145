//! Payload fixtures and a scripted media fetcher for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use aweme_client::TransportError;
use aweme_common::{RawItem, Source};
use serde_json::{json, Value};

use crate::media::{MediaBody, MediaFetcher};

pub const AUTHOR_UID: u64 = 42;
pub const AUTHOR_SEC_UID: &str = "MS4wAuthor";

/// Wrap a fixture body as a raw item from `source`.
pub fn raw(source: Source, body: Value) -> RawItem {
    let body = body.as_object().cloned().expect("fixture must be an object");
    RawItem::new(source, body).expect("fixture must carry aweme_id")
}

fn base_post(id: u64) -> Value {
    json!({
        "aweme_id": id.to_string(),
        "author_user_id": AUTHOR_UID,
        "author": {
            "uid": AUTHOR_UID.to_string(),
            "sec_uid": AUTHOR_SEC_UID,
            "nickname": "_cat_",
            "avatar_thumb": {"url_list": ["https://p3.douyinpic.com/thumb.jpeg"]},
        },
        "create_time": 1_700_000_000,
        "desc": "hello #cats @friend ",
        "region": "CN",
        "aweme_type": 0,
        "is_top": 0,
        "text_extra": [
            {"start": 6, "end": 11, "type": 1, "hashtag_name": "cats"},
            {"start": 12, "end": 19, "type": 0, "sec_uid": "MS4wFriend"},
            {"start": 0, "end": 5},
        ],
        "video_tag": [{"tag_name": "pets", "level": 1}, {"tag_name": "", "level": 2}],
        "statistics": {
            "aweme_id": id.to_string(),
            "admire_count": 0,
            "collect_count": 2,
            "comment_count": 1,
            "digg_count": 10,
            "play_count": 0,
            "share_count": 0,
        },
        "is_life_item": false,
        "is_story": 0,
        "share_info": {"share_url": "https://www.iesdouyin.com/share/video/x"},
        "status": {"is_delete": false, "private_status": 0},
    })
}

/// A video post. Without a hash the payload looks like an unfinished
/// transcode: no file hash and no data size.
pub fn video_post(id: u64, hash: Option<&str>) -> Value {
    let mut post = base_post(id);
    let uri = format!("v0200fg10000{id}");
    let mut play_addr = json!({
        "uri": uri,
        "url_list": [
            format!("https://v3-web.douyinvod.com/{uri}/"),
            format!("https://www.douyin.com/aweme/v1/play/?video_id={uri}"),
        ],
        "width": 1080,
        "height": 1920,
    });
    if let Some(hash) = hash {
        play_addr["file_hash"] = json!(hash);
        play_addr["data_size"] = json!(4096);
    }
    post["media_type"] = json!(4);
    post["duration"] = json!(15_000);
    post["images"] = Value::Null;
    post["video"] = json!({
        "duration": 15_000,
        "ratio": "1080p",
        "play_addr": {"uri": uri},
        "bit_rate": [
            {
                "bit_rate": 1_500_000,
                "gear_name": "normal_1080_0",
                "FPS": 30,
                "is_h265": 0,
                "is_bytevc1": 1,
                "is_source_HDR": 0,
                "format": "mp4",
                "play_addr": play_addr,
            },
            {
                "bit_rate": 800_000,
                "gear_name": "normal_720_0",
                "FPS": 30,
                "format": "mp4",
                "play_addr": {"uri": uri, "url_list": []},
            },
        ],
    });
    post
}

/// An image post with `count` images.
pub fn image_post(id: u64, count: usize) -> Value {
    let mut post = base_post(id);
    let images: Vec<Value> = (0..count)
        .map(|i| {
            let uri = format!("tos-cn-i-0813/img{id}x{i}");
            json!({
                "uri": uri,
                "url_list": [format!("https://p3-pc-sign.douyinpic.com/{uri}~tplv-dy-aweme-images.webp?x-expires=1")],
                "width": 1080,
                "height": 1440,
            })
        })
        .collect();
    post["images"] = Value::Array(images);
    post["media_type"] = json!(2);
    post["duration"] = json!(0);
    post
}

/// An `anchor_info` block tagging a place. Coordinates arrive as strings.
pub fn poi_anchor(poi_id: u64, name: &str, prefix: Option<&str>) -> Value {
    let ext = json!({"item_ext": {"anchor_info": {"type_name": prefix}}});
    let extra = json!({
        "address_info": {"province": "上海", "city": "上海", "country": "中国"},
        "poi_id": poi_id.to_string(),
        "poi_name": name,
        "poi_longitude": "121.4737",
        "poi_latitude": "31.2304",
        "ext_json": ext.to_string(),
    });
    json!({"type": 0, "title": name, "extra": extra.to_string()})
}

/// A profile object as found under `user` in the profile endpoint.
pub fn user_profile(uid: u64, sec_uid: &str) -> Value {
    json!({
        "uid": uid.to_string(),
        "sec_uid": sec_uid,
        "unique_id": "catlover",
        "short_id": "0",
        "nickname": "_cat_",
        "signature": "meow",
        "gender": 2,
        "avatar_larger": {"url_list": ["https://p3.douyinpic.com/avatar.jpeg?from=profile"]},
        "avatar_thumb": {"url_list": ["https://p3.douyinpic.com/thumb.jpeg"]},
        "ip_location": "IP属地：上海",
        "user_age": -1,
        "birthday_hide_level": 0,
        "follow_status": 1,
        "follower_status": 0,
        "following_count": 10,
        "follower_count": 100,
        "max_follower_count": 100,
        "aweme_count": 5,
        "total_favorited": 1000,
        "show_favorite_list": true,
        "favorite_permission": 0,
        "general_permission": {"following_follower_list_toast": 1},
        "share_info": {"share_url": "x"},
        "live_status": 0,
        "room_id": 0,
        "is_top": 0,
        "is_star": false,
    })
}

// ---------------------------------------------------------------------------
// ScriptedMediaFetcher
// ---------------------------------------------------------------------------

type Reply = std::result::Result<MediaBody, TransportError>;

/// Media replies keyed by exact URL, consumed in order. The last reply for a
/// URL repeats once the queue drains; unknown URLs get a 404.
#[derive(Default)]
pub struct ScriptedMediaFetcher {
    replies: Mutex<Vec<(String, VecDeque<Reply>)>>,
    requests: Mutex<Vec<String>>,
}

impl ScriptedMediaFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, url: &str, reply: Reply) -> Self {
        {
            let mut replies = self.replies.lock().unwrap();
            match replies.iter_mut().find(|(u, _)| u == url) {
                Some((_, queue)) => queue.push_back(reply),
                None => replies.push((url.to_string(), VecDeque::from([reply]))),
            }
        }
        self
    }

    /// A well-formed 200 with a matching Content-Length.
    pub fn serve(self, url: &str, bytes: &[u8]) -> Self {
        let body = MediaBody {
            status: 200,
            content_length: Some(bytes.len() as u64),
            bytes: bytes.to_vec(),
        };
        self.push(url, Ok(body))
    }

    pub fn reply(self, url: &str, body: MediaBody) -> Self {
        self.push(url, Ok(body))
    }

    pub fn fail(self, url: &str, error: TransportError) -> Self {
        self.push(url, Err(error))
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, url: &str) -> usize {
        self.requests().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl MediaFetcher for ScriptedMediaFetcher {
    async fn fetch(&self, url: &str) -> Reply {
        self.requests.lock().unwrap().push(url.to_string());
        let mut replies = self.replies.lock().unwrap();
        let Some((_, queue)) = replies.iter_mut().find(|(u, _)| u == url) else {
            return Ok(MediaBody {
                status: 404,
                content_length: Some(0),
                bytes: Vec::new(),
            });
        };
        if queue.len() > 1 {
            if let Some(reply) = queue.pop_front() {
                return reply;
            }
        }
        queue.back().cloned().unwrap_or(Ok(MediaBody {
            status: 404,
            content_length: Some(0),
            bytes: Vec::new(),
        }))
    }
}
