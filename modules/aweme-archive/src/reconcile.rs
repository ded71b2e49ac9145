//! Cross-source reconciliation of cached post payloads.
//!
//! The timeline listing and the detail page describe the same post with
//! slightly different payloads. The detail page is authoritative; the
//! timeline copy is kept to catch upstream changes the moment they appear.

use std::collections::BTreeSet;

use chrono::SecondsFormat;
use serde_json::Value;
use tracing::debug;

use crate::cache::CacheRecord;
use crate::decode::decode_post;
use crate::error::{ArchiveError, Result};
use crate::record::CanonicalRecord;
use crate::schema::EntitySchema;

/// Fields that legitimately differ between any two fetches (signed CDN
/// links and the source tag).
const UNSTABLE: &[&str] = &["img_urls", "video_url", "source"];

/// Fields the detail page carries and the timeline may not, while a video
/// is still being transcoded.
const PAGE_ONLY: &[&str] = &["content_size", "content_hash"];

/// Numeric fields the detail page may report higher than the timeline.
const IMPROVING: &[&str] = &["duration", "bit_rate", "height", "width", "fps"];

/// Labels that follow the final transcode and may change freely while the
/// timeline copy is still unfinished.
const RELABEL: &[&str] = &["gear_name", "ratio"];

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    Complete(CanonicalRecord),
    /// Only an unfinished timeline copy exists; fetch the detail page and
    /// reconcile again.
    NeedsRefetch { id: u64 },
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    volatile: BTreeSet<String>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::for_schema(&EntitySchema::posts())
    }
}

impl Reconciler {
    /// Counters the schema treats as volatile are not compared across
    /// sources.
    pub fn for_schema(schema: &EntitySchema) -> Self {
        Self {
            volatile: schema.volatile.clone(),
        }
    }

    /// Verify that the two cached sources agree. A record with a single
    /// source always passes.
    pub fn check(&self, cache: &CacheRecord) -> Result<()> {
        if let (Some(timeline), Some(page)) = (&cache.from_timeline, &cache.from_page) {
            self.compare(&decode_post(timeline)?, &decode_post(page)?)?;
        }
        Ok(())
    }

    pub fn reconcile(&self, cache: &CacheRecord) -> Result<Reconciled> {
        let mut record = match (&cache.from_timeline, &cache.from_page) {
            (timeline, Some(page)) => {
                let page = decode_post(page)?;
                if let Some(timeline) = timeline {
                    self.compare(&decode_post(timeline)?, &page)?;
                }
                if page.is_video() && page.content_hash().is_none() {
                    return Err(ArchiveError::drift(
                        "post",
                        cache.id,
                        "content_hash",
                        "detail page of a video has no hash",
                    ));
                }
                page
            }
            (Some(timeline), None) => {
                let timeline = decode_post(timeline)?;
                if timeline.is_unfinished_video() {
                    debug!(post = cache.id, "timeline copy is unfinished, page needed");
                    return Ok(Reconciled::NeedsRefetch { id: cache.id });
                }
                timeline
            }
            (None, None) => {
                return Err(ArchiveError::drift("post", cache.id, "cache", "no source cached"));
            }
        };
        record.fields.insert(
            "updated_at".to_string(),
            Value::from(cache.updated_at.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        Ok(Reconciled::Complete(record))
    }

    /// Volatile counters are skipped; they move between any two fetches.
    fn compare(&self, timeline: &CanonicalRecord, page: &CanonicalRecord) -> Result<()> {
        let id = page.id;
        let skip = |k: &str| UNSTABLE.contains(&k) || self.volatile.contains(k);

        let timeline_keys: BTreeSet<&str> =
            timeline.fields.keys().map(String::as_str).filter(|k| !skip(k)).collect();
        let page_keys: BTreeSet<&str> =
            page.fields.keys().map(String::as_str).filter(|k| !skip(k)).collect();

        if let Some(missing) = timeline_keys.difference(&page_keys).next() {
            return Err(inconsistent(id, missing, timeline.get(missing), None));
        }
        if let Some(extra) = page_keys
            .difference(&timeline_keys)
            .find(|k| !PAGE_ONLY.contains(k))
        {
            return Err(inconsistent(id, extra, None, page.get(extra)));
        }

        let unfinished = timeline.content_hash().is_none();
        for key in &timeline_keys {
            let (old, new) = (timeline.get(key), page.get(key));
            if old == new {
                continue;
            }
            let allowed = if IMPROVING.contains(key) {
                matches!(
                    (old.and_then(Value::as_f64), new.and_then(Value::as_f64)),
                    (Some(t), Some(p)) if p >= t
                )
            } else {
                RELABEL.contains(key) && unfinished
            };
            if !allowed {
                return Err(inconsistent(id, key, old, new));
            }
            debug!(post = id, field = *key, "page value supersedes timeline");
        }
        Ok(())
    }
}

fn inconsistent(id: u64, field: &str, timeline: Option<&Value>, page: Option<&Value>) -> ArchiveError {
    let show = |v: Option<&Value>| v.map_or_else(|| "<absent>".to_string(), Value::to_string);
    ArchiveError::Inconsistent {
        id,
        field: field.to_string(),
        timeline: show(timeline),
        page: show(page),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{image_post, poi_anchor, raw, video_post};
    use aweme_common::Source;
    use chrono::Utc;
    use serde_json::json;

    fn both(timeline: Value, page: Value) -> CacheRecord {
        let now = Utc::now();
        let mut cache = CacheRecord::new(raw(Source::Timeline, timeline), now).unwrap();
        cache.absorb(raw(Source::Page, page), now).unwrap();
        cache
    }

    fn complete(r: Reconciled) -> CanonicalRecord {
        match r {
            Reconciled::Complete(rec) => rec,
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn improved_duration_takes_page_value() {
        let timeline = video_post(1, Some("h"));
        let mut page = video_post(1, Some("h"));
        page["video"]["duration"] = json!(15_100);
        page["duration"] = json!(15_100);

        let rec = complete(Reconciler::default().reconcile(&both(timeline, page)).unwrap());
        assert_eq!(rec.i64_field("duration"), Some(15_100));
    }

    #[test]
    fn shrinking_duration_is_inconsistent() {
        let timeline = video_post(1, Some("h"));
        let mut page = video_post(1, Some("h"));
        page["video"]["duration"] = json!(100);
        page["duration"] = json!(100);

        let err = Reconciler::default().reconcile(&both(timeline, page)).unwrap_err();
        assert!(matches!(err, ArchiveError::Inconsistent { ref field, .. } if field == "duration"));
    }

    #[test]
    fn unlisted_field_difference_is_inconsistent() {
        let timeline = video_post(1, Some("h"));
        let mut page = video_post(1, Some("h"));
        page["region"] = json!("JP");

        let err = Reconciler::default().reconcile(&both(timeline, page)).unwrap_err();
        assert!(matches!(err, ArchiveError::Inconsistent { ref field, .. } if field == "region"));
    }

    #[test]
    fn page_only_hash_is_allowed() {
        let rec = complete(
            Reconciler::default()
                .reconcile(&both(video_post(1, None), video_post(1, Some("h"))))
                .unwrap(),
        );
        assert_eq!(rec.content_hash(), Some("h"));
        assert_eq!(rec.str_field("source"), Some("page"));
    }

    #[test]
    fn relabel_only_while_unfinished() {
        let mut page = video_post(1, Some("h"));
        page["video"]["bit_rate"][0]["gear_name"] = json!("adapt_1080");
        assert!(Reconciler::default()
            .reconcile(&both(video_post(1, None), page.clone()))
            .is_ok());
        assert!(Reconciler::default()
            .reconcile(&both(video_post(1, Some("h")), page))
            .is_err());
    }

    #[test]
    fn volatile_counters_are_not_compared() {
        let timeline = video_post(1, Some("h"));
        let mut page = video_post(1, Some("h"));
        page["statistics"]["digg_count"] = json!(99_999);
        assert!(Reconciler::default().reconcile(&both(timeline, page)).is_ok());
    }

    #[test]
    fn signed_links_may_differ() {
        let timeline = image_post(2, 2);
        let mut page = image_post(2, 2);
        page["images"][0]["url_list"] = json!(["https://p9.douyinpic.com/img/2-0~tplv.webp?x=2"]);
        assert!(Reconciler::default().reconcile(&both(timeline, page)).is_ok());
    }

    #[test]
    fn unfinished_timeline_video_needs_refetch_then_completes() {
        let now = Utc::now();
        let reconciler = Reconciler::default();
        let mut cache = CacheRecord::new(raw(Source::Timeline, video_post(7, None)), now).unwrap();

        assert_eq!(reconciler.reconcile(&cache).unwrap(), Reconciled::NeedsRefetch { id: 7 });

        cache.absorb(raw(Source::Page, video_post(7, Some("abc"))), now).unwrap();
        let rec = complete(reconciler.reconcile(&cache).unwrap());
        assert_eq!(rec.content_hash(), Some("abc"));
        assert!(rec.str_field("updated_at").is_some());
    }

    #[test]
    fn timeline_video_without_size_needs_refetch() {
        let mut body = video_post(8, Some("abc"));
        body["video"]["bit_rate"][0]["play_addr"]
            .as_object_mut()
            .unwrap()
            .remove("data_size");
        let cache = CacheRecord::new(raw(Source::Timeline, body), Utc::now()).unwrap();
        assert_eq!(
            Reconciler::default().reconcile(&cache).unwrap(),
            Reconciled::NeedsRefetch { id: 8 }
        );
    }

    #[test]
    fn location_must_agree_across_sources() {
        let mut timeline = video_post(1, Some("h"));
        timeline["anchor_info"] = poi_anchor(9, "Cafe", None);
        let mut page = video_post(1, Some("h"));
        page["anchor_info"] = poi_anchor(9, "Cafe", None);
        let rec = complete(Reconciler::default().reconcile(&both(timeline.clone(), page)).unwrap());
        assert_eq!(rec.str_field("location"), Some("Cafe"));

        let err = Reconciler::default()
            .reconcile(&both(timeline, video_post(1, Some("h"))))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Inconsistent { .. }));
    }

    #[test]
    fn image_post_from_timeline_is_complete() {
        let cache = CacheRecord::new(raw(Source::Timeline, image_post(3, 1)), Utc::now()).unwrap();
        let rec = complete(Reconciler::default().reconcile(&cache).unwrap());
        assert!(!rec.is_video());
    }

    #[test]
    fn page_video_without_hash_is_drift() {
        let cache = CacheRecord::new(raw(Source::Page, video_post(4, None)), Utc::now()).unwrap();
        let err = Reconciler::default().reconcile(&cache).unwrap_err();
        assert!(matches!(err, ArchiveError::SchemaDrift { ref field, .. } if field == "content_hash"));
    }

    #[test]
    fn reconcile_is_pure() {
        let cache = both(video_post(1, Some("h")), video_post(1, Some("h")));
        let r = Reconciler::default();
        assert_eq!(r.reconcile(&cache).unwrap(), r.reconcile(&cache).unwrap());
    }
}
