use crate::models::{RemoteChannel, ScrapedVideo, VideoAvailability, VideoStatus};
use crate::services::ingest::{CatalogueStore, CheckMode};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use elasticsearch::http::response::Response;
use elasticsearch::{indices::IndicesCreateParts, Elasticsearch, SearchParts, UpdateParts};
use log::{error, info};
use serde_json::{json, Value};
use std::collections::HashSet;

pub const CHANNELS_INDEX: &str = "monitored_channels";
pub const VIDEOS_INDEX: &str = "youtube_videos";

const RECENT_CHECK_SIZE: usize = 100;
/// Hits per request when walking a whole index with `search_after`.
const PAGE_SIZE: usize = 1000;
const KNOWN_IDS_SIZE: usize = 500;

pub async fn create_es_indices(es_client: &Elasticsearch) {
    create_es_index(
        es_client,
        CHANNELS_INDEX,
        json!({
            "mappings": {
                "properties": {
                    "channel_id": { "type": "keyword" },
                    "channel_name": { "type": "text" },
                    "uploads_playlist_id": { "type": "keyword" },
                    "active": { "type": "boolean" },
                    "updated_at": { "type": "date" }
                }
            }
        }),
    )
    .await;
    create_es_index(
        es_client,
        VIDEOS_INDEX,
        json!({
            "mappings": {
                "properties": {
                    "video_id": { "type": "keyword" },
                    "channel_id": { "type": "keyword" },
                    "title": { "type": "text" },
                    "duration": { "type": "keyword" },
                    "published_at": { "type": "date" },
                    "scheduled_start_time": { "type": "date" },
                    "actual_start_time": { "type": "date" },
                    "actual_end_time": { "type": "date" },
                    "status": { "type": "keyword" },
                    "kind": { "type": "keyword" },
                    "is_available": { "type": "boolean" },
                    "updated_at": { "type": "date" }
                }
            }
        }),
    )
    .await;
}

async fn create_es_index(es_client: &Elasticsearch, index: &str, body: Value) {
    match es_client
        .indices()
        .create(IndicesCreateParts::Index(index))
        .body(body)
        .send()
        .await
    {
        Ok(response) => {
            if response.status_code().is_success() {
                info!("Elasticsearch index '{index}' created.");
            } else {
                let response_text = response.text().await.unwrap_or_default();
                if response_text.contains("resource_already_exists_exception") {
                    info!("Elasticsearch index '{index}' already exists.");
                } else {
                    error!("Failed to create Elasticsearch index '{index}': {response_text}");
                }
            }
        }
        Err(e) => {
            error!("Failed to connect to Elasticsearch to create index '{index}': {e:?}");
        }
    }
}

/// Channels and videos kept in Elasticsearch.
#[derive(Clone)]
pub struct ElasticsearchCatalogue {
    es_client: Elasticsearch,
}

impl ElasticsearchCatalogue {
    pub fn new(es_client: Elasticsearch) -> Self {
        ElasticsearchCatalogue { es_client }
    }

    /// Collects every hit of `body`, at most `limit`. `body` must carry a
    /// `sort` ending in a unique field so pages can resume with `search_after`.
    async fn search_all(
        &self,
        index: &str,
        body: Value,
        limit: Option<usize>,
    ) -> Result<Vec<Value>> {
        let mut hits = Vec::new();
        let mut after: Option<Value> = None;

        loop {
            let remaining = limit.map_or(PAGE_SIZE, |limit| limit - hits.len());
            let size = remaining.min(PAGE_SIZE);
            let page = self
                .search(index, page_body(&body, size, after.as_ref()))
                .await?;
            let fetched = page.len();
            after = page.last().map(|hit| hit["sort"].clone());
            hits.extend(page);

            let full = limit.is_some_and(|limit| hits.len() >= limit);
            if fetched < size || full || after.is_none() {
                break;
            }
        }
        Ok(hits)
    }

    async fn search(&self, index: &str, body: Value) -> Result<Vec<Value>> {
        let response = self
            .es_client
            .search(SearchParts::Index(&[index]))
            .body(body)
            .send()
            .await?;
        let response_body: Value = ensure_success(response, index).await?.json().await?;
        Ok(response_body["hits"]["hits"]
            .as_array()
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert(&self, index: &str, id: &str, doc: Value) -> Result<()> {
        let response = self
            .es_client
            .update(UpdateParts::IndexId(index, id))
            .body(json!({ "doc": doc, "doc_as_upsert": true }))
            .send()
            .await?;
        ensure_success(response, index).await?;
        Ok(())
    }
}

async fn ensure_success(response: Response, index: &str) -> Result<Response> {
    let status = response.status_code();
    if status.is_success() {
        return Ok(response);
    }
    let response_text = response.text().await.unwrap_or_default();
    bail!("Elasticsearch request on '{index}' failed with {status}: {response_text}")
}

fn page_body(body: &Value, size: usize, after: Option<&Value>) -> Value {
    let mut page = body.clone();
    page["size"] = json!(size);
    if let Some(after) = after {
        page["search_after"] = after.clone();
    }
    page
}

fn hit_ids(hits: &[Value]) -> Vec<String> {
    hits.iter()
        .filter_map(|hit| hit["_id"].as_str())
        .map(String::from)
        .collect()
}

fn channel_document(channel: &RemoteChannel) -> Value {
    json!({
        "channel_id": channel.id,
        "channel_name": channel.title,
        "uploads_playlist_id": channel.uploads_playlist_id,
        "updated_at": Utc::now().to_rfc3339(),
    })
}

fn video_document(video: &ScrapedVideo) -> Value {
    let details = video.video.live_streaming_details.clone().unwrap_or_default();
    json!({
        "video_id": video.video.id,
        "channel_id": video.video.channel_id,
        "title": video.video.title,
        "duration": video.video.duration,
        "published_at": video.video.published_at.to_rfc3339(),
        "scheduled_start_time": details.scheduled_start_time.map(|t| t.to_rfc3339()),
        "actual_start_time": details.actual_start_time.map(|t| t.to_rfc3339()),
        "actual_end_time": details.actual_end_time.map(|t| t.to_rfc3339()),
        "status": video.status,
        "kind": video.kind,
        "is_available": true,
        "updated_at": Utc::now().to_rfc3339(),
    })
}

/// Newest first, with the video id breaking ties so `search_after` is stable.
fn video_sort() -> Value {
    json!([
        { "published_at": { "order": "desc" } },
        { "video_id": { "order": "asc" } }
    ])
}

fn check_query(mode: CheckMode) -> Value {
    let available = json!({ "term": { "is_available": true } });
    let query = match mode {
        CheckMode::Live => json!({
            "bool": {
                "filter": [
                    available,
                    { "terms": { "status": [VideoStatus::Live, VideoStatus::Upcoming] } }
                ]
            }
        }),
        CheckMode::Recent => json!({ "match_all": {} }),
        CheckMode::All => json!({ "bool": { "filter": [available] } }),
    };
    json!({ "query": query, "sort": video_sort(), "_source": false })
}

fn check_limit(mode: CheckMode) -> Option<usize> {
    match mode {
        CheckMode::Recent => Some(RECENT_CHECK_SIZE),
        CheckMode::Live | CheckMode::All => None,
    }
}

#[async_trait]
impl CatalogueStore for ElasticsearchCatalogue {
    async fn list_channel_ids(&self) -> Result<Vec<String>> {
        let hits = self
            .search_all(
                CHANNELS_INDEX,
                json!({
                    "query": {
                        "bool": { "must_not": [{ "term": { "active": false } }] }
                    },
                    "sort": [{ "channel_id": { "order": "asc" } }]
                }),
                None,
            )
            .await?;

        let ids: Vec<String> = hits
            .iter()
            .filter_map(|hit| {
                hit["_source"]["channel_id"]
                    .as_str()
                    .or_else(|| hit["_id"].as_str())
            })
            .map(String::from)
            .collect();
        info!("Loaded {} monitored channels", ids.len());
        Ok(ids)
    }

    async fn upsert_channel(&self, channel: &RemoteChannel) -> Result<()> {
        self.upsert(CHANNELS_INDEX, &channel.id, channel_document(channel))
            .await
    }

    async fn known_video_ids(&self, channel_id: &str) -> Result<HashSet<String>> {
        let hits = self
            .search(
                VIDEOS_INDEX,
                json!({
                    "query": { "term": { "channel_id": channel_id } },
                    "sort": [{ "published_at": { "order": "desc" } }],
                    "_source": false,
                    "size": KNOWN_IDS_SIZE
                }),
            )
            .await?;
        Ok(hit_ids(&hits).into_iter().collect())
    }

    async fn upsert_video(&self, video: &ScrapedVideo) -> Result<()> {
        self.upsert(VIDEOS_INDEX, &video.video.id, video_document(video))
            .await
    }

    async fn video_ids_to_check(&self, mode: CheckMode) -> Result<Vec<String>> {
        let hits = self
            .search_all(VIDEOS_INDEX, check_query(mode), check_limit(mode))
            .await?;
        Ok(hit_ids(&hits))
    }

    async fn set_video_availability(&self, availability: &VideoAvailability) -> Result<()> {
        self.upsert(
            VIDEOS_INDEX,
            &availability.id,
            json!({
                "is_available": availability.is_available,
                "updated_at": Utc::now().to_rfc3339(),
            }),
        )
        .await
    }
}
