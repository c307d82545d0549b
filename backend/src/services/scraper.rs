//! Paginated walk of the YouTube Data API: channels, uploads playlists and
//! video details.
//!
//! Records are validated one by one and handed to [`ScrapeCallbacks`] as soon
//! as they are known; nothing is collected across pages. Invalid records are
//! counted in [`ScrapeStats::skipped`] and never abort a page.

use crate::error::{FetchError, ScraperError};
use crate::fetch::{redact_url, Fetch, FetchRequest, FetchResponse};
use crate::models::{
    LiveStreamingDetails, RemoteChannel, RemotePlaylistItem, RemoteVideo, ScrapedVideo,
    VideoAvailability,
};
use crate::services::classifier::{video_kind, video_status};
use crate::utils::parse_iso8601_timestamp;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::ops::AddAssign;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Page-size ceiling of the remote API, for both ids per lookup and items per page.
pub const MAX_RESULTS: usize = 50;
pub const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/youtube/v3/";
pub const DEFAULT_RECENT_PAGES: usize = 3;

/// Receivers for scraped records. Each call is awaited before the next record
/// is processed.
#[async_trait]
pub trait ScrapeCallbacks: Send + Sync {
    async fn on_channel_scraped(&self, _channel: &RemoteChannel) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_playlist_item_scraped(&self, _item: &RemotePlaylistItem) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_video_scraped(&self, _video: &ScrapedVideo) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_video_checked(&self, _availability: &VideoAvailability) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScrapeStats {
    pub channels: usize,
    pub playlist_items: usize,
    pub videos: usize,
    pub skipped: usize,
}

impl AddAssign for ScrapeStats {
    fn add_assign(&mut self, other: Self) {
        self.channels += other.channels;
        self.playlist_items += other.playlist_items;
        self.videos += other.videos;
        self.skipped += other.skipped;
    }
}

/// How far a playlist walk goes.
#[derive(Debug, Clone, Copy)]
pub enum ScrapeMode<'a> {
    /// Stops after the first page whose items are all in `known_ids`, and
    /// after the scraper's recent page bound in any case.
    Recent { known_ids: &'a HashSet<String> },
    /// Every page to the end.
    All,
}

pub struct YouTubeScraper {
    fetch: Fetch,
    api_key: String,
    base_url: Url,
    recent_pages: usize,
    cancel: CancellationToken,
}

impl YouTubeScraper {
    pub fn new(fetch: Fetch, api_key: Option<String>) -> Result<Self, ScraperError> {
        let api_key = api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or(ScraperError::ApiKey)?;
        let base_url = Url::parse(DEFAULT_BASE_URL)
            .map_err(|e| FetchError::InvalidRequest(format!("base url: {e}")))?;

        Ok(YouTubeScraper {
            fetch,
            api_key,
            base_url,
            recent_pages: DEFAULT_RECENT_PAGES,
            cancel: CancellationToken::new(),
        })
    }

    /// `base_url` should end with a slash; resources are joined onto it.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_recent_pages(mut self, recent_pages: usize) -> Self {
        self.recent_pages = recent_pages.max(1);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn scrape_channels(
        &self,
        channel_ids: &[String],
        callbacks: &dyn ScrapeCallbacks,
    ) -> Result<ScrapeStats, ScraperError> {
        let mut stats = ScrapeStats::default();
        let max_results = MAX_RESULTS.to_string();

        for chunk in channel_ids.chunks(MAX_RESULTS) {
            let ids = chunk.join(",");
            let url = self.endpoint(
                "channels",
                &[
                    ("part", "snippet,contentDetails"),
                    ("id", ids.as_str()),
                    ("maxResults", max_results.as_str()),
                ],
            )?;
            let page = self.get_page(url).await.map_err(|e| match e {
                ScraperError::Fetch(FetchError::NotFound { .. }) => {
                    ScraperError::ChannelNotFound(ids.clone())
                }
                e => e,
            })?;

            for raw in page.items {
                let Some(channel) = parse_record::<ApiChannel>(raw).and_then(ApiChannel::validate)
                else {
                    stats.skipped += 1;
                    continue;
                };
                self.ensure_active()?;
                callbacks
                    .on_channel_scraped(&channel)
                    .await
                    .map_err(ScraperError::Callback)?;
                stats.channels += 1;
            }
        }

        debug!(
            "Scraped {} of {} channels ({} skipped)",
            stats.channels,
            channel_ids.len(),
            stats.skipped
        );
        Ok(stats)
    }

    /// Walks `playlist_id` page by page. Video details for each page are
    /// resolved before the next page is requested and classified against `now`.
    pub async fn scrape_videos(
        &self,
        playlist_id: &str,
        mode: ScrapeMode<'_>,
        now: DateTime<Utc>,
        callbacks: &dyn ScrapeCallbacks,
    ) -> Result<ScrapeStats, ScraperError> {
        let mut stats = ScrapeStats::default();
        let mut page_token: Option<String> = None;
        let mut pages = 0;
        let max_results = MAX_RESULTS.to_string();

        loop {
            let mut params = vec![
                ("part", "contentDetails"),
                ("playlistId", playlist_id),
                ("maxResults", max_results.as_str()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.as_str()));
            }
            let url = self.endpoint("playlistItems", &params)?;
            let page = self.get_page(url).await.map_err(|e| match e {
                ScraperError::Fetch(FetchError::NotFound { .. }) => {
                    ScraperError::PlaylistNotFound(playlist_id.to_string())
                }
                e => e,
            })?;
            pages += 1;

            if page.items.is_empty() {
                break;
            }

            let mut video_ids = Vec::with_capacity(page.items.len());
            for raw in page.items {
                let Some(item) = parse_record::<ApiPlaylistItem>(raw)
                    .and_then(|item| item.validate(playlist_id))
                else {
                    stats.skipped += 1;
                    continue;
                };
                self.ensure_active()?;
                callbacks
                    .on_playlist_item_scraped(&item)
                    .await
                    .map_err(ScraperError::Callback)?;
                stats.playlist_items += 1;
                video_ids.push(item.video_id);
            }

            self.resolve_videos(&video_ids, now, callbacks, &mut stats)
                .await?;

            let Some(next) = page.next_page_token else {
                break;
            };
            if let ScrapeMode::Recent { known_ids } = mode {
                let caught_up =
                    !video_ids.is_empty() && video_ids.iter().all(|id| known_ids.contains(id));
                if caught_up || pages >= self.recent_pages {
                    debug!("Stopping walk of {playlist_id} after {pages} pages (caught up: {caught_up})");
                    break;
                }
            }
            page_token = Some(next);
        }

        debug!(
            "Scraped playlist {playlist_id}: {} items, {} videos, {} skipped",
            stats.playlist_items, stats.videos, stats.skipped
        );
        Ok(stats)
    }

    /// Reports for each id whether the remote side still serves it. A batch
    /// answered with 404 is reported unavailable as a whole.
    pub async fn check_videos(
        &self,
        video_ids: &[String],
        callbacks: &dyn ScrapeCallbacks,
    ) -> Result<ScrapeStats, ScraperError> {
        let mut stats = ScrapeStats::default();

        for chunk in video_ids.chunks(MAX_RESULTS) {
            let ids = chunk.join(",");
            let max_results = chunk.len().to_string();
            let url = self.endpoint(
                "videos",
                &[
                    ("part", "id"),
                    ("id", ids.as_str()),
                    ("maxResults", max_results.as_str()),
                ],
            )?;
            let available: HashSet<String> = match self.get_page(url).await {
                Ok(page) => page
                    .items
                    .iter()
                    .filter_map(|item| item.get("id").and_then(Value::as_str))
                    .map(String::from)
                    .collect(),
                Err(e) => unavailable_batch(video_not_found(e, &ids))?,
            };

            self.report_availability(chunk, &available, callbacks)
                .await?;
            stats.videos += chunk.len();
        }
        Ok(stats)
    }

    /// Re-fetches full details for known ids, then reports availability of
    /// every requested id.
    pub async fn refresh_videos(
        &self,
        video_ids: &[String],
        now: DateTime<Utc>,
        callbacks: &dyn ScrapeCallbacks,
    ) -> Result<ScrapeStats, ScraperError> {
        let mut stats = ScrapeStats::default();

        for chunk in video_ids.chunks(MAX_RESULTS) {
            let available = match self.resolve_videos(chunk, now, callbacks, &mut stats).await {
                Ok(available) => available,
                Err(e) => unavailable_batch(e)?,
            };
            self.report_availability(chunk, &available, callbacks)
                .await?;
        }
        Ok(stats)
    }

    /// Fetches details for `video_ids` and returns the ids the API answered for.
    async fn resolve_videos(
        &self,
        video_ids: &[String],
        now: DateTime<Utc>,
        callbacks: &dyn ScrapeCallbacks,
        stats: &mut ScrapeStats,
    ) -> Result<HashSet<String>, ScraperError> {
        let mut returned = HashSet::new();
        let max_results = MAX_RESULTS.to_string();

        for chunk in video_ids.chunks(MAX_RESULTS) {
            let ids = chunk.join(",");
            let url = self.endpoint(
                "videos",
                &[
                    ("part", "snippet,contentDetails,liveStreamingDetails"),
                    ("id", ids.as_str()),
                    ("maxResults", max_results.as_str()),
                ],
            )?;
            let page = self
                .get_page(url)
                .await
                .map_err(|e| video_not_found(e, &ids))?;

            for raw in page.items {
                if let Some(id) = raw.get("id").and_then(Value::as_str) {
                    returned.insert(id.to_string());
                }
                let Some(video) = parse_record::<ApiVideo>(raw).and_then(ApiVideo::validate)
                else {
                    stats.skipped += 1;
                    continue;
                };
                let scraped = ScrapedVideo {
                    status: video_status(&video, now),
                    kind: video_kind(&video, now),
                    video,
                };
                self.ensure_active()?;
                callbacks
                    .on_video_scraped(&scraped)
                    .await
                    .map_err(ScraperError::Callback)?;
                stats.videos += 1;
            }
        }
        Ok(returned)
    }

    async fn report_availability(
        &self,
        requested: &[String],
        available: &HashSet<String>,
        callbacks: &dyn ScrapeCallbacks,
    ) -> Result<(), ScraperError> {
        for id in requested {
            let availability = VideoAvailability {
                id: id.clone(),
                is_available: available.contains(id),
            };
            self.ensure_active()?;
            callbacks
                .on_video_checked(&availability)
                .await
                .map_err(ScraperError::Callback)?;
        }
        Ok(())
    }

    fn endpoint(&self, resource: &str, params: &[(&str, &str)]) -> Result<Url, ScraperError> {
        let mut url = self
            .base_url
            .join(resource)
            .map_err(|e| FetchError::InvalidRequest(format!("{resource}: {e}")))?;
        url.query_pairs_mut()
            .extend_pairs(params)
            .append_pair("key", &self.api_key);
        Ok(url)
    }

    async fn get_page(&self, url: Url) -> Result<ApiPage, ScraperError> {
        self.ensure_active()?;
        let request = FetchRequest::get(url.clone()).header(ACCEPT, "application/json")?;

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ScraperError::Cancelled),
            response = (self.fetch)(request) => response?,
        };
        let response = check_status(response, &url).await?;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ScraperError::Cancelled),
            page = response.json::<ApiPage>() => page,
        }
    }

    fn ensure_active(&self) -> Result<(), ScraperError> {
        if self.cancel.is_cancelled() {
            return Err(ScraperError::Cancelled);
        }
        Ok(())
    }

}

/// The chain normally turns failures into errors already; this covers
/// transports used without the retry middleware.
async fn check_status(response: FetchResponse, url: &Url) -> Result<FetchResponse, FetchError> {
    if response.is_ok() {
        return Ok(response);
    }
    let FetchResponse {
        status,
        status_text,
        body,
        ..
    } = response;
    body.drain().await?;

    let url = redact_url(url);
    if status == StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound { url });
    }
    Err(FetchError::Status {
        status: status.as_u16(),
        status_text,
        url,
    })
}

fn video_not_found(error: ScraperError, ids: &str) -> ScraperError {
    match error {
        ScraperError::Fetch(FetchError::NotFound { .. }) => {
            ScraperError::VideoNotFound(ids.to_string())
        }
        e => e,
    }
}

/// Not-found answers leave no id available; anything else is returned.
fn unavailable_batch(error: ScraperError) -> Result<HashSet<String>, ScraperError> {
    if !error.is_not_found() {
        return Err(error);
    }
    warn!("{error}, marking the batch unavailable");
    Ok(HashSet::new())
}

fn parse_record<T: DeserializeOwned>(raw: Value) -> Option<T> {
    serde_json::from_value(raw).ok()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiPage {
    #[serde(default)]
    items: Vec<Value>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiChannel {
    id: Option<String>,
    snippet: Option<ApiChannelSnippet>,
    content_details: Option<ApiChannelContentDetails>,
}

#[derive(Debug, Deserialize)]
struct ApiChannelSnippet {
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiChannelContentDetails {
    related_playlists: Option<ApiRelatedPlaylists>,
}

#[derive(Debug, Deserialize)]
struct ApiRelatedPlaylists {
    uploads: Option<String>,
}

impl ApiChannel {
    fn validate(self) -> Option<RemoteChannel> {
        Some(RemoteChannel {
            id: non_empty(self.id)?,
            uploads_playlist_id: non_empty(self.content_details?.related_playlists?.uploads)?,
            title: self.snippet?.title?,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiPlaylistItem {
    content_details: Option<ApiPlaylistItemContentDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiPlaylistItemContentDetails {
    video_id: Option<String>,
    video_published_at: Option<String>,
}

impl ApiPlaylistItem {
    fn validate(self, playlist_id: &str) -> Option<RemotePlaylistItem> {
        let details = self.content_details?;
        Some(RemotePlaylistItem {
            playlist_id: playlist_id.to_string(),
            video_id: non_empty(details.video_id)?,
            video_published_at: details
                .video_published_at
                .as_deref()
                .and_then(parse_iso8601_timestamp),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiVideo {
    id: Option<String>,
    snippet: Option<ApiVideoSnippet>,
    content_details: Option<ApiVideoContentDetails>,
    live_streaming_details: Option<ApiLiveStreamingDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiVideoSnippet {
    published_at: Option<String>,
    title: Option<String>,
    channel_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiVideoContentDetails {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiLiveStreamingDetails {
    scheduled_start_time: Option<String>,
    actual_start_time: Option<String>,
    actual_end_time: Option<String>,
}

impl ApiVideo {
    fn validate(self) -> Option<RemoteVideo> {
        let id = non_empty(self.id)?;
        let content_details = self.content_details?;
        let snippet = self.snippet?;
        let published_at = snippet
            .published_at
            .as_deref()
            .and_then(parse_iso8601_timestamp)?;

        let timestamp = |value: Option<String>| value.as_deref().and_then(parse_iso8601_timestamp);
        let live_streaming_details = self.live_streaming_details.map(|details| LiveStreamingDetails {
            scheduled_start_time: timestamp(details.scheduled_start_time),
            actual_start_time: timestamp(details.actual_start_time),
            actual_end_time: timestamp(details.actual_end_time),
        });

        Some(RemoteVideo {
            id,
            channel_id: snippet.channel_id,
            title: snippet.title.unwrap_or_default(),
            duration: content_details.duration,
            published_at,
            live_streaming_details,
        })
    }
}
