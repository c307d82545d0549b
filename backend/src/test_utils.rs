//! Test doubles shared by unit tests across the crate.

use crate::error::FetchError;
use crate::fetch::{fetch_fn, Fetch, FetchRequest, FetchResponse};
use crate::models::{
    RemoteChannel, RemotePlaylistItem, RemoteVideo, ScrapedVideo, VideoAvailability, VideoKind,
    VideoStatus,
};
use crate::services::ingest::{CatalogueStore, CheckMode};
use crate::services::scraper::ScrapeCallbacks;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

type Responder =
    Box<dyn Fn(&FetchRequest, usize) -> Result<FetchResponse, FetchError> + Send + Sync>;

/// Stand-in for the network: records every request and answers from a closure.
pub struct StubTransport {
    calls: Mutex<Vec<FetchRequest>>,
    responder: Responder,
}

impl StubTransport {
    /// `responder` receives the request and the zero-based call index.
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&FetchRequest, usize) -> Result<FetchResponse, FetchError> + Send + Sync + 'static,
    {
        Arc::new(StubTransport {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        })
    }

    /// Answers with `responses` in order; panics if asked for more.
    pub fn sequence(responses: Vec<FetchResponse>) -> Arc<Self> {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::new(move |request, call| {
            let next = queue.lock().unwrap().pop_front();
            Ok(next.unwrap_or_else(|| {
                panic!("unexpected request #{call} to {}", request.url)
            }))
        })
    }

    pub fn fetch(self: &Arc<Self>) -> Fetch {
        let transport = self.clone();
        fetch_fn(move |request: FetchRequest| {
            let transport = transport.clone();
            async move {
                let call = {
                    let mut calls = transport.calls.lock().unwrap();
                    calls.push(request.clone());
                    calls.len() - 1
                };
                (transport.responder)(&request, call)
            }
        })
    }

    pub fn calls(&self) -> Vec<FetchRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

/// Value of query parameter `name` on a recorded request.
pub fn query_param(request: &FetchRequest, name: &str) -> Option<String> {
    request
        .url
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Records every callback; optionally cancels a token after N playlist items.
#[derive(Default)]
pub struct RecordingCallbacks {
    channels: Mutex<Vec<RemoteChannel>>,
    items: Mutex<Vec<RemotePlaylistItem>>,
    videos: Mutex<Vec<ScrapedVideo>>,
    checked: Mutex<Vec<VideoAvailability>>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl RecordingCallbacks {
    pub fn cancel_after_items(mut self, items: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((items, token));
        self
    }

    pub fn channels(&self) -> Vec<RemoteChannel> {
        self.channels.lock().unwrap().clone()
    }

    pub fn item_ids(&self) -> Vec<String> {
        self.items
            .lock()
            .unwrap()
            .iter()
            .map(|item| item.video_id.clone())
            .collect()
    }

    pub fn videos(&self) -> Vec<ScrapedVideo> {
        self.videos.lock().unwrap().clone()
    }

    pub fn video_ids(&self) -> Vec<String> {
        self.videos().into_iter().map(|v| v.video.id).collect()
    }

    pub fn checked(&self) -> Vec<VideoAvailability> {
        self.checked.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScrapeCallbacks for RecordingCallbacks {
    async fn on_channel_scraped(&self, channel: &RemoteChannel) -> anyhow::Result<()> {
        self.channels.lock().unwrap().push(channel.clone());
        Ok(())
    }

    async fn on_playlist_item_scraped(&self, item: &RemotePlaylistItem) -> anyhow::Result<()> {
        let count = {
            let mut items = self.items.lock().unwrap();
            items.push(item.clone());
            items.len()
        };
        if let Some((limit, token)) = &self.cancel_after {
            if count >= *limit {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn on_video_scraped(&self, video: &ScrapedVideo) -> anyhow::Result<()> {
        self.videos.lock().unwrap().push(video.clone());
        Ok(())
    }

    async fn on_video_checked(&self, availability: &VideoAvailability) -> anyhow::Result<()> {
        self.checked.lock().unwrap().push(availability.clone());
        Ok(())
    }
}

/// A classified video published at a fixed instant.
pub fn scraped_video(id: &str, status: VideoStatus) -> ScrapedVideo {
    ScrapedVideo {
        video: RemoteVideo {
            id: id.to_string(),
            channel_id: Some("c1".to_string()),
            title: id.to_string(),
            duration: Some("PT10M".to_string()),
            published_at: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            live_streaming_details: None,
        },
        status,
        kind: VideoKind::Standard,
    }
}

/// Catalogue kept in memory.
#[derive(Default)]
pub struct MemoryCatalogue {
    channel_ids: Mutex<Vec<String>>,
    channels: Mutex<Vec<RemoteChannel>>,
    videos: Mutex<BTreeMap<String, ScrapedVideo>>,
    availability: Mutex<HashMap<String, bool>>,
}

impl MemoryCatalogue {
    pub fn with_channels(ids: &[&str]) -> Self {
        let catalogue = Self::default();
        *catalogue.channel_ids.lock().unwrap() = ids.iter().map(|id| id.to_string()).collect();
        catalogue
    }

    pub fn insert_video(&self, video: ScrapedVideo) {
        self.videos
            .lock()
            .unwrap()
            .insert(video.video.id.clone(), video);
    }

    pub fn channels(&self) -> Vec<RemoteChannel> {
        self.channels.lock().unwrap().clone()
    }

    pub fn video_ids(&self) -> Vec<String> {
        self.videos.lock().unwrap().keys().cloned().collect()
    }

    pub fn video(&self, id: &str) -> Option<ScrapedVideo> {
        self.videos.lock().unwrap().get(id).cloned()
    }

    pub fn availability(&self, id: &str) -> Option<bool> {
        self.availability.lock().unwrap().get(id).copied()
    }
}

#[async_trait]
impl CatalogueStore for MemoryCatalogue {
    async fn list_channel_ids(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.channel_ids.lock().unwrap().clone())
    }

    async fn upsert_channel(&self, channel: &RemoteChannel) -> anyhow::Result<()> {
        let mut channels = self.channels.lock().unwrap();
        channels.retain(|existing| existing.id != channel.id);
        channels.push(channel.clone());
        Ok(())
    }

    async fn known_video_ids(&self, channel_id: &str) -> anyhow::Result<HashSet<String>> {
        Ok(self
            .videos
            .lock()
            .unwrap()
            .values()
            .filter(|v| v.video.channel_id.as_deref() == Some(channel_id))
            .map(|v| v.video.id.clone())
            .collect())
    }

    async fn upsert_video(&self, video: &ScrapedVideo) -> anyhow::Result<()> {
        self.insert_video(video.clone());
        Ok(())
    }

    async fn video_ids_to_check(&self, mode: CheckMode) -> anyhow::Result<Vec<String>> {
        let videos = self.videos.lock().unwrap();
        let ids = match mode {
            CheckMode::Live => videos
                .values()
                .filter(|v| matches!(v.status, VideoStatus::Live | VideoStatus::Upcoming))
                .map(|v| v.video.id.clone())
                .collect(),
            CheckMode::Recent => {
                let mut recent: Vec<&ScrapedVideo> = videos.values().collect();
                recent.sort_by(|a, b| b.video.published_at.cmp(&a.video.published_at));
                recent
                    .into_iter()
                    .take(100)
                    .map(|v| v.video.id.clone())
                    .collect()
            }
            CheckMode::All => videos.keys().cloned().collect(),
        };
        Ok(ids)
    }

    async fn set_video_availability(&self, availability: &VideoAvailability) -> anyhow::Result<()> {
        self.availability
            .lock()
            .unwrap()
            .insert(availability.id.clone(), availability.is_available);
        Ok(())
    }
}
