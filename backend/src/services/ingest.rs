use crate::models::{RemoteChannel, RunReport, ScrapedVideo, VideoAvailability};
use crate::services::ratelimit::{FixedWindowRateLimiter, JobKind, RateLimitOutcome};
use crate::services::scraper::{ScrapeCallbacks, ScrapeMode, ScrapeStats, YouTubeScraper};
use crate::error::ScraperError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Source of the instant a run classifies against.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Which stored videos a check run revisits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckMode {
    /// Videos stored as UPCOMING or LIVE.
    Live,
    /// The most recently published videos.
    Recent,
    /// Every stored video, availability only.
    All,
}

impl CheckMode {
    pub fn job(&self) -> JobKind {
        match self {
            CheckMode::Live => JobKind::VideosCheck,
            CheckMode::Recent => JobKind::VideosCheckRecent,
            CheckMode::All => JobKind::VideosCheckAll,
        }
    }

    /// Parses the `mode` query value; no value means [`CheckMode::Live`].
    pub fn from_param(mode: Option<&str>) -> Option<Self> {
        match mode {
            None => Some(CheckMode::Live),
            Some("recent") => Some(CheckMode::Recent),
            Some("all") => Some(CheckMode::All),
            Some(_) => None,
        }
    }
}

/// Where scraped channels and videos are kept.
#[async_trait]
pub trait CatalogueStore: Send + Sync {
    async fn list_channel_ids(&self) -> Result<Vec<String>>;

    async fn upsert_channel(&self, channel: &RemoteChannel) -> Result<()>;

    /// Ids of the videos already stored for `channel_id`.
    async fn known_video_ids(&self, channel_id: &str) -> Result<HashSet<String>>;

    async fn upsert_video(&self, video: &ScrapedVideo) -> Result<()>;

    async fn video_ids_to_check(&self, mode: CheckMode) -> Result<Vec<String>>;

    async fn set_video_availability(&self, availability: &VideoAvailability) -> Result<()>;
}

/// Forwards scraped records into a [`CatalogueStore`].
struct CatalogueWriter<'a> {
    store: &'a dyn CatalogueStore,
    upsert_channels: bool,
    channels: Mutex<Vec<RemoteChannel>>,
    unavailable: AtomicUsize,
}

impl<'a> CatalogueWriter<'a> {
    fn new(store: &'a dyn CatalogueStore, upsert_channels: bool) -> Self {
        CatalogueWriter {
            store,
            upsert_channels,
            channels: Mutex::new(Vec::new()),
            unavailable: AtomicUsize::new(0),
        }
    }

    fn take_channels(&self) -> Vec<RemoteChannel> {
        self.channels
            .lock()
            .map(|mut channels| std::mem::take(&mut *channels))
            .unwrap_or_default()
    }

    fn unavailable(&self) -> usize {
        self.unavailable.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ScrapeCallbacks for CatalogueWriter<'_> {
    async fn on_channel_scraped(&self, channel: &RemoteChannel) -> Result<()> {
        if self.upsert_channels {
            self.store.upsert_channel(channel).await?;
        }
        self.channels
            .lock()
            .map_err(|_| anyhow!("channel list lock poisoned"))?
            .push(channel.clone());
        Ok(())
    }

    async fn on_video_scraped(&self, video: &ScrapedVideo) -> Result<()> {
        debug!(
            "Video {} is {} ({})",
            video.video.id, video.status, video.kind
        );
        self.store.upsert_video(video).await
    }

    async fn on_video_checked(&self, availability: &VideoAvailability) -> Result<()> {
        if !availability.is_available {
            debug!("Video {} is no longer available", availability.id);
            self.unavailable.fetch_add(1, Ordering::Relaxed);
        }
        self.store.set_video_availability(availability).await
    }
}

/// The ingestion jobs, each a single run over the stored catalogue.
pub struct Ingestor {
    scraper: Arc<YouTubeScraper>,
    store: Arc<dyn CatalogueStore>,
    concurrency: usize,
    clock: Clock,
}

impl Ingestor {
    pub fn new(scraper: Arc<YouTubeScraper>, store: Arc<dyn CatalogueStore>) -> Self {
        Ingestor {
            scraper,
            store,
            concurrency: DEFAULT_CONCURRENCY,
            clock: Arc::new(Utc::now),
        }
    }

    /// Upper bound of channels walked at the same time.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Read once at the start of every job.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Refreshes every stored channel. Ids the API no longer resolves are
    /// counted as not found.
    pub async fn update_channels(&self) -> Result<RunReport> {
        let mut report = new_report(JobKind::ChannelsUpdate);
        let channel_ids = self.store.list_channel_ids().await?;

        let writer = CatalogueWriter::new(self.store.as_ref(), true);
        let stats = self.scraper.scrape_channels(&channel_ids, &writer).await?;

        let resolved: HashSet<String> = writer
            .take_channels()
            .into_iter()
            .map(|channel| channel.id)
            .collect();
        for id in channel_ids.iter().filter(|id| !resolved.contains(*id)) {
            warn!("Channel {id} not found");
            report.not_found += 1;
        }

        report.channels = stats.channels;
        report.skipped = stats.skipped;
        Ok(report)
    }

    /// Walks the uploads playlist of every stored channel, incrementally
    /// unless `scrape_all` is set.
    pub async fn update_videos(&self, scrape_all: bool) -> Result<RunReport> {
        let mut report = new_report(JobKind::VideosUpdate);
        let now = (self.clock)();
        let channel_ids = self.store.list_channel_ids().await?;

        let writer = CatalogueWriter::new(self.store.as_ref(), false);
        let channel_stats = self.scraper.scrape_channels(&channel_ids, &writer).await?;
        let channels = writer.take_channels();
        report.channels = channel_stats.channels;
        report.skipped = channel_stats.skipped;

        let writer = &writer;
        let results: Vec<(String, Result<ScrapeStats>)> = stream::iter(channels)
            .map(|channel| async move {
                let result = self.walk_channel(&channel, scrape_all, now, writer).await;
                (channel.id, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut totals = ScrapeStats::default();
        for (channel_id, result) in results {
            match result {
                Ok(stats) => totals += stats,
                Err(e) if is_not_found(&e) => {
                    warn!("Skipping channel {channel_id}: {e}");
                    report.not_found += 1;
                }
                Err(e) => return Err(e.context(format!("video update for channel {channel_id}"))),
            }
        }

        report.playlist_items = totals.playlist_items;
        report.videos = totals.videos;
        report.skipped += totals.skipped;
        Ok(report)
    }

    async fn walk_channel(
        &self,
        channel: &RemoteChannel,
        scrape_all: bool,
        now: DateTime<Utc>,
        writer: &CatalogueWriter<'_>,
    ) -> Result<ScrapeStats> {
        let known = self.store.known_video_ids(&channel.id).await?;
        let mode = if scrape_all {
            ScrapeMode::All
        } else {
            ScrapeMode::Recent { known_ids: &known }
        };
        debug!(
            "Walking {} ({}) with {} known videos",
            channel.title,
            channel.uploads_playlist_id,
            known.len()
        );
        let stats = self
            .scraper
            .scrape_videos(&channel.uploads_playlist_id, mode, now, writer)
            .await?;
        Ok(stats)
    }

    /// Revisits stored videos. `Live` and `Recent` re-fetch full details,
    /// `All` only asks whether each video still exists.
    pub async fn check_videos(&self, mode: CheckMode) -> Result<RunReport> {
        let mut report = new_report(mode.job());
        let now = (self.clock)();
        let video_ids = self.store.video_ids_to_check(mode).await?;
        report.checked = video_ids.len();

        if video_ids.is_empty() {
            info!("No videos to check for {}", mode.job());
            return Ok(report);
        }

        let writer = CatalogueWriter::new(self.store.as_ref(), false);
        match mode {
            CheckMode::All => {
                self.scraper.check_videos(&video_ids, &writer).await?;
            }
            CheckMode::Live | CheckMode::Recent => {
                let stats = self.scraper.refresh_videos(&video_ids, now, &writer).await?;
                report.videos = stats.videos;
                report.skipped = stats.skipped;
            }
        }
        report.unavailable = writer.unavailable();
        Ok(report)
    }
}

fn new_report(job: JobKind) -> RunReport {
    RunReport {
        job: job.key().to_string(),
        ..RunReport::default()
    }
}

fn is_not_found(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<ScraperError>()
        .is_some_and(ScraperError::is_not_found)
}

#[derive(Debug)]
pub enum JobOutcome {
    Completed(RunReport),
    RateLimited(RateLimitOutcome),
}

/// Runs jobs behind their admission windows.
pub struct JobRunner {
    ingestor: Ingestor,
    limiters: HashMap<JobKind, FixedWindowRateLimiter>,
}

impl JobRunner {
    pub fn new(ingestor: Ingestor, limiters: HashMap<JobKind, FixedWindowRateLimiter>) -> Self {
        JobRunner { ingestor, limiters }
    }

    pub async fn run(&self, job: JobKind) -> Result<JobOutcome> {
        self.execute(job, false).await
    }

    /// Full walk of every uploads playlist, admitted through the video update window.
    pub async fn backfill_videos(&self) -> Result<JobOutcome> {
        self.execute(JobKind::VideosUpdate, true).await
    }

    async fn execute(&self, job: JobKind, scrape_all: bool) -> Result<JobOutcome> {
        if let Some(limiter) = self.limiters.get(&job) {
            let admission = limiter.limit(job.key()).await?;
            if !admission.success {
                return Ok(JobOutcome::RateLimited(admission));
            }
        }

        info!("Starting job {job}");
        let report = match job {
            JobKind::ChannelsUpdate => self.ingestor.update_channels().await?,
            JobKind::VideosUpdate => self.ingestor.update_videos(scrape_all).await?,
            JobKind::VideosCheck => self.ingestor.check_videos(CheckMode::Live).await?,
            JobKind::VideosCheckRecent => self.ingestor.check_videos(CheckMode::Recent).await?,
            JobKind::VideosCheckAll => self.ingestor.check_videos(CheckMode::All).await?,
        };
        info!(
            "Finished job {job}: {} channels, {} playlist items, {} videos, {} checked, {} unavailable, {} not found, {} skipped",
            report.channels,
            report.playlist_items,
            report.videos,
            report.checked,
            report.unavailable,
            report.not_found,
            report.skipped
        );
        Ok(JobOutcome::Completed(report))
    }
}
