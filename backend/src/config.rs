use crate::cache::KvCacheStorage;
use crate::fetch::{
    cache_middleware, compose, reqwest_transport, retry_middleware, CacheOptions, Fetch,
    RetryOptions,
};
use crate::kv::{KvStore, MemoryKvStore, RedisRestStore};
use crate::models::CronToken;
use crate::services::elasticsearch_service::{create_es_indices, ElasticsearchCatalogue};
use crate::services::ingest::{Ingestor, JobOutcome, JobRunner};
use crate::services::ratelimit::{FixedWindowRateLimiter, JobKind};
use crate::services::scraper::YouTubeScraper;
use crate::AppState;
use anyhow::Result;
use elasticsearch::{
    http::transport::{SingleNodeConnectionPool, TransportBuilder},
    Elasticsearch,
};
use env_logger::Builder;
use lazy_static::lazy_static;
use log::{error, info, warn, LevelFilter};
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome};
use rocket::Request;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use url::Url;

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

lazy_static! {
    pub static ref YOUTUBE_API_KEY: Option<String> = env_opt("YOUTUBE_API_KEY");
    pub static ref CRON_SECRET: Option<String> = env_opt("CRON_SECRET");
    pub static ref ELASTICSEARCH_URL: String =
        env::var("ELASTICSEARCH_URL").unwrap_or_else(|_| "http://localhost:9200".to_string());
    pub static ref REDIS_REST_URL: Option<String> = env_opt("REDIS_REST_URL");
    pub static ref REDIS_REST_TOKEN: Option<String> = env_opt("REDIS_REST_TOKEN");
    pub static ref YOUTUBE_API_BASE_URL: String = env::var("YOUTUBE_API_BASE_URL")
        .unwrap_or_else(|_| crate::services::scraper::DEFAULT_BASE_URL.to_string());
    pub static ref FETCH_CACHE_TTL_SECS: u64 = env_or("FETCH_CACHE_TTL_SECS", 3600);
    pub static ref FETCH_RETRY_MAX_ATTEMPTS: u32 = env_or("FETCH_RETRY_MAX_ATTEMPTS", 5);
    pub static ref SCRAPER_CONCURRENCY: usize = env_or("SCRAPER_CONCURRENCY", 4);
    pub static ref SCRAPER_RECENT_PAGES: usize = env_or("SCRAPER_RECENT_PAGES", 3);
    pub static ref CHANNELS_UPDATE_SCHEDULE: Option<String> = env_opt("CHANNELS_UPDATE_SCHEDULE");
    pub static ref VIDEOS_UPDATE_SCHEDULE: Option<String> = env_opt("VIDEOS_UPDATE_SCHEDULE");
    pub static ref VIDEOS_CHECK_SCHEDULE: Option<String> = env_opt("VIDEOS_CHECK_SCHEDULE");
    pub static ref VIDEOS_CHECK_RECENT_SCHEDULE: Option<String> =
        env_opt("VIDEOS_CHECK_RECENT_SCHEDULE");
    pub static ref VIDEOS_CHECK_ALL_SCHEDULE: Option<String> = env_opt("VIDEOS_CHECK_ALL_SCHEDULE");
}

pub fn init_logger() {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();
    info!("Starting video ingest backend...");
}

pub fn load_environment() {
    dotenv::dotenv().ok();
}

pub fn create_elasticsearch_client() -> Result<Elasticsearch> {
    let es_url = &*ELASTICSEARCH_URL;
    info!("Connecting to Elasticsearch at: {es_url}");

    let transport =
        TransportBuilder::new(SingleNodeConnectionPool::new(es_url.parse()?)).build()?;

    Ok(Elasticsearch::new(transport))
}

pub fn create_http_client() -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30))
        .build()?;
    Ok(client)
}

/// Redis over REST when configured, otherwise a process-local store.
pub fn create_kv_store(client: &reqwest::Client) -> Arc<dyn KvStore> {
    match (&*REDIS_REST_URL, &*REDIS_REST_TOKEN) {
        (Some(url), Some(token)) => {
            info!("Using Redis REST store at: {url}");
            Arc::new(RedisRestStore::new(client.clone(), url.clone(), token.clone()))
        }
        _ => {
            warn!("REDIS_REST_URL/REDIS_REST_TOKEN not set, using in-process store");
            Arc::new(MemoryKvStore::new())
        }
    }
}

/// Transport wrapped in the conditional cache, with retry innermost.
pub fn create_fetch(client: reqwest::Client, store: Arc<dyn KvStore>) -> Fetch {
    let ttl = Duration::from_secs(*FETCH_CACHE_TTL_SECS);
    let storage = Arc::new(KvCacheStorage::new(store).with_ttl(ttl));
    let retry = RetryOptions {
        max_attempts: (*FETCH_RETRY_MAX_ATTEMPTS).max(1),
        ..RetryOptions::default()
    };

    compose(
        reqwest_transport(client),
        vec![
            cache_middleware(CacheOptions::new(storage).with_ttl(ttl)),
            retry_middleware(retry),
        ],
    )
}

pub fn create_scraper(fetch: Fetch) -> Result<YouTubeScraper> {
    let mut base_url = YOUTUBE_API_BASE_URL.clone();
    if !base_url.ends_with('/') {
        base_url.push('/');
    }

    let scraper = YouTubeScraper::new(fetch, YOUTUBE_API_KEY.clone())?
        .with_base_url(Url::parse(&base_url)?)
        .with_recent_pages(*SCRAPER_RECENT_PAGES);
    Ok(scraper)
}

pub fn create_rate_limiters(store: Arc<dyn KvStore>) -> HashMap<JobKind, FixedWindowRateLimiter> {
    JobKind::ALL
        .into_iter()
        .map(|job| {
            let limiter = FixedWindowRateLimiter::for_job(store.clone(), job).with_analytics(true);
            (job, limiter)
        })
        .collect()
}

fn job_schedule(job: JobKind) -> Option<&'static str> {
    match job {
        JobKind::ChannelsUpdate => CHANNELS_UPDATE_SCHEDULE.as_deref(),
        JobKind::VideosUpdate => VIDEOS_UPDATE_SCHEDULE.as_deref(),
        JobKind::VideosCheck => VIDEOS_CHECK_SCHEDULE.as_deref(),
        JobKind::VideosCheckRecent => VIDEOS_CHECK_RECENT_SCHEDULE.as_deref(),
        JobKind::VideosCheckAll => VIDEOS_CHECK_ALL_SCHEDULE.as_deref(),
    }
}

/// Starts a scheduler for every job with a configured cron expression.
/// Scheduled runs go through the same admission windows as HTTP triggers.
pub async fn setup_job_scheduler(jobs: Arc<JobRunner>) -> Result<Option<JobScheduler>> {
    let scheduled: Vec<(JobKind, &'static str)> = JobKind::ALL
        .into_iter()
        .filter_map(|job| job_schedule(job).map(|schedule| (job, schedule)))
        .collect();
    if scheduled.is_empty() {
        info!("No job schedules configured, relying on external triggers.");
        return Ok(None);
    }

    let scheduler = JobScheduler::new().await?;
    for (kind, schedule) in scheduled {
        let jobs = jobs.clone();
        let job = Job::new_async(schedule, move |_uuid, _l| {
            let jobs = jobs.clone();
            Box::pin(async move {
                match jobs.run(kind).await {
                    Ok(JobOutcome::Completed(_)) => {}
                    Ok(JobOutcome::RateLimited(_)) => {
                        info!("Scheduled {kind} skipped, it ran too recently");
                    }
                    Err(e) => error!("Scheduled {kind} failed: {e:?}"),
                }
            })
        })?;
        scheduler.add(job).await?;
        info!("Scheduled {kind} at '{schedule}'");
    }

    scheduler.start().await?;
    info!("Job scheduler started.");
    Ok(Some(scheduler))
}

pub async fn create_app_state() -> Result<AppState> {
    let es_client = create_elasticsearch_client()?;
    create_es_indices(&es_client).await;

    let http_client = create_http_client()?;
    let kv_store = create_kv_store(&http_client);
    let fetch = create_fetch(http_client, kv_store.clone());
    let scraper = create_scraper(fetch)?;

    let ingestor = Ingestor::new(
        Arc::new(scraper),
        Arc::new(ElasticsearchCatalogue::new(es_client)),
    )
    .with_concurrency(*SCRAPER_CONCURRENCY);
    let jobs = Arc::new(JobRunner::new(ingestor, create_rate_limiters(kv_store)));

    let scheduler = setup_job_scheduler(jobs.clone()).await?;
    if CRON_SECRET.is_none() {
        warn!("CRON_SECRET not set, job endpoints will reject every request");
    }

    Ok(AppState {
        jobs,
        cron_secret: CRON_SECRET.clone(),
        scheduler: Mutex::new(scheduler),
    })
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for CronToken {
    type Error = &'static str;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(secret) = request
            .rocket()
            .state::<AppState>()
            .and_then(|state| state.cron_secret.as_deref())
        else {
            return Outcome::Error((Status::Unauthorized, "Cron secret not configured"));
        };

        let token = request
            .headers()
            .get_one("Authorization")
            .and_then(|auth| auth.strip_prefix("Bearer "));

        match token {
            Some(t) => {
                if t == secret {
                    Outcome::Success(CronToken)
                } else {
                    Outcome::Error((Status::Unauthorized, "Invalid token"))
                }
            }
            None => Outcome::Error((Status::Unauthorized, "Missing token")),
        }
    }
}
