use chrono::{DateTime, Utc};
use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::Responder;
use rocket::{response, Response};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;

/// A channel as returned by the remote channels lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChannel {
    pub id: String,
    pub uploads_playlist_id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePlaylistItem {
    pub playlist_id: String,
    pub video_id: String,
    pub video_published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveStreamingDetails {
    pub scheduled_start_time: Option<DateTime<Utc>>,
    pub actual_start_time: Option<DateTime<Utc>>,
    pub actual_end_time: Option<DateTime<Utc>>,
}

impl LiveStreamingDetails {
    /// Started and not yet ended.
    pub fn is_broadcasting(&self) -> bool {
        self.actual_start_time.is_some() && self.actual_end_time.is_none()
    }

    pub fn is_scheduled_after(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_start_time.is_some_and(|start| start > now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVideo {
    pub id: String,
    pub channel_id: Option<String>,
    pub title: String,
    /// ISO 8601 duration; absent for streams still in progress.
    pub duration: Option<String>,
    pub published_at: DateTime<Utc>,
    pub live_streaming_details: Option<LiveStreamingDetails>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VideoStatus {
    Live,
    Upcoming,
    Ended,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Live => "LIVE",
            VideoStatus::Upcoming => "UPCOMING",
            VideoStatus::Ended => "ENDED",
        }
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoKind {
    Standard,
    Short,
    LiveStream,
    Premiere,
}

impl VideoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoKind::Standard => "standard",
            VideoKind::Short => "short",
            VideoKind::LiveStream => "live_stream",
            VideoKind::Premiere => "premiere",
        }
    }
}

impl fmt::Display for VideoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated video with both classifications applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedVideo {
    #[serde(flatten)]
    pub video: RemoteVideo,
    pub status: VideoStatus,
    pub kind: VideoKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoAvailability {
    pub id: String,
    pub is_available: bool,
}

/// Counts reported by a finished ingestion job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub job: String,
    pub channels: usize,
    pub playlist_items: usize,
    pub videos: usize,
    pub skipped: usize,
    pub checked: usize,
    pub unavailable: usize,
    pub not_found: usize,
}

/// Granted to requests carrying the cron bearer secret.
#[derive(Debug)]
pub struct CronToken;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(skip)]
    pub status: Status,
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        ErrorResponse {
            status,
            error: status.reason().unwrap_or("Error").to_string(),
            message: message.into(),
        }
    }
}

impl<'r> Responder<'r, 'static> for ErrorResponse {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let json = serde_json::to_string(&self).map_err(|_| Status::InternalServerError)?;
        Response::build()
            .status(self.status)
            .header(ContentType::JSON)
            .sized_body(json.len(), Cursor::new(json))
            .ok()
    }
}
