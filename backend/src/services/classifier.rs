//! Lifecycle status and content kind of a video, derived from its metadata.
//!
//! Both functions are pure and take the reference instant as an argument.

use crate::models::{RemoteVideo, VideoKind, VideoStatus};
use crate::utils::parse_iso8601_duration;
use chrono::{DateTime, Utc};

/// Upper bound (inclusive) of a short, in seconds.
pub const SHORT_MAX_SECONDS: f64 = 60.0;

pub fn video_status(video: &RemoteVideo, now: DateTime<Utc>) -> VideoStatus {
    let Some(details) = &video.live_streaming_details else {
        return VideoStatus::Ended;
    };

    if details.is_broadcasting() {
        VideoStatus::Live
    } else if details.is_scheduled_after(now) {
        VideoStatus::Upcoming
    } else {
        VideoStatus::Ended
    }
}

/// Liveness and scheduling outrank duration. An ended stream falls through to
/// the duration rules.
pub fn video_kind(video: &RemoteVideo, now: DateTime<Utc>) -> VideoKind {
    if let Some(details) = &video.live_streaming_details {
        if details.is_broadcasting() {
            return VideoKind::LiveStream;
        }
        if details.is_scheduled_after(now) {
            return VideoKind::Premiere;
        }
    }

    let seconds = video
        .duration
        .as_deref()
        .and_then(|duration| parse_iso8601_duration(duration).ok());

    match seconds {
        Some(d) if d > 0.0 && d <= SHORT_MAX_SECONDS => VideoKind::Short,
        _ => VideoKind::Standard,
    }
}
