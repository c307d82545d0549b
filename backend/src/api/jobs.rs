use crate::models::{CronToken, ErrorResponse, RunReport};
use crate::services::ingest::{CheckMode, JobOutcome};
use crate::services::ratelimit::JobKind;
use crate::AppState;
use log::{error, warn};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{get, post, State};

type JobResult = Result<Json<RunReport>, ErrorResponse>;

fn respond(job: JobKind, outcome: anyhow::Result<JobOutcome>) -> JobResult {
    match outcome {
        Ok(JobOutcome::Completed(report)) => Ok(Json(report)),
        Ok(JobOutcome::RateLimited(admission)) => {
            warn!(
                "Rejected {job}: {} of {} runs left in window",
                admission.remaining, admission.limit
            );
            Err(ErrorResponse::new(
                Status::TooManyRequests,
                format!("{job} already ran in the current window"),
            ))
        }
        Err(e) => {
            error!("Job {job} failed: {e:?}");
            Err(ErrorResponse::new(
                Status::InternalServerError,
                format!("{job} failed: {e}"),
            ))
        }
    }
}

async fn run_channels_update(state: &AppState) -> JobResult {
    let job = JobKind::ChannelsUpdate;
    respond(job, state.jobs.run(job).await)
}

async fn run_videos_update(state: &AppState, all: Option<bool>) -> JobResult {
    let job = JobKind::VideosUpdate;
    let outcome = if all.unwrap_or(false) {
        state.jobs.backfill_videos().await
    } else {
        state.jobs.run(job).await
    };
    respond(job, outcome)
}

async fn run_videos_check(state: &AppState, mode: Option<&str>) -> JobResult {
    let Some(check_mode) = CheckMode::from_param(mode) else {
        let mode = mode.unwrap_or_default();
        return Err(ErrorResponse::new(
            Status::BadRequest,
            format!("unknown check mode {mode:?}, expected 'recent' or 'all'"),
        ));
    };
    let job = check_mode.job();
    respond(job, state.jobs.run(job).await)
}

#[post("/channels/update")]
pub async fn post_channels_update(_token: CronToken, state: &State<AppState>) -> JobResult {
    run_channels_update(state).await
}

#[get("/channels/update")]
pub async fn get_channels_update(_token: CronToken, state: &State<AppState>) -> JobResult {
    run_channels_update(state).await
}

#[post("/videos/update?<all>")]
pub async fn post_videos_update(
    _token: CronToken,
    state: &State<AppState>,
    all: Option<bool>,
) -> JobResult {
    run_videos_update(state, all).await
}

#[get("/videos/update?<all>")]
pub async fn get_videos_update(
    _token: CronToken,
    state: &State<AppState>,
    all: Option<bool>,
) -> JobResult {
    run_videos_update(state, all).await
}

#[post("/videos/check?<mode>")]
pub async fn post_videos_check(
    _token: CronToken,
    state: &State<AppState>,
    mode: Option<&str>,
) -> JobResult {
    run_videos_check(state, mode).await
}

#[get("/videos/check?<mode>")]
pub async fn get_videos_check(
    _token: CronToken,
    state: &State<AppState>,
    mode: Option<&str>,
) -> JobResult {
    run_videos_check(state, mode).await
}
