pub mod jobs;

pub use jobs::*;

use crate::models::ErrorResponse;
use crate::AppState;
use rocket::http::Status;
use rocket::{catch, catchers, routes, Build, Request, Rocket};

#[catch(401)]
fn unauthorized(_request: &Request) -> ErrorResponse {
    ErrorResponse::new(Status::Unauthorized, "missing or invalid bearer token")
}

#[catch(404)]
fn not_found(request: &Request) -> ErrorResponse {
    ErrorResponse::new(Status::NotFound, format!("no route for {}", request.uri()))
}

pub fn build_rocket(state: AppState) -> Rocket<Build> {
    rocket::build()
        .manage(state)
        .mount(
            "/jobs",
            routes![
                post_channels_update,
                get_channels_update,
                post_videos_update,
                get_videos_update,
                post_videos_check,
                get_videos_check,
            ],
        )
        .register("/", catchers![unauthorized, not_found])
}
