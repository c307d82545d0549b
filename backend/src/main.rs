#[macro_use]
extern crate rocket;

use video_ingest::api::build_rocket;
use video_ingest::config::{create_app_state, init_logger, load_environment};

#[get("/")]
fn index() -> &'static str {
    "video-ingest"
}

#[launch]
async fn rocket() -> _ {
    load_environment();
    init_logger();

    let state = match create_app_state().await {
        Ok(state) => state,
        Err(e) => {
            log::error!("Failed to initialise application state: {e:?}");
            std::process::exit(1);
        }
    };

    build_rocket(state).mount("/", routes![index])
}
