//! Handler for file-based subscription sources.

use std::process::exit;

use tracing::{error, info};

use pmoproc::logging::init_handler_logging;
use pmoproc::{HandlerContext, HandlerOptions, PullDriver, SUBPROCESS_REGISTRATION_TIMEOUT};
use pmosubs::handlers::FilePullSource;

#[tokio::main]
async fn main() {
    init_handler_logging();

    let options = match HandlerOptions::from_args(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(e) => {
            error!("{e}");
            exit(2);
        }
    };

    let ctx = HandlerContext::connect(options);
    ctx.register();
    let params = match ctx.wait_registered(SUBPROCESS_REGISTRATION_TIMEOUT).await {
        Ok(params) => params,
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    };

    let driver = match PullDriver::from_params(&params) {
        Ok(driver) => driver,
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    };
    let Some(path) = pmoutils::local_path_from_uri(driver.uri()) else {
        error!("uri '{}' is not a file uri", driver.uri());
        exit(1);
    };

    info!("file handler launched");
    driver.run(&ctx, FilePullSource::new(path)).await
}
