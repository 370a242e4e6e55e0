use std::sync::Arc;

use proctor_session::relay::{self, RelayHub};
use proctor_session::Config;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    init_tracing();
    let config = Config::from_env();

    let hub = Arc::new(RelayHub::new());
    let routes = relay::routes(hub, &config);

    let address = config.bind_address();
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        signaling_url = %config.signaling.url,
        "Starting signaling relay"
    );

    warp::serve(routes).run(address).await;
}
