use liveclass_relay::api::classroom_routes;
use liveclass_relay::classroom::RoomRegistry;
use liveclass_relay::config::Config;

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("liveclass_relay=info,warp=warn")),
        )
        .init();

    let registry = RoomRegistry::new();
    let routes = classroom_routes::classroom_routes(registry);

    tracing::info!(address = %config.bind_address(), "Starting classroom relay");

    warp::serve(routes)
        .run(config.bind_address())
        .await;
}
