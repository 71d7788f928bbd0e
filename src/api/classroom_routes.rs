use std::sync::Arc;
use warp::Filter;

use crate::classroom::RoomRegistry;
use super::classroom_websocket;

/// All HTTP/WebSocket routes served by the relay.
pub fn classroom_routes(
    registry: Arc<RoomRegistry>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    classroom_websocket_route(registry).or(health_check())
}

/// WebSocket upgrade route, addressed by room code: `/classroom/{room_code}`.
///
/// The room code is externally assigned and trusted as-is; the relay neither
/// validates nor normalizes it.
pub fn classroom_websocket_route(
    registry: Arc<RoomRegistry>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("classroom")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_registry(registry))
        .map(|room_code: String, ws: warp::ws::Ws, registry: Arc<RoomRegistry>| {
            ws.on_upgrade(move |websocket| {
                classroom_websocket::handle_classroom_websocket(websocket, registry, room_code)
            })
        })
}

pub fn health_check() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| {
            warp::reply::json(&serde_json::json!({
                "status": "healthy",
                "service": "liveclass-relay",
                "version": env!("CARGO_PKG_VERSION")
            }))
        })
}

fn with_registry(
    registry: Arc<RoomRegistry>,
) -> impl Filter<Extract = (Arc<RoomRegistry>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || registry.clone())
}
