pub mod classroom_routes;
pub mod classroom_websocket;
