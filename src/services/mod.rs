/// Health check service.
pub mod health_service;
/// Tokio driver wiring a round session to a relay link.
pub mod peer_runtime;
/// Room routing shared by the WebSocket and in-process relays.
pub mod relay;
/// Room summaries for the HTTP surface.
pub mod room_service;
/// WebSocket connection and message handling service.
pub mod websocket_service;
