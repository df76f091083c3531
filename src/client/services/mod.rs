pub mod api_client;
pub mod dispatcher;
pub mod history_loader;
pub mod websocket_client;
