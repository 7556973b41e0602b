// hub-test-utils: shared test tooling for the hub's integration suite.
//
// Provides a thin websocket client for driving a real `axum::serve`
// instance of the hub the same way a production client would.

pub mod mock_ws_client;

pub use mock_ws_client::MockWsClient;
