pub mod api;
pub mod events;
pub mod rest;
pub mod ws;

pub use api::SwapService;
pub use events::{EventStream, SwapEvent};
pub use rest::SwapServiceClient;
pub use ws::WsEventStream;
