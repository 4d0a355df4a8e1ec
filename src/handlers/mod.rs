//! gRPC service handlers.

pub mod relay;
pub mod screen_sharing;
pub mod whiteboard;

pub use relay::{Relay, RelayReport, RelayState};
pub use screen_sharing::ScreenSharingService;
pub use whiteboard::WhiteboardService;
