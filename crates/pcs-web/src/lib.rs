pub mod config;
pub mod dispatch;
pub mod logging;
pub mod relay;
pub mod static_host;
pub mod tool;

pub use dispatch::{CommandError, Dispatcher, Responder};
pub use relay::{router, ConnectionRegistry, RelayState};
pub use static_host::StaticSite;
pub use tool::{Tool, ToolError, ToolOutput};
