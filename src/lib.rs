pub mod api;
pub mod client;
pub mod dispatch_stats;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod gallery;
pub mod logging;
pub mod render;
pub mod session;
pub mod source;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::CaptureError;
