pub mod config;
pub mod disk_frame;
pub mod messages;

pub use config::*;
pub use disk_frame::*;
pub use messages::*;
