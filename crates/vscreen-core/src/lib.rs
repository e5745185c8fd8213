pub mod config;
pub mod edid;
pub mod errors;
pub mod types;

pub use config::{CaptureConfig, ModeConfig};
pub use edid::{AspectRatio, Edid};
pub use errors::{DescriptorError, VScreenError};
pub use types::*;
