use thiserror::Error;

#[derive(Error, Debug)]
pub enum VScreenError {
    #[error("Display device unavailable: {reason}")]
    DeviceUnavailable { reason: String },

    #[error("Connect failed: {reason}")]
    ConnectFailed { reason: String },

    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("Vendor id must be three letters A-Z, got {vendor:?}")]
    InvalidVendor { vendor: String },

    #[error("Descriptor already holds {capacity} modes")]
    CapacityExceeded { capacity: usize },

    #[error("Horizontal resolution {xres} not encodable (256..=2288)")]
    ResolutionOutOfRange { xres: u32 },

    #[error("Refresh rate {hz}Hz not encodable (60..=123)")]
    RefreshOutOfRange { hz: u32 },
}
