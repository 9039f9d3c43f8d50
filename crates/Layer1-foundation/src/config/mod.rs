//! Config - daemon configuration management
//!
//! - `conf.rs` - `Conf` and `Zone`, loaded from and saved to TOML

mod conf;

pub use conf::{
    Conf, Zone, CONF_FILE, DEFAULT_CLIENT_PORT, DEFAULT_HOST_PORT, DEFAULT_LOG_FILE,
    DEFAULT_RECORDS_FILE, DEFAULT_SELF,
};
