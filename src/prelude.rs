pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};
pub use tokio::sync::broadcast;

pub use crate::config::{self, Config};
pub use crate::coordinator::{self, Coordinator};
pub use crate::error::Error;
pub use crate::inverter::{self, Inverter};
pub use crate::options::Options;
pub use crate::utils::Utils;
