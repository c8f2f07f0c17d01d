pub mod config;
pub mod rib;
pub mod scan;
pub mod utils;
pub mod zebra;

pub use config::ScanConfig;
pub use rib::{Bgp, RouteHooks};
pub use scan::{command_channel, Scanner, ScannerHandle};
