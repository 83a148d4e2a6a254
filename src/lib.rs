mod capture;
mod config;
mod dataset;
mod energy;
mod error;
mod executor;
mod features;
mod locator;
mod path;
mod pipeline;
mod simulate;
mod summary;
mod utils;

pub use capture::*;
pub use config::*;
pub use dataset::*;
pub use energy::*;
pub use error::*;
pub use executor::*;
pub use features::*;
pub use locator::*;
pub use path::*;
pub use pipeline::*;
pub use simulate::*;
pub use summary::*;
pub use utils::*;
