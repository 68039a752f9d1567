pub mod config;
pub mod connector;
pub mod error;
pub mod metrics;
pub mod ramp;
pub mod report;
pub mod run;
pub mod scheduler;
pub mod session;
pub mod threshold;

pub use config::*;
pub use connector::*;
pub use error::*;
pub use metrics::*;
pub use ramp::*;
pub use report::*;
pub use run::*;
pub use scheduler::*;
pub use session::*;
pub use threshold::*;
