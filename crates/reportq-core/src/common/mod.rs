pub mod error;
pub mod status;
pub mod types;

pub use error::{Error, Result};
pub use status::Status;
pub use types::{JobRequest, JobResult};
