pub mod execution;
pub mod pipeline;
pub mod report;
pub mod snapshot;

pub use execution::*;
pub use pipeline::*;
pub use report::*;
pub use snapshot::*;
