pub mod context;
pub mod pipeline;
pub mod selector;
pub mod session;

pub use pipeline::{AutoTestOrchestrator, AutoTestReport};
pub use selector::select_best;
pub use session::MeasurementSessionManager;
