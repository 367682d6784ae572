pub mod classifier;
pub mod dispatcher;
pub mod fallback;
pub mod sink;

pub use classifier::{Classification, PostClassifier};
pub use dispatcher::DualDispatcher;
pub use fallback::FallbackController;
pub use sink::ResultSink;
