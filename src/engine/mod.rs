pub mod broadcaster;
pub mod evaluator;
pub mod ingest;
pub mod lifecycle;
pub mod notifier;
pub mod proximity;
