//! Worker process: the supervisor loop and job finalization

pub mod finalizer;
pub mod supervisor;

pub use finalizer::finalize_job;
pub use supervisor::Supervisor;
