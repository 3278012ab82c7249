mod invariant;
mod sem;

pub use invariant::report_broken_invariant;
pub use sem::Semaphore;
