pub mod retry;

pub use retry::{with_fixed_retry, Backoff};
