pub mod affinity;
pub mod credential;
pub mod error;
pub mod maintenance;
pub mod pool;
pub mod rate_limit;
pub mod tokens;
