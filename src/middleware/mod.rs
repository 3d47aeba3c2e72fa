//! Request interceptors.
//!
//! Register `RateLimit` first and `SecurityScan` second: actix runs the last
//! registered middleware first, so blocked and malicious requests never
//! consume rate limit quota.

pub mod rate_limit;
pub mod security_scan;

pub use rate_limit::RateLimit;
pub use security_scan::SecurityScan;
