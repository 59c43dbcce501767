//! Core business logic - framework-agnostic enrollment, payment and validation operations.
//!
//! Every state-changing operation here runs inside a single database transaction and
//! either applies its whole transition or leaves the store untouched.

/// Capacity ledger: derived seat counts and race-free confirmation
pub mod capacity;
/// Minimal course catalog needed by the enrollment workflow
pub mod course;
/// Enrollment state machine: requests, withdrawals and lookups
pub mod enrollment;
/// Payment gateway capability and timeout handling
pub mod gateway;
/// Verified caller identity and role guards
pub mod identity;
/// Notification sink and inbox queries
pub mod notification;
/// Payment reconciliation for synchronous and webhook confirmations
pub mod reconciliation;
/// Read-only reports for administrators and students
pub mod report;
/// Retry of transient storage faults at the transaction boundary
pub mod retry;
/// Administrative validation gate
pub mod validation;
