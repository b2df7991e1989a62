//! HTTP layer for the certificate gateway.
//!
//! Requests to `/certgen/` pass through authentication, the identity check
//! and request validation before a single signing request reaches the
//! signing oracle.

pub mod handler;
pub mod validate;
