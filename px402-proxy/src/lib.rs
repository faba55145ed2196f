#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Transport layer and bidirectional proxy for px402.
//!
//! This crate sits between a local JSON-RPC client (over stdio) and a
//! remote server (over an event stream or per-request HTTP) and forwards
//! traffic both ways, routing payment challenges and approvals through
//! the `px402` core.
//!
//! # Modules
//!
//! - [`error`] - Connection and transport error types
//! - [`inject`] - Identity-proof and payment-header injection on the send path
//! - [`negotiate`] - Strategy-driven transport negotiation with one-shot fallback
//! - [`proxy`] - The two-direction message pump with interception points
//! - [`transport`] - The `Transport` trait and stdio/SSE/HTTP implementations

pub mod error;
pub mod inject;
pub mod negotiate;
pub mod proxy;
pub mod transport;
