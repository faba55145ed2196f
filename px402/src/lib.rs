#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core payment machinery for the px402 intercepting proxy.
//!
//! This crate provides everything between "a proxied response looked like a
//! payment challenge" and "a signed payment rides out on the retried
//! request": multi-protocol challenge detection, challenge enrichment with
//! live funding data, approval validation, and payment signing. It is
//! transport-agnostic; the proxy plumbing lives in a separate crate.
//!
//! # Overview
//!
//! Traffic between a local client and a remote server flows through two
//! stateless entry points on [`orchestrator::PaymentOrchestrator`]:
//!
//! - remote→local responses pass through challenge enrichment, which
//!   detects payment challenges, checks balances, estimates cost, and
//!   rewrites the response into something a human or agent can approve;
//! - local→remote requests carrying an explicit approval pass through
//!   authorization, which re-validates the embedded transaction template,
//!   re-derives the amount from the payload itself, signs, and emits
//!   one-time payment headers.
//!
//! Neither entry point keeps state between calls: everything needed to
//! authorize is reconstructed from the approved request.
//!
//! # Modules
//!
//! - [`amount`] - Atomic/decimal currency amount conversion
//! - [`detect`] - Priority-ordered, tolerant challenge detection
//! - [`error`] - Structured JSON-RPC error codes and builders
//! - [`message`] - JSON-RPC message envelopes for proxied traffic
//! - [`networks`] - Registry of supported networks and their settlement assets
//! - [`orchestrator`] - The stateless enrich/authorize entry points
//! - [`protocol`] - Payment protocol descriptors (x402 and decimal fallback)
//! - [`signer`] - The wallet abstraction payments are signed against

pub mod amount;
pub mod detect;
pub mod error;
pub mod message;
pub mod networks;
pub mod orchestrator;
pub mod protocol;
pub mod signer;
