//! Security core for the mlld scripting language.
//!
//! Attaches a security descriptor to every runtime value, propagates it
//! through every derivation, and enforces declarative policies and
//! imperative guards at operation boundaries -- so a prompt-injected
//! model can be *tricked* without the consequences ever manifesting.
//!
//! The evaluator, parser, renderer, and all real I/O live elsewhere; this
//! crate owns labels, taint, policy, guards, environments, the audit
//! ledger, and the dispatcher that ties them together. The host owns the
//! `tracing` subscriber; this crate only emits.

pub mod audit;
pub mod config;
pub mod dispatch;
pub mod env;
pub mod guard;
pub mod label;
pub mod policy;
pub mod recovery;
pub mod types;
