//! Respondent identity and consent reconciliation.
//!
//! Anonymous visitors become [`Respondent`]s, consent decisions go to an
//! append-only ledger, surveys declare which data they need, and a
//! respondent's anonymous identities collapse into one when they sign in.
//! Start from [`Engine`].

pub mod clock;
pub mod config;
pub mod consent;
pub mod db;
pub mod engine;
pub mod errors;
pub mod events;
pub mod export;
pub mod identity;
pub mod merge;
pub mod models;
pub mod participation;
pub mod requirements;
pub mod routes;
pub mod state;
pub mod store;

pub use engine::Engine;
pub use errors::EngineError;
pub use models::consent::{ConsentRecord, ConsentState, DataCategory};
pub use models::context::{EntryPoint, RequestContext};
pub use models::respondent::Respondent;
