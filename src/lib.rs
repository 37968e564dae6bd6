//! Headless AdVouch identity and session client.
//!
//! Implements the marketplace's browser-redirect login handshake against the
//! identity backend, keeps the resulting session alive with a proactive
//! token refresh loop, and recovers once from rejected credentials before
//! falling back to a fresh login.
//!
//! The crate is organized around a few seams:
//!
//! * [`identity::IdentityProvider`] - strategy over the identity backend,
//!   with a live HTTP implementation and a deterministic fake for demo mode
//!   and tests
//! * [`session::Session`] - the single owner of authenticated state, mutated
//!   through reducer actions and observed through a broadcast channel
//! * [`handshake::Handshake`] - the authorize/callback/exchange flow
//! * [`refresh::RefreshLoop`] - background renewal ahead of token expiry
//! * [`api::ApiClient`] - authenticated requests with one refresh-and-retry

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod api;
pub mod config;
pub mod events;
pub mod handshake;
pub mod http;
pub mod identity;
pub mod profile;
pub mod protocol;
pub mod refresh;
pub mod session;
pub mod store;
pub mod tokens;
pub mod uuid;
