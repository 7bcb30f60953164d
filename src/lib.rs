#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]
#![warn(clippy::perf)]
#![warn(clippy::complexity)]
#![warn(clippy::style)]
#![allow(clippy::multiple_crate_versions)]

//! Resolves shows, their episodes and playable streams through lazily computed,
//! memoized lookups, and persists what was resolved so later requests don't
//! fetch it again.

pub mod cache;
pub mod codec;
pub mod entity;
pub mod error;
pub mod language;
pub mod memo;
pub mod models;
pub mod providers;
pub mod query;
pub mod race;
pub mod ranking;
pub mod registry;
pub mod request;
pub mod sources;
pub mod store;
pub mod util;

pub use error::{Error, Result};
