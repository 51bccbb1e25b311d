//! Core library for migrating a MediaWiki wiki into Wiki.js.
//!
//! The pipeline pulls every revision of every main-namespace page from the
//! source wiki, converts the markup to markdown through an external engine
//! with a repair-and-retry loop for markup the engine chokes on, rewrites
//! the converted links to destination paths, and pushes the result into
//! Wiki.js (or a local directory tree) oldest revision first.

pub mod config;
pub mod convert;
pub mod engine;
pub mod export;
pub mod ledger;
pub mod links;
pub mod mediawiki;
pub mod migrate;
pub mod repair;
pub mod wikijs;
