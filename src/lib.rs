//! Session gateway for interactive playground pages.
//!
//! Pages from the [`catalog`] embed widgets backed by a per-session sandbox.
//! The [`registry`] creates that sandbox when the first client of a page
//! instance attaches, routes widget actions into it and streams its output
//! to every attached client; [`http_server`] exposes all of it over HTTP,
//! server-sent events and WebSocket.

pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod http_server;
pub mod ids;
pub mod protocol;
pub mod registry;
pub mod sandbox;
pub mod state;
