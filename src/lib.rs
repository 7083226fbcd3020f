//! Customer-support chat with assistant-to-human handoff.
//!
//! The server side ([`chat`], [`registry`], [`hub`], [`store`], [`http`],
//! [`ws`]) owns session state and fans events out to rooms. The client
//! side ([`viewer`], [`hydrator`]) reconciles optimistic sends with pushes
//! and enriches product references.

pub mod app;
pub mod auth;
pub mod catalog;
pub mod chat;
pub mod config;
pub mod error;
pub mod http;
pub mod hub;
pub mod hydrator;
pub mod media;
pub mod prompting;
pub mod registry;
pub mod responder;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod validation;
pub mod viewer;
pub mod ws;
