//! Keeps a listening client in lock-step with what a host is playing.
//!
//! A host reconciles a local media session and a remote provider into one
//! canonical [`playback::Update`] and publishes it to a sync server. Clients
//! poll the server, fetch the same track, decrypt and transcode it, and
//! render it aligned with the host's reported position.
//!
//! Host side, leaf first:
//!
//! * [`observer`]: local session with play/pause inference
//! * [`remote`]: remote provider and its poller
//! * [`discovery`]: reconciliation engine
//! * [`host`]: publish loop
//!
//! Client side:
//!
//! * [`decrypt`], [`transcode`], [`output`]: pipeline stages
//! * [`pipeline`]: decrypt and pace stage with its render thread
//! * [`player`]: playback controller
//! * [`client`]: poll loop
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod client;
pub mod clock;
pub mod config;
pub mod decrypt;
pub mod discovery;
pub mod error;
pub mod events;
pub mod host;
pub mod http;
pub mod observer;
pub mod output;
pub mod pipeline;
pub mod playback;
pub mod player;
pub mod remote;
pub mod resolver;
pub mod secrets;
pub mod signal;
pub mod track;
pub mod transcode;
pub mod util;
