//! Client for Sisyphus kinetic art tables.
//!
//! A Sisyphus table draws tracks in sand with a magnet-steered ball and
//! exposes a small JSON API on the local network. This crate keeps a live
//! local snapshot of one table's state: commands go out over HTTP, state
//! updates stream back over the table's socket.io push channel, and both
//! feed the same merge pipeline. Reads are synchronous against the
//! snapshot; change listeners and [`table::Table::wait_for`] signal when
//! it moves.
//!
//! Start with [`table::Table::connect`].
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod model;
pub mod playlist;
pub mod protocol;
pub mod socket;
pub mod table;
pub mod timing;
pub mod track;
pub mod transport;
