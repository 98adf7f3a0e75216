//! # Hawser Demos
//!
//! This crate contains runnable demos for the hawser transport engine.
//!
//! ## Running Demos
//!
//! Run a demo with:
//!
//! ```bash
//! cargo run --example echo_client -- --host 127.0.0.1 --port 6000
//! ```
//!
//! The echo client expects any line-oriented TCP peer on the other side;
//! `ncat -l -k -e /bin/cat 6000` works fine.

#![warn(rust_2018_idioms)]
#![allow(dead_code)]
