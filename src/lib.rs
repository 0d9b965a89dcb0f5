//! smsgate: outbound SMS dispatch pipeline.
//!
//! Pulls queued messages from a store, moves them through the
//! `unsent -> pending -> sent -> delivered` lifecycle, splits long bodies into
//! parts and hands them to a transport. Per-part acknowledgements come back
//! through [`receipts::ReceiptTracker`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod address;
pub mod config;
pub mod logging;
pub mod message;
pub mod store;
pub mod transport;

pub mod dispatch;
pub mod receipts;
pub mod segment;
pub mod status;
pub mod token;
