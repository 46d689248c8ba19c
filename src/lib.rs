//! # scp-push
//!
//! SCP (Secure Copy Protocol) upload client providing:
//!   • Per-destination-host admission control (connection & session caps)
//!   • Public-key authentication from an identity file
//!   • Single-file and arbitrary-reader uploads via the `scp -t` sink protocol
//!   • Remote exit-status surfacing with parsed scp error messages
//!
//! Receiving files is out of scope; this crate only sends.

pub mod scp;
