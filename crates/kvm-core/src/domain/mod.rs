//! Domain entities for the KVM-Over-IP gateway.
//!
//! This module contains pure data and rules with no infrastructure
//! dependencies.
//!
//! # What is "domain" in Clean Architecture? (for beginners)
//!
//! Clean Architecture organises code into concentric layers.  The innermost
//! layer is called the **domain** (or "entities" layer).  Domain code:
//!
//! - Contains the core business rules of the application.
//! - Has **no** imports from network libraries, HTTP clients, or async
//!   runtimes.
//! - Can be compiled and tested on any platform without any external setup.
//!
//! Here the domain is the vocabulary of the gateway: which units exist and
//! what they can do, which streams are running, and what a command result
//! looks like.  The gateway crate depends on these types; they never depend
//! on the gateway.

/// Uniform result record returned by every hardware command.
pub mod command;

/// Remote units, their endpoints, credentials and capability flags.
pub mod device;

/// Stream configuration, identity and lifecycle state.
pub mod stream;
