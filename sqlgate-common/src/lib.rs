// Copyright 2025 Apache Doris Community
// Licensed under the Apache License, Version 2.0

//! Common foundational types for sqlgate
//!
//! This module provides:
//! - Error types and result handling
//! - Configuration management

pub mod error;
pub mod config;

pub use error::{GateError, ProtocolError, Result, TransportError};
pub use config::{AuthConfig, Config};
