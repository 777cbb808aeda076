//! Catalog Proxy - A self-configuring nginx controller driven by a service registry
//!
//! This library keeps an nginx instance in line with a service catalog:
//! - Watches the registry catalog and each published service's passing nodes
//! - Renders per-service nginx fragments for http, http2 (TLS), tcp and udp
//! - Validates every candidate configuration before it touches the live tree
//! - Coalesces bursts of changes into a single nginx reload
//! - Issues and shares TLS certificates (ACME HTTP-01 or self-signed) across
//!   controller instances under a registry lock
//! - Allocates stream listen ports from a configured range, mirrored in the registry

pub mod acme;
pub mod admin;
pub mod certificate;
pub mod config;
pub mod consul;
pub mod controller;
pub mod deploy;
pub mod error;
pub mod issuer;
pub mod memory;
pub mod ports;
pub mod proxy;
pub mod registry;
pub mod reload;
pub mod render;
pub mod service;
pub mod session;
pub mod watcher;
