//! Fleetgate - keeps a load balancer in front of a fleet of upstream proxies
//!
//! This library provides:
//! - Detached launch and signal-based stop of the load balancer process
//! - Config rendering from a template and the current backend set
//! - Soft reloads that hand listening sockets over to a new instance
//! - Periodic probes through every proxy, restarting the ones that fail

pub mod backend;
pub mod config;
pub mod error;
pub mod healthcheck;
pub mod inventory;
pub mod loadbalancer;
pub mod service;
pub mod template;
