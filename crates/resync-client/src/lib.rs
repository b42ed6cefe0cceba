//! resync client - upstream HTTP access
//!
//! This crate provides:
//!
//! - [`odata`] - the RESO Web API (OData) client used by the collector
//! - [`platform`] - platform adapters (UtahRealEstate, Trestle, Bridge Interactive)
//!
//! # Overview
//!
//! The client handles request building, retries and response parsing; the
//! platform adapters decide which fields are kept and how tokens are obtained.

pub mod odata;
pub mod platform;

pub use odata::ODataClient;
pub use platform::PlatformRegistry;
