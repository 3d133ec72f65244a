//! Types library for the live market-data feed
//!
//! Record definitions shared by the ingestion pipeline, the live value
//! store and the management surface. The pipeline itself is generic over
//! its record type; these are the concrete types the `live-feed` service
//! ships with.
//!
//! # Modules
//! - `ids`: Unique identifiers (ConnectionId)
//! - `record`: Decoded market-data records and the `LiveRecord` trait
//! - `errors`: Record validation errors

// Public modules
pub mod ids;
pub mod record;
pub mod errors;
