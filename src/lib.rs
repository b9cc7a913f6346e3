//! # tilestack
//!
//! Archive search and capture-stack animation for satellite imagery.
//!
//! tilestack searches a STAC imagery archive over an area and time window,
//! reconciles the results into tiles sharing one CRS, groups tiles into
//! captures, gates captures on coverage, product version, and cloud cover,
//! and renders the accepted captures as georeferenced mosaics and a
//! time-ordered animation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌────────────┐   ┌─────────┐
//! │  chunk   │──▶│   search    │──▶│ normalize  │──▶│  group  │
//! │ windows  │   │ (catalog,   │   │ (CRS,      │   │         │
//! └──────────┘   │  parallel)  │   │  geometry) │   └────┬────┘
//!                └─────────────┘   └────────────┘        ▼
//!                ┌─────────────┐   ┌────────────┐   ┌─────────┐
//!                │  animate    │◀──│   mosaic   │◀──│  gate   │
//!                │  (GIF)      │   │  (GeoTIFF) │   │         │
//!                └─────────────┘   └────────────┘   └─────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Pipeline error taxonomy |
//! | [`models`] | Core data types |
//! | [`chunk`] | Date-range chunking |
//! | [`catalog`] | Catalog trait and STAC client |
//! | [`search`] | Concurrent archive search |
//! | [`crs`] | Supported coordinate reference systems |
//! | [`geometry`] | Footprint geometry helpers |
//! | [`normalize`] | Raw item to tile record normalization |
//! | [`group`] | Capture grouping |
//! | [`gate`] | Capture quality gate |
//! | [`raster`] | GeoTIFF I/O and resampling |
//! | [`mosaic`] | Per-capture mosaics |
//! | [`font`] | Bitmap font for frame labels |
//! | [`animate`] | Capture-stack animation |
//! | [`export`] | GeoJSON and audit exports |
//! | [`pipeline`] | End-to-end workflow |
//! | [`progress`] | Search progress reporting |

pub mod animate;
pub mod catalog;
pub mod chunk;
pub mod config;
pub mod crs;
pub mod error;
pub mod export;
pub mod font;
pub mod gate;
pub mod geometry;
pub mod group;
pub mod models;
pub mod mosaic;
pub mod normalize;
pub mod pipeline;
pub mod progress;
pub mod raster;
pub mod search;
