//! Catalog access, source adapters, transport and output writers

pub mod catalog;
pub mod sources;
pub mod transport;
pub mod output;

pub use catalog::{CatalogAdapter, StaticCatalog, RawRaster, PixelPayload};
pub use sources::{SourceAdapter, BandNameCache, BandMapping, adapter_for};
pub use transport::{RetryPolicy, PixelFetcher, HttpTransport, Transport, RasterDecoder};
pub use output::{RasterWriter, CogWriter, CommandCogWriter, ProvenanceWriter};
