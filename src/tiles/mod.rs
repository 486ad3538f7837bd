//! Deep Zoom tile pyramid assembly.
//!
//! Libraries in the tile-pyramid family publish no downloadable page
//! images, only a `.dzi` descriptor and a pyramid of small tiles. This
//! module turns one descriptor URL into a full-resolution page image:
//! fetch the descriptor, compute the deepest-level tile grid, fetch every
//! tile with bounded concurrency, and composite them. Any failed tile
//! aborts the page; a partial composite is never returned.
//!
//! # Example
//!
//! ```no_run
//! use manuscript_core::resolver::ResolveContext;
//! use manuscript_core::{LibraryId, tiles};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = reqwest::Client::new();
//! let ctx = ResolveContext::default();
//! let page = tiles::assemble_page(
//!     &client,
//!     "https://selene.bordeaux.fr/in/dz/330636101_MS0778_0001.dzi",
//!     LibraryId::Bordeaux,
//!     &ctx,
//! )
//! .await?;
//! page.save("page_0001.jpg")?;
//! # Ok(())
//! # }
//! ```

mod descriptor;
mod grid;
mod stitch;

pub use descriptor::{DziDescriptor, MAX_STITCHED_DIMENSION};
pub use grid::{TileGrid, TilePlacement};
pub use stitch::stitch;

use futures_util::future::join_all;
use image::RgbImage;
use reqwest::Client;
use tracing::debug;

use crate::error::ResolveError;
use crate::http::{fetch_bytes, fetch_text};
use crate::library::LibraryId;
use crate::resolver::ResolveContext;

/// Fetches and parses a `.dzi` descriptor.
///
/// # Errors
///
/// Returns [`ResolveError::ManifestUnreachable`] when the descriptor
/// cannot be fetched and [`ResolveError::InvalidDescriptor`] when it
/// fails validation.
pub async fn fetch_descriptor(
    client: &Client,
    descriptor_url: &str,
    library: LibraryId,
    ctx: &ResolveContext,
) -> Result<DziDescriptor, ResolveError> {
    ctx.check_cancelled(descriptor_url)?;
    let policy = library.retry_policy();
    let timeout = library.timeout_for(descriptor_url);
    let xml = fetch_text(
        client,
        descriptor_url,
        timeout,
        &policy,
        None,
        Some(&ctx.cancel),
    )
    .await?;
    DziDescriptor::parse(descriptor_url, &xml)
}

/// Assembles one full-resolution page from its tile pyramid.
///
/// # Errors
///
/// Returns [`ResolveError::PartialTileFailure`] when any tile fails to
/// fetch or decode, besides the [`fetch_descriptor`] errors.
#[tracing::instrument(skip(client, ctx), fields(url = %descriptor_url))]
pub async fn assemble_page(
    client: &Client,
    descriptor_url: &str,
    library: LibraryId,
    ctx: &ResolveContext,
) -> Result<RgbImage, ResolveError> {
    let descriptor = fetch_descriptor(client, descriptor_url, library, ctx).await?;
    let grid = TileGrid::at_top_level(&descriptor);
    debug!(
        level = grid.level,
        cols = grid.cols,
        rows = grid.rows,
        "fetching tile grid"
    );
    let tiles = fetch_tiles(client, descriptor_url, &descriptor, &grid, library, ctx).await?;
    Ok(stitch(&grid, &tiles))
}

/// Fetches and decodes every tile of a grid, row-major, batched at the
/// context's concurrency cap. Stops launching batches once a tile has
/// failed; the page cannot be completed at that point.
async fn fetch_tiles(
    client: &Client,
    descriptor_url: &str,
    descriptor: &DziDescriptor,
    grid: &TileGrid,
    library: LibraryId,
    ctx: &ResolveContext,
) -> Result<Vec<RgbImage>, ResolveError> {
    let policy = library.retry_policy();
    let timeout = library.timeout_for(descriptor_url);
    let placements = grid.placements();
    let total = placements.len();
    let batch_size = ctx.options.fetch_concurrency().max(1);

    let mut tiles = Vec::with_capacity(total);
    let mut failed = 0usize;
    for batch in placements.chunks(batch_size) {
        ctx.check_cancelled(descriptor_url)?;
        let fetched = join_all(batch.iter().map(|placement| {
            let url = descriptor.tile_url(grid.level, placement.col, placement.row);
            let policy = &policy;
            async move {
                let bytes = fetch_bytes(client, &url, timeout, policy, Some(&ctx.cancel)).await?;
                image::load_from_memory(&bytes)
                    .map(|decoded| decoded.to_rgb8())
                    .map_err(|error| {
                        ResolveError::bad_response(&url, &format!("tile did not decode: {error}"))
                    })
            }
        }))
        .await;
        for outcome in fetched {
            match outcome {
                Ok(tile) => tiles.push(tile),
                Err(error) if error.is_cancelled() => return Err(error),
                Err(error) => {
                    debug!(error = %error, "tile fetch failed");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            break;
        }
    }

    if failed > 0 {
        return Err(ResolveError::partial_tiles(descriptor_url, failed, total));
    }
    Ok(tiles)
}
