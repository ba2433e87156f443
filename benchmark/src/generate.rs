use std::{num::NonZeroUsize, path::PathBuf};

use anyhow::Context;
use chunkbench::{
    grid::ChunkIndex,
    store::{element_size, ArrayMetadata, ChunkKeyEncoding, FilesystemStore, ReadError, ReadPath},
};
use rand::RngCore;
use tracing::info;

#[derive(clap::Args)]
pub struct GenerateArgs {
    /// Output directory of the array.
    path: PathBuf,
    /// Comma separated, e.g. `1024,1024,1024`.
    #[clap(long, value_delimiter = ',', required = true)]
    array_shape: Vec<u64>,
    #[clap(long, value_delimiter = ',', required = true)]
    chunk_shape: Vec<u64>,
    #[clap(long, default_value = "uint16")]
    data_type: String,
    /// Separator of the `default` chunk key encoding.
    #[clap(long, default_value = "/")]
    separator: String,
}

pub fn generate(args: &GenerateArgs) -> anyhow::Result<()> {
    let element_size = element_size(&args.data_type)
        .with_context(|| format!("unsupported data type {:?}", args.data_type))?;
    let metadata = ArrayMetadata::new_uncompressed(
        args.array_shape.clone(),
        args.chunk_shape.clone(),
        &args.data_type,
        ChunkKeyEncoding::Default {
            separator: args.separator.clone(),
        },
    );
    let store = FilesystemStore::create(&args.path, metadata)
        .with_context(|| format!("creating array at {:?}", args.path))?;

    // edge chunks are stored at full size
    let chunk_bytes = usize::try_from(args.chunk_shape.iter().product::<u64>())?
        .checked_mul(element_size)
        .context("chunk size overflows")?;
    let indices: Vec<ChunkIndex> = store.grid().indices().collect();
    let threads = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
    let per_thread = indices.len().div_ceil(threads).max(1);
    info!(
        chunks = indices.len(),
        chunk_bytes,
        threads,
        "generating {:?}",
        args.path
    );

    let written = std::thread::scope(|scope| {
        let store = &store;
        let workers: Vec<_> = indices
            .chunks(per_thread)
            .map(|batch| {
                scope.spawn(move || -> Result<u64, ReadError> {
                    let mut chunk = vec![0u8; chunk_bytes];
                    for index in batch {
                        rand::thread_rng().fill_bytes(&mut chunk);
                        store.write_chunk(index, &chunk)?;
                    }
                    Ok((batch.len() * chunk_bytes) as u64)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| match worker.join() {
                Ok(written) => Ok(written?),
                Err(_) => Err(anyhow::anyhow!("generator thread panicked")),
            })
            .sum::<anyhow::Result<u64>>()
    })?;

    println!(
        "Generated {} ({:.2}MB in {} chunks)",
        args.path.display(),
        written as f64 / 1e6,
        indices.len()
    );
    Ok(())
}
