use std::{sync::Arc, time::Instant};

use futures::FutureExt;
use tracing::info;

use super::{ChunkRead, Engine, ReadMode, ReadReport};
use crate::{
    scheduler::{self, ReadTask},
    store::{ReadError, ReadPath},
};

/// Chunk reads block the executor thread that polls them.
pub struct EngineTokioOnExecutorThread {
    rt: tokio::runtime::Runtime,
}

impl EngineTokioOnExecutorThread {
    pub fn new() -> std::io::Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        Ok(Self { rt })
    }

    fn chunk_task(store: Arc<dyn ReadPath>, index: Vec<u64>) -> ReadTask<ChunkRead> {
        async move {
            let start = Instant::now();
            let bytes = store.read_chunk(&index)?;
            Ok(ChunkRead {
                bytes: bytes.len() as u64,
                elements: store
                    .grid()
                    .region(&index)
                    .map_or(0, |region| region.num_elements()),
                latency: start.elapsed(),
            })
        }
        .boxed()
    }
}

impl Engine for EngineTokioOnExecutorThread {
    fn read(&self, store: Arc<dyn ReadPath>, mode: ReadMode) -> Result<ReadReport, ReadError> {
        self.rt.block_on(async move {
            match mode {
                ReadMode::All => {
                    let elements = store.grid().num_elements();
                    let (elapsed, bytes) =
                        scheduler::run_whole(async move { store.read_all() }).await?;
                    Ok(ReadReport::from_whole(elapsed, bytes.len() as u64, elements))
                }
                ReadMode::Chunks(limit) => {
                    info!(num_chunks = store.grid().num_chunks(), ?limit, "spawning chunk reads");
                    let tasks = store
                        .grid()
                        .indices()
                        .map(|index| Self::chunk_task(Arc::clone(&store), index));
                    let completed = scheduler::run_bounded(tasks, limit).await?;
                    Ok(ReadReport::from_chunks(completed.elapsed, completed.outputs))
                }
            }
        })
    }
}
