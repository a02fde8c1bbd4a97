use super::*;
use bytes::Bytes;
use cairn_cache::{offload::Offload, sig};
use record::{CanonicalImage, RecordImage};
use std::{
    fs::{create_dir_all, remove_file, rename, OpenOptions},
    io::{self, Write},
    path::Path,
    sync::Mutex,
};

struct Inner {
    config: Config,
    /// Resolved store root; `Some` between start and stop.
    root: Option<PathBuf>,
}

/// The reference file-backed offload service.
///
/// One record file per storage id, sharded two directory levels deep by
/// the id's leading bytes. Writes go to a temporary sibling, are synced,
/// then renamed into place, so a crash never leaves a half-written
/// record under a live name.
pub struct LocalDiskOffload {
    inner: Mutex<Inner>,
}

impl LocalDiskOffload {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Mutex::new(Inner { config, root: None }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().trace_expect("Failed to lock offload mutex")
    }

    fn root(&self) -> Result<PathBuf, Error> {
        self.lock().root.clone().ok_or(Error::NotStarted)
    }

    fn record_path(root: &Path, storage_id: u64) -> PathBuf {
        let b = storage_id.to_be_bytes();
        root.join(format!("{:02x}", b[0]))
            .join(format!("{:02x}", b[1]))
            .join(format!("{storage_id:016x}.rec"))
    }

    /// Snapshots the resident block graph into a record image. The chunk
    /// hints remember the resident chunking so a restore re-chunks the
    /// same way.
    fn gather(&self, pool: &Pool, bundle: Handle) -> Result<RecordImage, Error> {
        let primary = pool.with_primary(bundle, |p| p.clone())?;
        let (primary_cbor, primary_hint) = gather_chunks(pool, bundle)?;
        let mut canonicals = Vec::new();
        for cblock in pool.bundle_cblocks(bundle)? {
            let block = pool.with_canonical(cblock, |c| c.clone())?;
            let (cbor, chunk_hint) = gather_chunks(pool, cblock)?;
            canonicals.push(CanonicalImage {
                block,
                chunk_hint,
                cbor,
            });
        }
        Ok(RecordImage {
            primary,
            primary_hint,
            primary_cbor,
            canonicals,
        })
    }

    /// Rebuilds the bundle block graph from a decoded record. On any
    /// allocation failure the partial graph is recycled as one unit.
    fn rebuild(&self, pool: &Pool, img: &RecordImage, storage_id: u64) -> Result<Handle, Error> {
        let primary = pool.alloc_primary(sig::PRIMARY, None, 255)?;
        let built = (|| {
            pool.with_primary_mut(primary, |p| {
                *p = img.primary.clone();
                p.delivery.committed_storage_id = storage_id;
            })?;
            append_chunked(pool, primary, &img.primary_cbor, img.primary_hint)?;
            for c in &img.canonicals {
                let cblock = pool.alloc_canonical(sig::CANONICAL, None, 255)?;
                // Attach before filling: the primary then owns the
                // canonical's cleanup on the error path below.
                pool.bundle_append_cblock(primary, cblock)?;
                pool.with_canonical_mut(cblock, |dst| *dst = c.block.clone())?;
                append_chunked(pool, cblock, &c.cbor, c.chunk_hint)?;
            }
            Ok::<_, Error>(())
        })();
        if let Err(e) = built {
            let _ = pool.recycle_block(primary);
            return Err(e);
        }
        Ok(primary)
    }
}

fn gather_chunks(pool: &Pool, block: Handle) -> Result<(Vec<u8>, u32), Error> {
    let mut data = Vec::new();
    let mut hint = 0u32;
    for chunk in pool.bundle_chunks(block)? {
        pool.with_chunk(chunk, |b| {
            hint = hint.max(b.len() as u32);
            data.extend_from_slice(b);
        })?;
    }
    Ok((data, hint))
}

fn append_chunked(pool: &Pool, block: Handle, data: &[u8], hint: u32) -> Result<(), Error> {
    for part in data.chunks(hint.max(1) as usize) {
        let chunk = pool.alloc_chunk(sig::CHUNK, Bytes::copy_from_slice(part), 255)?;
        pool.bundle_append_chunk(block, chunk)?;
    }
    Ok(())
}

fn write_record(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = remove_file(&tmp);
    }
    result
}

impl Offload for LocalDiskOffload {
    fn configure(&self, key: &str, value: &str) -> Result<(), Error> {
        match key {
            "store_dir" => {
                if value.is_empty() {
                    return Err(Error::InvalidValue {
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
                self.lock().config.store_dir = Some(PathBuf::from(value));
                Ok(())
            }
            _ => Err(Error::UnknownKey(key.to_string())),
        }
    }

    fn start(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.root.is_some() {
            return Ok(());
        }
        let root = match &inner.config.store_dir {
            Some(dir) => dir.clone(),
            None => directories::ProjectDirs::from("dtn", "cairn", env!("CARGO_PKG_NAME"))
                .map(|dirs| dirs.cache_dir().to_path_buf())
                .unwrap_or_else(|| Path::new("/var/spool").join(env!("CARGO_PKG_NAME"))),
        };
        create_dir_all(&root)?;
        info!(root = %root.display(), "Using bundle record directory");
        inner.root = Some(root);
        Ok(())
    }

    fn stop(&self) {
        if self.lock().root.take().is_some() {
            info!("Stopped bundle record store");
        }
    }

    fn offload(&self, pool: &Pool, bundle: Handle) -> Result<u64, Error> {
        let root = self.root()?;
        let data = record::encode(&self.gather(pool, bundle)?);

        // Storage ids are random non-zero u64s; retry the rare collision
        // with an existing record.
        let (storage_id, path) = loop {
            let candidate = rand::random::<u64>();
            if candidate == 0 {
                continue;
            }
            let path = Self::record_path(&root, candidate);
            if !path.exists() {
                break (candidate, path);
            }
        };
        write_record(&path, &data)?;
        trace!(storage_id, bytes = data.len(), "Persisted bundle record");
        Ok(storage_id)
    }

    fn restore(&self, pool: &Pool, storage_id: u64) -> Result<Handle, Error> {
        let root = self.root()?;
        let path = Self::record_path(&root, storage_id);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(storage_id))
            }
            Err(e) => return Err(e.into()),
        };
        let img = match record::decode(&data) {
            Ok(img) => img,
            Err(e) => {
                error!(storage_id, error = %e, "Discarding unreadable bundle record");
                let _ = remove_file(&path);
                return Err(Error::CorruptRecord { storage_id });
            }
        };
        let primary = self.rebuild(pool, &img, storage_id)?;
        trace!(storage_id, "Restored bundle record");
        Ok(primary)
    }

    fn release(&self, storage_id: u64) -> Result<(), Error> {
        let root = self.root()?;
        let path = Self::record_path(&root, storage_id);
        match remove_file(&path) {
            Ok(()) => {
                trace!(storage_id, "Released bundle record");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
