use std::io;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};

use super::{CacheContents, CacheError};

/// Directory holding one link per action, named by the hex `ActionID`.
pub const ACTION_DIR: &str = "action";
/// Directory holding the content-addressed output blobs, named by the hex `OutputID`.
pub const OUTPUT_DIR: &str = "output";
/// Directory for files that are still being written.
pub const TMP_DIR: &str = "tmp";

const MISS_MARKER_SUFFIX: &str = ".miss";

/// The local disk tier.
///
/// Output blobs are written exactly once: a new blob is first written into a temporary file in
/// [`TMP_DIR`], which lives on the same file system, and then atomically moved to its final
/// name. Readers thus either see nothing or the complete blob.
///
/// The mapping from actions to outputs is stored as symbolic links
/// (`action/<action> -> ../output/<output>`). Links are created once and never replaced.
#[derive(Debug, Clone)]
pub struct DiskStore {
    action_dir: PathBuf,
    output_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl DiskStore {
    /// Opens the disk cache rooted at `cache_dir`, creating its directories if needed.
    pub fn new(cache_dir: &Path) -> io::Result<Self> {
        let store = DiskStore {
            action_dir: cache_dir.join(ACTION_DIR),
            output_dir: cache_dir.join(OUTPUT_DIR),
            tmp_dir: cache_dir.join(TMP_DIR),
        };

        std::fs::create_dir_all(&store.action_dir)?;
        std::fs::create_dir_all(&store.output_dir)?;
        std::fs::create_dir_all(&store.tmp_dir)?;

        Ok(store)
    }

    /// Returns the path of an output blob, whether it exists or not.
    pub fn locate_output(&self, output_id: &str) -> PathBuf {
        self.output_dir.join(output_id)
    }

    fn locate_action(&self, action_id: &str) -> PathBuf {
        self.action_dir.join(action_id)
    }

    fn locate_miss_marker(&self, action_id: &str) -> PathBuf {
        self.action_dir
            .join(format!("{action_id}{MISS_MARKER_SUFFIX}"))
    }

    /// Checks whether the output blob is present.
    pub async fn has_output(&self, output_id: &str) -> CacheContents<bool> {
        fs::try_exists(self.locate_output(output_id))
            .await
            .map_err(|e| CacheError::io("checking for output", e))
    }

    /// Create a new temporary file on the same file system as the cache.
    pub fn tempfile(&self) -> CacheContents<NamedTempFile> {
        // Someone could have wiped the cache directory while we are running, so recreate the
        // directory and retry.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(&self.tmp_dir) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %self.tmp_dir.display(),
                    "Failed to create temporary directory",
                );
                if retries > MAX_RETRIES {
                    return Err(CacheError::io("creating temporary directory", e));
                }
                continue;
            }

            match tempfile::Builder::new()
                .prefix("output")
                .tempfile_in(&self.tmp_dir)
            {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        path = %self.tmp_dir.display(),
                        "Failed to create temporary output file",
                    );
                    if retries > MAX_RETRIES {
                        return Err(CacheError::io("creating temporary output file", e));
                    }
                }
            }
        }
    }

    /// Writes an output blob from `reader`.
    ///
    /// Returns the path of the blob, and whether it already existed. If it did, `reader` is not
    /// touched at all.
    pub async fn write_output<R>(
        &self,
        output_id: &str,
        reader: &mut R,
    ) -> CacheContents<(PathBuf, bool)>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if self.has_output(output_id).await? {
            return Ok((self.locate_output(output_id), true));
        }

        let temp_file = self.tempfile()?;
        let temp_fd = temp_file
            .reopen()
            .map_err(|e| CacheError::io("opening temporary output file", e))?;
        let mut destination = File::from_std(temp_fd);

        tokio::io::copy(reader, &mut destination)
            .await
            .map_err(|e| CacheError::io("copying output to disk", e))?;
        destination
            .flush()
            .await
            .map_err(|e| CacheError::io("flushing output to disk", e))?;
        drop(destination);

        self.persist_output(output_id, temp_file)
    }

    /// Moves a fully written temporary file into place as the blob for `output_id`.
    ///
    /// The first writer wins. If the blob appeared in the meantime, the temporary file is
    /// discarded and `true` is returned as the second tuple element.
    pub fn persist_output(
        &self,
        output_id: &str,
        temp_file: NamedTempFile,
    ) -> CacheContents<(PathBuf, bool)> {
        let path = self.locate_output(output_id);

        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        let mut temp_file = temp_file;
        loop {
            retries += 1;

            match temp_file.persist_noclobber(&path) {
                Ok(_) => return Ok((path, false)),
                Err(tempfile::PersistError { error, .. })
                    if error.kind() == io::ErrorKind::AlreadyExists =>
                {
                    return Ok((path, true));
                }
                Err(tempfile::PersistError { error, file }) => {
                    tracing::error!(
                        error = &error as &dyn std::error::Error,
                        path = %path.display(),
                        "Failed to move output into place",
                    );
                    if retries > MAX_RETRIES {
                        return Err(CacheError::io("renaming output into place", error));
                    }
                    temp_file = file;
                    if let Err(e) = std::fs::create_dir_all(&self.output_dir) {
                        return Err(CacheError::io("creating output directory", e));
                    }
                }
            }
        }
    }

    /// Resolves the output an action is linked to.
    ///
    /// A missing link is not an error, it returns `None`.
    pub async fn action_to_output(&self, action_id: &str) -> CacheContents<Option<String>> {
        match self.read_action_link(&self.locate_action(action_id)).await {
            Ok(output_id) => Ok(Some(output_id)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io("reading action link", e)),
        }
    }

    /// Links an action to its output.
    ///
    /// Returns whether the link already existed. An existing link is left as it is.
    pub async fn link_action(&self, action_id: &str, output_id: &str) -> CacheContents<bool> {
        match self
            .create_action_link(&self.locate_action(action_id), output_id)
            .await
        {
            Ok(()) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(true),
            Err(e) => Err(CacheError::io("linking action to output", e)),
        }
    }

    #[cfg(unix)]
    async fn read_action_link(&self, path: &Path) -> io::Result<String> {
        let target = fs::read_link(path).await?;
        target
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_owned)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid action link"))
    }

    #[cfg(unix)]
    async fn create_action_link(&self, path: &Path, output_id: &str) -> io::Result<()> {
        let target = Path::new("..").join(OUTPUT_DIR).join(output_id);
        fs::symlink(target, path).await
    }

    // Without cheap symlinks, the link is a tiny file containing the output id.
    #[cfg(not(unix))]
    async fn read_action_link(&self, path: &Path) -> io::Result<String> {
        Ok(fs::read_to_string(path).await?.trim().to_owned())
    }

    #[cfg(not(unix))]
    async fn create_action_link(&self, path: &Path, output_id: &str) -> io::Result<()> {
        let temp_file = tempfile::Builder::new()
            .prefix("action")
            .tempfile_in(&self.tmp_dir)?;
        std::fs::write(temp_file.path(), output_id)?;
        temp_file.persist_noclobber(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Checks for a negative-result marker written by [`mark_miss`](Self::mark_miss).
    pub async fn has_miss_marker(&self, action_id: &str) -> CacheContents<bool> {
        fs::try_exists(self.locate_miss_marker(action_id))
            .await
            .map_err(|e| CacheError::io("checking for miss marker", e))
    }

    /// Records that the remote tier does not know `action_id`.
    pub async fn mark_miss(&self, action_id: &str) -> CacheContents<()> {
        File::create(self.locate_miss_marker(action_id))
            .await
            .map_err(|e| CacheError::io("writing miss marker", e))?;
        Ok(())
    }

    /// Removes leftovers of writes that were interrupted, e.g. by a crash.
    ///
    /// Must only be called before any write is in progress.
    pub fn clear_tmp(&self) -> io::Result<()> {
        match std::fs::remove_dir_all(&self.tmp_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        std::fs::create_dir_all(&self.tmp_dir)
    }
}
