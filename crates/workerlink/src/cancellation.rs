//! Out-of-band cancellation of already-sent commands.
//!
//! Once a command has been written, the only way to ask the worker to
//! abandon it is a side channel the worker watches. The engine does not wait
//! for, or verify, any acknowledgement.

use std::io;
use std::path::PathBuf;

pub trait CancellationSignaller: Send + Sync {
    fn signal(&self, seq: u64) -> io::Result<()>;
}

/// Signals cancellation by creating an empty file named `<prefix><seq>`.
///
/// The worker is started with the same prefix and checks for the file while
/// it processes the request.
#[derive(Debug, Clone)]
pub struct FileCancellation {
    prefix: PathBuf,
}

impl FileCancellation {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn path_for(&self, seq: u64) -> PathBuf {
        let mut path = self.prefix.clone().into_os_string();
        path.push(seq.to_string());
        PathBuf::from(path)
    }
}

impl CancellationSignaller for FileCancellation {
    fn signal(&self, seq: u64) -> io::Result<()> {
        let path = self.path_for(seq);
        std::fs::write(&path, b"")?;
        tracing::debug!(seq, path = %path.display(), "Wrote cancellation file");
        Ok(())
    }
}
