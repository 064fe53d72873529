//! Captures what user code writes to stdout/stderr, bounded so a runaway
//! print loop can't exhaust worker memory (spec §4.3 SDK handle routes
//! side-effectful calls out as `Log` messages; this is the print() path).

use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, thiserror::Error)]
#[error("output limit of {limit_bytes} bytes exceeded")]
pub struct OutputLimitExceeded {
    pub limit_bytes: usize,
}

#[derive(Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    limit_bytes: usize,
}

impl OutputBuffer {
    pub fn new(limit_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                stdout: Vec::new(),
                stderr: Vec::new(),
                limit_bytes,
            })),
        }
    }

    pub fn write_stdout(&self, data: &[u8]) -> Result<(), OutputLimitExceeded> {
        let mut inner = self.inner.lock().expect("output buffer mutex poisoned");
        let limit = inner.limit_bytes;
        if inner.stdout.len() + inner.stderr.len() + data.len() > limit {
            return Err(OutputLimitExceeded { limit_bytes: limit });
        }
        inner.stdout.extend_from_slice(data);
        Ok(())
    }

    pub fn write_stderr(&self, data: &[u8]) -> Result<(), OutputLimitExceeded> {
        let mut inner = self.inner.lock().expect("output buffer mutex poisoned");
        let limit = inner.limit_bytes;
        if inner.stdout.len() + inner.stderr.len() + data.len() > limit {
            return Err(OutputLimitExceeded { limit_bytes: limit });
        }
        inner.stderr.extend_from_slice(data);
        Ok(())
    }

    pub fn into_strings(self) -> (String, String) {
        let inner = self.inner.lock().expect("output buffer mutex poisoned");
        (
            String::from_utf8_lossy(&inner.stdout).into_owned(),
            String::from_utf8_lossy(&inner.stderr).into_owned(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_writes_past_the_combined_limit() {
        let buf = OutputBuffer::new(8);
        assert!(buf.write_stdout(b"1234").is_ok());
        assert!(buf.write_stderr(b"5678").is_ok());
        assert!(buf.write_stdout(b"9").is_err());
    }
}
