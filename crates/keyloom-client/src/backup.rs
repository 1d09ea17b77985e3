//! Room key export and import.
//!
//! Exports leave the machine as raw bytes. Imports take bytes back and decode
//! them with a validating UTF-8 conversion before the engine sees them.

use keyloom_core::{CryptoEngine, KeyImportCounts};

use crate::{error::ClientError, machine::Machine};

/// Forwards progress only while it strictly increases.
struct ProgressSink<F> {
    sink: F,
    last: usize,
}

impl<F: FnMut(usize, usize)> ProgressSink<F> {
    fn new(sink: F) -> Self {
        Self { sink, last: 0 }
    }

    fn report(&mut self, progress: usize, total: usize) {
        if progress > self.last {
            self.last = progress;
            (self.sink)(progress, total);
        }
    }
}

/// Decode export bytes to the engine's text form.
pub(crate) fn export_text(exported: &[u8]) -> Result<String, ClientError> {
    Ok(String::from_utf8(exported.to_vec())?)
}

impl<E: CryptoEngine> Machine<E> {
    /// Export every room key, protected by `passphrase`.
    ///
    /// `rounds` sets the key derivation work factor.
    pub async fn export_room_keys(
        &self,
        passphrase: &str,
        rounds: u32,
    ) -> Result<Vec<u8>, ClientError> {
        let passphrase = passphrase.to_string();
        let exported =
            self.queue.run(move |engine| engine.export_room_keys(&passphrase, rounds)).await??;

        tracing::info!(rounds, bytes = exported.len(), "room keys exported");
        Ok(exported.into_bytes())
    }

    /// Export with the configured default rounds.
    pub async fn export_room_keys_default(&self, passphrase: &str) -> Result<Vec<u8>, ClientError> {
        self.export_room_keys(passphrase, self.config.default_export_rounds).await
    }

    /// Import room keys from an export.
    ///
    /// # Errors
    ///
    /// - `InvalidExport`: the bytes are not UTF-8
    /// - `Engine`/`Store`: the engine rejected the export or its store failed
    pub async fn import_room_keys(
        &self,
        exported: &[u8],
        passphrase: &str,
    ) -> Result<KeyImportCounts, ClientError> {
        self.import_with_sink(exported, passphrase, None::<fn(usize, usize)>).await
    }

    /// Import room keys, reporting `(progress, total)` after each key.
    ///
    /// The sink runs on the engine worker and sees strictly increasing
    /// progress values.
    pub async fn import_room_keys_with_progress<F>(
        &self,
        exported: &[u8],
        passphrase: &str,
        progress: F,
    ) -> Result<KeyImportCounts, ClientError>
    where
        F: FnMut(usize, usize) + Send + 'static,
    {
        self.import_with_sink(exported, passphrase, Some(progress)).await
    }

    async fn import_with_sink<F>(
        &self,
        exported: &[u8],
        passphrase: &str,
        progress: Option<F>,
    ) -> Result<KeyImportCounts, ClientError>
    where
        F: FnMut(usize, usize) + Send + 'static,
    {
        let text = export_text(exported)?;
        let passphrase = passphrase.to_string();

        let counts = self
            .queue
            .run(move |engine| {
                let mut sink = progress.map(ProgressSink::new);
                engine.import_room_keys(&text, &passphrase, &mut |done, total| {
                    if let Some(sink) = sink.as_mut() {
                        sink.report(done, total);
                    }
                })
            })
            .await??;

        tracing::info!(total = counts.total, imported = counts.imported, "room keys imported");
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_strictly_increasing() {
        let mut seen = Vec::new();
        let mut sink = ProgressSink::new(|done, total| seen.push((done, total)));
        for done in [1, 1, 2, 0, 3, 3] {
            sink.report(done, 3);
        }
        drop(sink);
        assert_eq!(seen, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[test]
    fn zero_progress_is_not_reported() {
        let mut calls = 0;
        let mut sink = ProgressSink::new(|_, _| calls += 1);
        sink.report(0, 0);
        drop(sink);
        assert_eq!(calls, 0);
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        assert!(matches!(export_text(&[0xff, 0xfe]), Err(ClientError::InvalidExport(_))));
        assert!(matches!(export_text(b"-----BEGIN"), Ok(text) if text == "-----BEGIN"));
    }
}
