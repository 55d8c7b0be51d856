//! Side channel query cancellation.
use std::time::Duration;

use crate::{
    Result,
    common::ByteStr,
    protocol::{backend::BackendKeyData, frontend},
    stream::PgStream,
};

/// Handle to cancel the in-flight statement of one connection.
///
/// Cancellation always opens a fresh transport to the same endpoint, writes
/// a single `CancelRequest` and closes; it is never multiplexed with the
/// main connection. The server acts on it asynchronously: the canceled
/// statement fails with SQLSTATE `57014` on the main connection.
#[derive(Debug, Clone)]
pub struct CancelToken {
    host: ByteStr,
    port: u16,
    key_data: BackendKeyData,
    timeout: Duration,
}

impl CancelToken {
    pub(crate) fn new(
        host: ByteStr,
        port: u16,
        key_data: BackendKeyData,
        timeout: Duration,
    ) -> Self {
        Self { host, port, key_data, timeout }
    }

    /// The backend process this token targets.
    pub fn process_id(&self) -> u32 {
        self.key_data.process_id
    }

    /// Send the cancel request.
    ///
    /// Delivery is best effort: the request races the statement, and a
    /// dropped side connection cannot be distinguished from a server that
    /// ignored the key.
    pub async fn cancel(&self) -> Result<()> {
        let connect = PgStream::connect(&self.host, self.port);

        #[cfg(feature = "tokio")]
        let mut stream = match tokio::time::timeout(self.timeout, connect).await {
            Ok(stream) => stream?,
            Err(_) => return Err(crate::error::ErrorKind::Timeout.into()),
        };
        #[cfg(not(feature = "tokio"))]
        let mut stream = connect.await?;

        stream.send_cancel(frontend::CancelRequest {
            process_id: self.key_data.process_id,
            secret_key: self.key_data.secret_key,
        });
        let _ = stream.shutdown().await;
        Ok(())
    }

    /// [`cancel`][CancelToken::cancel] with the failure swallowed, for spawn
    /// contexts that cannot surface it.
    pub async fn cancel_quiet(self) {
        if let Err(_err) = self.cancel().await {
            #[cfg(feature = "log")]
            log::debug!("cancel request failed: {_err}");
        }
    }
}
