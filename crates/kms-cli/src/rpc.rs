use std::sync::Arc;

use anyhow::{Context, Result};
use kms_plugin::{EncryptedPayload, ErrorKind, KmsService};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Requests accepted ahead of the oldest unanswered one.
pub const MAX_IN_FLIGHT: usize = 64;

/// One request line. A missing `master_key` falls back to the key the
/// server was started with.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Request {
    Encrypt {
        payload: String,
        #[serde(default)]
        additional_data: String,
        url: String,
        master_key: Option<String>,
    },
    Decrypt {
        ciphertext: String,
        #[serde(default)]
        key: String,
        #[serde(default)]
        additional_data: String,
        #[serde(default)]
        mode: i32,
        url: String,
        master_key: Option<String>,
    },
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Response {
    Encrypted(EncryptedPayload),
    Decrypted { plaintext: String },
    Failed { error: String, kind: ErrorKind },
}

/// Answer one request line. Never fails: errors become `Failed` responses.
pub async fn handle_line(service: &KmsService, default_master_key: &str, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            return Response::Failed {
                error: format!("malformed request: {err}"),
                kind: ErrorKind::Input,
            }
        }
    };

    let result = match request {
        Request::Encrypt {
            payload,
            additional_data,
            url,
            master_key,
        } => {
            let master_key = master_key.as_deref().unwrap_or(default_master_key);
            service
                .encrypt(&payload, &additional_data, &url, master_key)
                .await
                .map(Response::Encrypted)
        }
        Request::Decrypt {
            ciphertext,
            key,
            additional_data,
            mode,
            url,
            master_key,
        } => {
            let master_key = master_key.as_deref().unwrap_or(default_master_key);
            service
                .decrypt(&ciphertext, &key, &additional_data, mode, &url, master_key)
                .await
                .map(|plaintext| Response::Decrypted { plaintext })
        }
    };

    result.unwrap_or_else(|err| Response::Failed {
        error: err.to_string(),
        kind: err.kind(),
    })
}

/// Serve requests until `reader` reaches end of input.
///
/// Each request runs on its own task, so a slow backend call does not hold
/// up the ones behind it. Responses are written in request order.
pub async fn serve<R, W>(
    service: Arc<KmsService>,
    default_master_key: &str,
    reader: R,
    writer: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let default_master_key: Arc<str> = Arc::from(default_master_key);
    let (pending_tx, pending_rx) = mpsc::channel::<JoinHandle<Response>>(MAX_IN_FLIGHT);

    let read = async move {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await.context("reading request")? {
            if line.trim().is_empty() {
                continue;
            }
            let service = service.clone();
            let master_key = default_master_key.clone();
            let task =
                tokio::spawn(async move { handle_line(&service, &master_key, &line).await });
            if pending_tx.send(task).await.is_err() {
                break;
            }
        }
        anyhow::Ok(())
    };

    let (read, write) = tokio::join!(read, write_responses(pending_rx, writer));
    let handled = write?;
    read?;
    info!(handled, "input closed, stopping");
    Ok(())
}

async fn write_responses<W>(mut pending: mpsc::Receiver<JoinHandle<Response>>, mut writer: W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut handled = 0u64;
    while let Some(task) = pending.recv().await {
        let response = task.await.unwrap_or_else(|err| {
            warn!("request task failed: {err}");
            Response::Failed {
                error: format!("request task failed: {err}"),
                kind: ErrorKind::Backend,
            }
        });
        let mut body = serde_json::to_vec(&response)?;
        body.push(b'\n');
        writer.write_all(&body).await.context("writing response")?;
        writer.flush().await?;
        handled += 1;
        debug!(handled, "request served");
    }
    Ok(handled)
}
