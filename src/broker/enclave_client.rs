//! Broker-side enclave connection.
//!
//! Each call opens a connection, writes one frame, reads one frame and
//! closes. That discipline keeps responses from ever crossing between
//! concurrent requests, including when the HTTP caller goes away mid-call.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::config::EnclaveAddr;
use crate::error::{Error, Result};
use crate::proto::{EnclaveRequest, EnclaveResponse, GetAttestationResponse};

/// Default timeout for small enclave calls; batched DEK operations pass
/// their own 30 s limit.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(15);

enum Transport {
    /// Production path: host-to-guest vsock.
    Vsock(EnclaveAddr),
    /// Local development against an enclave binary in TCP mode.
    Tcp(String),
}

pub struct EnclaveClient {
    transport: Transport,
}

impl EnclaveClient {
    pub fn vsock(addr: EnclaveAddr) -> Self {
        Self {
            transport: Transport::Vsock(addr),
        }
    }

    pub fn tcp(addr: impl Into<String>) -> Self {
        Self {
            transport: Transport::Tcp(addr.into()),
        }
    }

    /// Sends one request and decodes the single response frame. An error
    /// frame from the enclave surfaces as [`Error::Enclave`].
    pub async fn call<T: DeserializeOwned>(
        &self,
        request: &EnclaveRequest,
        timeout: Duration,
    ) -> Result<T> {
        let frame = serde_json::to_vec(request)?;

        let exchange = async {
            match &self.transport {
                Transport::Vsock(addr) => {
                    #[cfg(target_os = "linux")]
                    {
                        use tokio_vsock::{VsockAddr, VsockStream};
                        let stream =
                            VsockStream::connect(VsockAddr::new(addr.cid, addr.port)).await?;
                        exchange_frame(stream, &frame).await
                    }
                    #[cfg(not(target_os = "linux"))]
                    {
                        let _ = addr;
                        Err(Error::Config("vsock is only supported on Linux".into()))
                    }
                }
                Transport::Tcp(addr) => {
                    let stream = tokio::net::TcpStream::connect(addr).await?;
                    exchange_frame(stream, &frame).await
                }
            }
        };

        let line = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| Error::Enclave("enclave call timed out".into()))??;

        let response: EnclaveResponse<T> = serde_json::from_slice(&line)?;
        if !response.success {
            return Err(Error::Enclave(
                response
                    .error
                    .unwrap_or_else(|| "enclave returned an unspecified error".into()),
            ));
        }
        response
            .data
            .ok_or_else(|| Error::Enclave("enclave response carried no data".into()))
    }

    /// Fetches the cached attestation document (raw bytes).
    pub async fn attestation_document(&self) -> Result<Vec<u8>> {
        let res: GetAttestationResponse = self
            .call(&EnclaveRequest::GetAttestation, DEFAULT_CALL_TIMEOUT)
            .await?;
        let doc = B64
            .decode(&res.attestation)
            .map_err(|e| Error::Enclave(format!("invalid attestation encoding: {e}")))?;
        if doc.is_empty() {
            return Err(Error::Attestation("empty attestation document".into()));
        }
        Ok(doc)
    }
}

async fn exchange_frame<S>(stream: S, frame: &[u8]) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);

    writer.write_all(frame).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(Error::Enclave("no response from enclave".into()));
    }
    debug!(bytes = n, "received enclave response frame");
    Ok(line.trim_end().as_bytes().to_vec())
}
