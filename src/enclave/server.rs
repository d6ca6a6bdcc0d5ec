//! Enclave request loop.
//!
//! Listens on vsock (or TCP in local development), one task per accepted
//! connection. Each connection carries newline-delimited JSON frames; a
//! parse failure or unknown request type produces an error frame and the
//! loop continues. The idle deadline resets on every frame.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::enclave::{handlers, EnclaveState};
use crate::error::Result;
use crate::proto::{EnclaveRequest, EnclaveResponse};

/// Routes one raw frame to its handler and returns the serialized response
/// frame (without the trailing newline). Exactly one frame per request.
pub fn dispatch(state: &EnclaveState, frame: &[u8]) -> Vec<u8> {
    let request: EnclaveRequest = match serde_json::from_slice(frame) {
        Ok(req) => req,
        Err(e) => {
            debug!(error = %e, "rejecting malformed request frame");
            return error_frame(format!("invalid request: {e}"));
        }
    };

    match request {
        EnclaveRequest::Health => respond(Ok(handlers::health(state))),
        EnclaveRequest::GetAttestation => respond(handlers::get_attestation(state)),
        EnclaveRequest::SessionInit(req) => respond(handlers::session_init(state, req)),
        EnclaveRequest::SessionUnwrap(req) => respond(handlers::session_unwrap(state, req)),
        EnclaveRequest::SessionPrepareDek(req) => {
            respond(handlers::session_prepare_dek(state, req))
        }
        EnclaveRequest::SessionGenerateTableHash(req) => {
            respond(handlers::session_generate_table_hash(state, req))
        }
        EnclaveRequest::Decrypt(req) => respond(handlers::decrypt(state, req)),
    }
}

fn respond<T: Serialize>(result: Result<T>) -> Vec<u8> {
    let response = match result {
        Ok(data) => EnclaveResponse::ok(data),
        Err(e) => EnclaveResponse::failure(e.to_string()),
    };
    serde_json::to_vec(&response).unwrap_or_else(|_| {
        br#"{"success":false,"error":"response serialization failed"}"#.to_vec()
    })
}

fn error_frame(message: String) -> Vec<u8> {
    serde_json::to_vec(&EnclaveResponse::<()>::failure(message)).unwrap_or_else(|_| {
        br#"{"success":false,"error":"response serialization failed"}"#.to_vec()
    })
}

/// Serves one connection until EOF, an IO error, or the idle deadline.
pub async fn serve_connection<S>(state: Arc<EnclaveState>, stream: S, idle_timeout: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::time::timeout(idle_timeout, reader.read_line(&mut line)).await;
        match read {
            Err(_) => {
                debug!("connection idle deadline reached");
                break;
            }
            Ok(Err(e)) => {
                error!(error = %e, "read error on enclave connection");
                break;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {}
        }

        let frame = line.trim();
        if frame.is_empty() {
            continue;
        }

        let response = dispatch(&state, frame.as_bytes());
        if writer.write_all(&response).await.is_err() {
            break;
        }
        if writer.write_all(b"\n").await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
}

/// vsock listener used inside the enclave.
#[cfg(target_os = "linux")]
pub async fn run_vsock(state: Arc<EnclaveState>, port: u32, idle_timeout: Duration) -> Result<()> {
    use tokio_vsock::{VsockAddr, VsockListener, VMADDR_CID_ANY};

    let addr = VsockAddr::new(VMADDR_CID_ANY, port);
    let mut listener = VsockListener::bind(addr)?;
    info!(port, "enclave listening on vsock");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = ?peer, "accepted enclave connection");
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    serve_connection(state, stream, idle_timeout).await;
                });
            }
            Err(e) => error!(error = %e, "vsock accept failed"),
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub async fn run_vsock(_state: Arc<EnclaveState>, _port: u32, _idle: Duration) -> Result<()> {
    Err(crate::error::Error::Config(
        "vsock is only supported on Linux".into(),
    ))
}

/// TCP listener for local development, speaking the same framed protocol.
pub async fn run_tcp(state: Arc<EnclaveState>, port: u16, idle_timeout: Duration) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "enclave listening on tcp (local mode)");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "accepted enclave connection");
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    serve_connection(state, stream, idle_timeout).await;
                });
            }
            Err(e) => error!(error = %e, "tcp accept failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enclave::test_state;
    use crate::proto::{GetAttestationResponse, HealthResponse};

    fn parse<T: serde::de::DeserializeOwned>(frame: &[u8]) -> EnclaveResponse<T> {
        serde_json::from_slice(frame).unwrap()
    }

    #[test]
    fn dispatch_health() {
        let state = test_state();
        let res: EnclaveResponse<HealthResponse> =
            parse(&dispatch(&state, br#"{"type":"health"}"#));
        assert!(res.success);
        assert_eq!(res.data.unwrap().status, "healthy");
    }

    #[test]
    fn dispatch_get_attestation() {
        let state = test_state();
        let res: EnclaveResponse<GetAttestationResponse> =
            parse(&dispatch(&state, br#"{"type":"get_attestation"}"#));
        assert!(res.success);
        assert!(!res.data.unwrap().attestation.is_empty());
    }

    #[test]
    fn dispatch_rejects_malformed_json() {
        let state = test_state();
        let res: EnclaveResponse<()> = parse(&dispatch(&state, b"this is not json"));
        assert!(!res.success);
        assert!(res.error.unwrap().contains("invalid request"));
    }

    #[test]
    fn dispatch_rejects_unknown_type() {
        let state = test_state();
        let res: EnclaveResponse<()> =
            parse(&dispatch(&state, br#"{"type":"open_sesame","payload":{}}"#));
        assert!(!res.success);
    }

    #[test]
    fn dispatch_reports_handler_errors_as_frames() {
        let state = test_state();
        let frame = br#"{"type":"session_unwrap","payload":{"session_id":"nope","items":[]}}"#;
        let res: EnclaveResponse<()> = parse(&dispatch(&state, frame));
        assert!(!res.success);
        assert!(res.error.unwrap().contains("session"));
    }

    #[tokio::test]
    async fn connection_loop_handles_multiple_frames() {
        let state = test_state();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(serve_connection(
            state,
            server,
            Duration::from_secs(5),
        ));

        let (reader, mut writer) = tokio::io::split(client);
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        writer.write_all(b"{\"type\":\"health\"}\n").await.unwrap();
        reader.read_line(&mut line).await.unwrap();
        let res: EnclaveResponse<HealthResponse> = serde_json::from_str(&line).unwrap();
        assert!(res.success);

        // A bad frame keeps the connection alive.
        line.clear();
        writer.write_all(b"garbage\n").await.unwrap();
        reader.read_line(&mut line).await.unwrap();
        let res: EnclaveResponse<()> = serde_json::from_str(&line).unwrap();
        assert!(!res.success);

        line.clear();
        writer
            .write_all(b"{\"type\":\"get_attestation\"}\n")
            .await
            .unwrap();
        reader.read_line(&mut line).await.unwrap();
        let res: EnclaveResponse<GetAttestationResponse> = serde_json::from_str(&line).unwrap();
        assert!(res.success);

        drop(writer);
        drop(reader);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn connection_loop_times_out_when_idle() {
        let state = test_state();
        let (client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(serve_connection(
            state,
            server,
            Duration::from_millis(50),
        ));

        // Send nothing; the loop must end on its own.
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("loop did not time out")
            .unwrap();
        drop(client);
    }
}
