//! RPC server
//!
//! Newline-delimited JSON over a loopback TCP socket; the sole user↔kernel
//! boundary. Requests are `{"id", "method", "params"}`; responses either
//! `{"id", "result"}` or `{"id", "error": {code, message, data?}}` with a
//! stable code from the error taxonomy. Connections are served concurrently;
//! per-job serialization happens on the job rows underneath.

use crate::kernel::{ChannelOpts, Kernel, SubmitOpts};
use qmk_core::{JobId, KernelError, RightSet, SessionId, TenantId};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct RpcRequest {
    id: Option<u64>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct NegotiateParams {
    tenant: String,
    #[serde(default)]
    requested: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SubmitParams {
    session: String,
    graph: Value,
    #[serde(flatten)]
    opts: SubmitOpts,
}

#[derive(Debug, Deserialize)]
struct JobParams {
    session: String,
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct WaitParams {
    session: String,
    job_id: String,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize)]
struct ChannelParams {
    session: String,
    vq_a: String,
    vq_b: String,
    #[serde(flatten)]
    opts: ChannelOpts,
}

#[derive(Debug, Deserialize)]
struct SessionParams {
    session: String,
}

/// Serve the kernel's RPC surface on its configured address.
pub async fn serve(kernel: Arc<Kernel>) -> std::io::Result<()> {
    let listener = TcpListener::bind(&kernel.config().listen_addr).await?;
    serve_on(kernel, listener).await
}

/// Serve on an already-bound listener (tests bind port 0).
pub async fn serve_on(kernel: Arc<Kernel>, listener: TcpListener) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "rpc listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "rpc connection");
        let kernel = kernel.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(kernel, stream).await {
                debug!(%peer, %err, "rpc connection closed");
            }
        });
    }
}

async fn handle_connection(kernel: Arc<Kernel>, stream: TcpStream) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => {
                let id = request.id;
                match dispatch(&kernel, &request.method, request.params).await {
                    Ok(result) => json!({"id": id, "result": result}),
                    Err(err) => error_response(id, &err),
                }
            }
            Err(err) => error_response(
                None,
                &KernelError::BadRequest(format!("malformed request: {err}")),
            ),
        };
        let mut bytes = serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
        bytes.push(b'\n');
        writer.write_all(&bytes).await?;
    }
    Ok(())
}

fn error_response(id: Option<u64>, err: &KernelError) -> Value {
    let mut error = json!({
        "code": err.code().as_str(),
        "message": err.to_string(),
    });
    if let Some(sub) = err.graph_sub_code() {
        error["data"] = json!({"sub_code": sub});
    }
    json!({"id": id, "error": error})
}

/// Route one request. Unknown methods are `METHOD_NOT_FOUND`.
pub async fn dispatch(kernel: &Kernel, method: &str, params: Value) -> Result<Value, KernelError> {
    match method {
        "negotiate_capabilities" => {
            let p: NegotiateParams = parse(params)?;
            let requested = RightSet::parse_names(p.requested.iter().map(String::as_str))
                .map_err(|name| {
                    KernelError::BadRequest(format!("unknown capability name: {name}"))
                })?;
            let negotiation =
                kernel.negotiate_capabilities(&TenantId::new(p.tenant), requested)?;
            Ok(json!({
                "session_id": negotiation.session_id.to_string(),
                "granted": negotiation.granted.names(),
                "denied": negotiation.denied.names(),
            }))
        }
        "submit_job" => {
            let p: SubmitParams = parse(params)?;
            let session = session_id(&p.session)?;
            let job = kernel.submit_job(session, &p.graph, p.opts)?;
            Ok(json!({"job_id": job.to_string()}))
        }
        "get_job_status" => {
            let p: JobParams = parse(params)?;
            let status = kernel.get_job_status(session_id(&p.session)?, job_id(&p.job_id)?)?;
            to_value(&status)
        }
        "wait_for_job" => {
            let p: WaitParams = parse(params)?;
            let result = kernel
                .wait_for_job(session_id(&p.session)?, job_id(&p.job_id)?, p.timeout_ms)
                .await?;
            to_value(&result)
        }
        "cancel_job" => {
            let p: JobParams = parse(params)?;
            let state = kernel.cancel_job(session_id(&p.session)?, job_id(&p.job_id)?)?;
            Ok(json!({"ack": true, "state": state.as_str()}))
        }
        "open_channel" => {
            let p: ChannelParams = parse(params)?;
            let token = kernel
                .open_channel(session_id(&p.session)?, &p.vq_a, &p.vq_b, p.opts)
                .await?;
            to_value(&token)
        }
        "get_telemetry" => {
            let p: SessionParams = parse(params)?;
            let report = kernel.get_telemetry(session_id(&p.session)?)?;
            to_value(&report)
        }
        other => Err(KernelError::MethodNotFound(other.to_string())),
    }
}

fn parse<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, KernelError> {
    serde_json::from_value(params)
        .map_err(|err| KernelError::BadRequest(format!("invalid params: {err}")))
}

fn session_id(raw: &str) -> Result<SessionId, KernelError> {
    SessionId::parse(raw)
        .ok_or_else(|| KernelError::BadRequest(format!("malformed session id: {raw}")))
}

fn job_id(raw: &str) -> Result<JobId, KernelError> {
    JobId::parse(raw).ok_or_else(|| KernelError::BadRequest(format!("malformed job id: {raw}")))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, KernelError> {
    serde_json::to_value(value).map_err(|err| KernelError::Internal(err.to_string()))
}
