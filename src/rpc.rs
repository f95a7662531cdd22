//! Control-surface wire contract (spec.md §4.13/§10): a length-framed
//! MessagePack request/response pair per connection, the same framing
//! `crate::transport::tcp` uses for push/pull, plus a reference Tokio
//! server binding it to [`crate::agent::Agent`]. CLI argument parsing that
//! decides what to send is out of scope; this is only the contract and one
//! implementation of it.

use crate::agent::Agent;
use crate::error::{NserfError, Result};
use crate::query::QueryParam;
use crate::serf::member::{MemberSnapshot, MemberStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const MAX_RPC_FRAME: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    Handshake { version: u32 },
    Auth { auth_key: String },
    Members,
    MembersFiltered { status: Option<MemberStatus>, name: Option<String>, tags: Vec<(String, String)> },
    Join { addrs: Vec<SocketAddr> },
    ForceLeave { node: String, prune: bool },
    Leave,
    UpdateTags { set: HashMap<String, String>, delete: Vec<String> },
    Event { name: String, payload: Vec<u8>, coalesce: bool },
    Query { name: String, payload: Vec<u8>, filter_nodes: Vec<String>, filter_tags: Vec<(String, String)>, request_ack: bool, timeout_ms: Option<u64> },
    Respond { id: u64, payload: Vec<u8> },
    InstallKey { key: [u8; 32] },
    UseKey { key: [u8; 32] },
    RemoveKey { key: [u8; 32] },
    ListKeys,
    Stats,
    GetCoordinate,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    Ok,
    Error { message: String },
    Members(Vec<MemberSnapshot>),
    Joined { count: usize },
    QueryAck { from: String },
    QueryResponse { from: String, payload: Vec<u8> },
    QueryDone,
    KeyResponses(Vec<crate::keymanager::NodeKeyResponse>),
    Stats { members: usize, failed: usize, left: usize, member_time: u64, event_time: u64, query_time: u64 },
    Coordinate(Option<Vec<f64>>),
}

/// Binds `RpcRequest`/`RpcResponse` to an `Agent` instance; exists
/// separately from the server loop so a test can drive it without opening
/// a socket.
pub struct RpcHandler {
    agent: Arc<Agent>,
    auth_key: Option<String>,
    authenticated: bool,
}

impl RpcHandler {
    pub fn new(agent: Arc<Agent>, auth_key: Option<String>) -> Self {
        let authenticated = auth_key.is_none();
        Self { agent, auth_key, authenticated }
    }

    /// Most request variants map to one response; `Query` instead streams
    /// zero or more `QueryAck`/`QueryResponse` frames terminated by
    /// `QueryDone`, written directly to `stream` rather than returned here.
    pub async fn handle(&mut self, req: RpcRequest, stream: &mut TcpStream) -> Result<()> {
        match req {
            RpcRequest::Handshake { version } => {
                if version != 1 {
                    return write_response(stream, &RpcResponse::Error { message: format!("unsupported rpc version {version}") }).await;
                }
                write_response(stream, &RpcResponse::Ok).await
            }
            RpcRequest::Auth { auth_key } => {
                self.authenticated = self.auth_key.as_deref().map(|k| k == auth_key).unwrap_or(true);
                if self.authenticated {
                    write_response(stream, &RpcResponse::Ok).await
                } else {
                    write_response(stream, &RpcResponse::Error { message: "bad auth key".into() }).await
                }
            }
            other => {
                if !self.authenticated {
                    return write_response(stream, &RpcResponse::Error { message: "not authenticated".into() }).await;
                }
                self.handle_authenticated(other, stream).await
            }
        }
    }

    async fn handle_authenticated(&mut self, req: RpcRequest, stream: &mut TcpStream) -> Result<()> {
        match req {
            RpcRequest::Members => write_response(stream, &RpcResponse::Members(self.agent.members())).await,
            RpcRequest::MembersFiltered { status, name, tags } => {
                let members = self.agent.members_filtered(status, name.as_deref(), &tags);
                write_response(stream, &RpcResponse::Members(members)).await
            }
            RpcRequest::Join { addrs } => match self.agent.join(&addrs).await {
                Ok(count) => write_response(stream, &RpcResponse::Joined { count }).await,
                Err(e) => write_response(stream, &RpcResponse::Error { message: e.to_string() }).await,
            },
            RpcRequest::ForceLeave { node, prune } => respond_result(stream, self.agent.force_leave(&node, prune).await).await,
            RpcRequest::Leave => respond_result(stream, self.agent.leave().await).await,
            RpcRequest::UpdateTags { set, delete } => respond_result(stream, self.agent.update_tags(set, delete).await).await,
            RpcRequest::Event { name, payload, coalesce } => {
                respond_result(stream, self.agent.user_event(name, payload, coalesce).await).await
            }
            RpcRequest::Query { name, payload, filter_nodes, filter_tags, request_ack, timeout_ms } => {
                self.stream_query(stream, name, payload, filter_nodes, filter_tags, request_ack, timeout_ms).await
            }
            RpcRequest::Respond { .. } => {
                // Responding to a query this node is *running* (not one it
                // issued) happens through the registered `EventHandler`'s
                // `QueryResponder`, not over this connection; a CLI-side
                // query responder would route through its own query
                // subscription instead of reusing the control connection.
                write_response(stream, &RpcResponse::Error { message: "Respond is only valid from a query event handler".into() }).await
            }
            RpcRequest::InstallKey { key } => match self.agent.install_key(key).await {
                Ok(rs) => write_response(stream, &RpcResponse::KeyResponses(rs)).await,
                Err(e) => write_response(stream, &RpcResponse::Error { message: e.to_string() }).await,
            },
            RpcRequest::UseKey { key } => match self.agent.use_key(key).await {
                Ok(rs) => write_response(stream, &RpcResponse::KeyResponses(rs)).await,
                Err(e) => write_response(stream, &RpcResponse::Error { message: e.to_string() }).await,
            },
            RpcRequest::RemoveKey { key } => match self.agent.remove_key(key).await {
                Ok(rs) => write_response(stream, &RpcResponse::KeyResponses(rs)).await,
                Err(e) => write_response(stream, &RpcResponse::Error { message: e.to_string() }).await,
            },
            RpcRequest::ListKeys => match self.agent.list_keys().await {
                Ok(rs) => write_response(stream, &RpcResponse::KeyResponses(rs)).await,
                Err(e) => write_response(stream, &RpcResponse::Error { message: e.to_string() }).await,
            },
            RpcRequest::Stats => {
                let s = self.agent.stats();
                write_response(stream, &RpcResponse::Stats {
                    members: s.members, failed: s.failed, left: s.left,
                    member_time: s.member_time, event_time: s.event_time, query_time: s.query_time,
                }).await
            }
            RpcRequest::GetCoordinate => write_response(stream, &RpcResponse::Coordinate(self.agent.local_coordinate())).await,
            RpcRequest::Stop => {
                self.agent.shutdown();
                write_response(stream, &RpcResponse::Ok).await
            }
            RpcRequest::Handshake { .. } | RpcRequest::Auth { .. } => unreachable!("handled in handle()"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_query(
        &self,
        stream: &mut TcpStream,
        name: String,
        payload: Vec<u8>,
        filter_nodes: Vec<String>,
        filter_tags: Vec<(String, String)>,
        request_ack: bool,
        timeout_ms: Option<u64>,
    ) -> Result<()> {
        let params = QueryParam {
            filter_nodes,
            filter_tags,
            request_ack,
            timeout: timeout_ms.map(std::time::Duration::from_millis),
            max_responses: 0,
        };
        let mut handle = match self.agent.query(name, payload, params).await {
            Ok(h) => h,
            Err(e) => return write_response(stream, &RpcResponse::Error { message: e.to_string() }).await,
        };
        while let Some(item) = handle.recv().await {
            let resp = match item {
                crate::query::QueryItem::Ack(from) => RpcResponse::QueryAck { from },
                crate::query::QueryItem::Response(r) => RpcResponse::QueryResponse { from: r.from, payload: r.payload },
            };
            write_response(stream, &resp).await?;
        }
        write_response(stream, &RpcResponse::QueryDone).await
    }
}

async fn respond_result(stream: &mut TcpStream, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => write_response(stream, &RpcResponse::Ok).await,
        Err(e) => write_response(stream, &RpcResponse::Error { message: e.to_string() }).await,
    }
}

pub async fn read_request(stream: &mut TcpStream) -> Result<RpcRequest> {
    let len = stream.read_u32().await?;
    if len > MAX_RPC_FRAME {
        return Err(NserfError::Rpc(format!("frame of {len} bytes exceeds max rpc frame size")));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(rmp_serde::from_slice(&buf)?)
}

async fn write_response(stream: &mut TcpStream, resp: &RpcResponse) -> Result<()> {
    let buf = rmp_serde::to_vec_named(resp)?;
    let len = u32::try_from(buf.len()).map_err(|_| NserfError::Rpc("response too large to encode".into()))?;
    stream.write_u32(len).await?;
    stream.write_all(&buf).await?;
    Ok(())
}

/// Reference server: one task per connection, looping `read_request` →
/// `handle` until the peer disconnects or sends `Stop`.
pub async fn serve(agent: Arc<Agent>, bind_addr: SocketAddr, auth_key: Option<String>) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    loop {
        let (mut stream, peer) = listener.accept().await?;
        let agent = agent.clone();
        let auth_key = auth_key.clone();
        tokio::spawn(async move {
            let mut handler = RpcHandler::new(agent, auth_key);
            loop {
                match read_request(&mut stream).await {
                    Ok(RpcRequest::Stop) => {
                        let _ = handler.handle(RpcRequest::Stop, &mut stream).await;
                        break;
                    }
                    Ok(req) => {
                        if handler.handle(req, &mut stream).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(peer = %peer, error = %e, "rpc connection closed");
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_round_trip_through_msgpack() {
        let req = RpcRequest::Event { name: "deploy".into(), payload: vec![1, 2, 3], coalesce: true };
        let encoded = rmp_serde::to_vec_named(&req).unwrap();
        let decoded: RpcRequest = rmp_serde::from_slice(&encoded).unwrap();
        assert!(matches!(decoded, RpcRequest::Event { name, .. } if name == "deploy"));
    }
}
