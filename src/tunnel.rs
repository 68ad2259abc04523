use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::directory::Directory;
use crate::error::TunnelError;
use crate::session::SessionStore;

/// Reserved handshake path; every other path is treated as a data request.
pub const HANDSHAKE_PATH: &str = "/handshake";

/// Fixed acknowledgement body for keep-alive requests.
const KEEPALIVE_ACK: &str = "Keep-alive acknowledged";

/// Connect and total bound for each forwarded upstream request.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state for every tunnel connection.
pub struct TunnelContext {
    pub directory: Arc<Directory>,
    pub sessions: Arc<SessionStore>,
    pub forwarder: Forwarder,
}

/// Shared upstream HTTP client for data forwarding.
///
/// Certificate validation is disabled: sessions may map to arbitrary hosts
/// whose certificates this server cannot anchor. Redirects are not followed;
/// the tunnel relays redirect responses verbatim.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new() -> color_eyre::Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(FORWARD_TIMEOUT)
            .timeout(FORWARD_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
    }
}

/// Accept loop for the HTTP tunnel listener. One task per connection.
pub async fn serve(listener: TcpListener, ctx: Arc<TunnelContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let ctx = Arc::clone(&ctx);
                tokio::task::spawn(async move {
                    let io = TokioIo::new(stream);
                    let client_ip = peer_addr.ip();
                    let service = service_fn(move |req| handle(req, client_ip, Arc::clone(&ctx)));

                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .await
                    {
                        if !err.to_string().contains("connection closed") {
                            warn!("connection from {peer_addr} error: {err:?}");
                        }
                    }
                });
            }
            Err(err) => warn!("accept error: {err} (continuing)"),
        }
    }
}

async fn handle(
    req: Request<Incoming>,
    client_ip: IpAddr,
    ctx: Arc<TunnelContext>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let outcome = if req.uri().path() == HANDSHAKE_PATH {
        handshake(&req, client_ip, &ctx).await
    } else {
        data_request(req, client_ip, &ctx).await
    };
    Ok(outcome.unwrap_or_else(|err| reject(&err)))
}

fn reject(err: &TunnelError) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = Response::new(full(err.to_string()));
    *resp.status_mut() = err.status();
    resp
}

/// Authenticate, resolve the requested domain, and issue a session token.
async fn handshake(
    req: &Request<Incoming>,
    client_ip: IpAddr,
    ctx: &TunnelContext,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, TunnelError> {
    let username = header_str(req.headers(), "username");
    let password = header_str(req.headers(), "password");
    let domain_name = header_str(req.headers(), "domain-name");

    if !ctx.directory.authenticate_user(username, password).await {
        warn!("authentication failed during handshake from {client_ip}");
        return Err(TunnelError::AuthenticationFailed);
    }
    info!("user '{username}' authenticated successfully");

    let Some(target) = ctx.directory.resolve_domain(domain_name).await else {
        warn!("domain not found during handshake: '{domain_name}'");
        return Err(TunnelError::DomainNotFound);
    };

    let token = ctx.sessions.create_session(username, &target, client_ip).await;

    let mut resp = Response::new(empty());
    resp.headers_mut().insert(
        "session-token",
        HeaderValue::from_str(&token).expect("UUID tokens are valid header values"),
    );
    Ok(resp)
}

/// Validate the session, then either acknowledge a keep-alive or forward
/// the request to the session's target.
async fn data_request(
    req: Request<Incoming>,
    client_ip: IpAddr,
    ctx: &TunnelContext,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, TunnelError> {
    let token = header_str(req.headers(), "session-token").to_owned();
    if token.is_empty() {
        warn!("session token missing in request from {client_ip}");
        return Err(TunnelError::AuthenticationFailed);
    }

    let Some(session) = ctx.sessions.get_session(&token).await else {
        warn!("invalid or expired session token from {client_ip}");
        return Err(TunnelError::SessionInvalid);
    };
    if session.client_ip != client_ip {
        warn!(
            "request from {client_ip} does not match session address {}",
            session.client_ip
        );
        return Err(TunnelError::SessionInvalid);
    }
    ctx.sessions.touch(&token).await;
    debug!("session accessed by user '{}'", session.username);

    // Terminal branch: a keep-alive refreshes the session and forwards nothing.
    if header_str(req.headers(), "keep-alive") == "true" {
        debug!("keep-alive received for user '{}'", session.username);
        return Ok(Response::new(full(KEEPALIVE_ACK)));
    }

    let sub_url = header_str(req.headers(), "sub-url").to_owned();
    if sub_url.is_empty() {
        warn!("Sub-URL missing in request from user '{}'", session.username);
        return Err(TunnelError::BadRequest("Sub-URL missing"));
    }

    let target_url = join_target_url(&session.target_base_url, &sub_url);
    info!("proxying request to {target_url}");
    forward(req, &target_url, ctx).await
}

/// Relay one request to the target URL and mirror the response back.
///
/// The session store lock is already released by the time this runs; the
/// upstream round trip never blocks other validations.
async fn forward(
    req: Request<Incoming>,
    target_url: &str,
    ctx: &TunnelContext,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, TunnelError> {
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|_| TunnelError::BadRequest("failed to read request body"))?
        .to_bytes();

    let mut headers = parts.headers;
    // Host and Content-Length follow the outbound URL and body.
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);

    let upstream = ctx
        .forwarder
        .send(parts.method, target_url, headers, body)
        .await
        .map_err(|err| {
            warn!("error when proxying the request: {err}");
            TunnelError::Upstream(err)
        })?;

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    // Framing for the client hop is re-established by hyper.
    headers.remove(TRANSFER_ENCODING);
    headers.remove(CONNECTION);

    let body = upstream.bytes().await.map_err(|err| {
        warn!("error reading upstream response: {err}");
        TunnelError::Upstream(err)
    })?;

    let mut resp = Response::new(full(body));
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    debug!("response sent to client with status {status}");
    Ok(resp)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

/// Join the session's base URL and the request's sub-URL with exactly one
/// separator between them.
fn join_target_url(base: &str, sub: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        sub.trim_start_matches('/')
    )
}

fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}
