//! The forward-proxy listener: plain HTTP requests go straight into the
//! pipeline, `CONNECT` requests open a tunnel — either a raw byte splice for
//! hosts nobody asked to watch, or a TLS-terminated one so watched HTTPS
//! traffic reaches the pipeline too.
//!
//! Grounded on the ironclaw sandbox proxy's `handle_connect`: accept the
//! CONNECT, answer `200` immediately, then drive the actual tunnel in a
//! spawned task once the connection upgrades.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use devproxy_core::{Body, Request, Response};
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::pipeline::Pipeline;
use crate::tls::CertificateMinter;

/// Accepts connections until `cancel` fires, spawning one task per connection.
pub async fn serve(
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    minter: Arc<CertificateMinter>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("proxy listener stopping");
                return;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept a connection");
                        continue;
                    }
                };
                let pipeline = pipeline.clone();
                let minter = minter.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, pipeline, minter).await {
                        tracing::debug!(%peer, error = %e, "connection ended");
                    }
                });
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    pipeline: Arc<Pipeline>,
    minter: Arc<CertificateMinter>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let pipeline = pipeline.clone();
        let minter = minter.clone();
        async move { Ok::<_, Infallible>(handle(req, pipeline, minter).await) }
    });
    server_http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .context("serving proxy connection")
}

async fn handle(
    req: hyper::Request<hyper::body::Incoming>,
    pipeline: Arc<Pipeline>,
    minter: Arc<CertificateMinter>,
) -> hyper::Response<Full<Bytes>> {
    if req.method() == hyper::Method::CONNECT {
        return handle_connect(req, pipeline, minter).await;
    }

    match to_core_request(req, None, "http").await {
        Ok(request) => to_hyper_response(pipeline.process(request).await),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn handle_connect(
    req: hyper::Request<hyper::body::Incoming>,
    pipeline: Arc<Pipeline>,
    minter: Arc<CertificateMinter>,
) -> hyper::Response<Full<Bytes>> {
    let authority = match req.uri().authority().cloned() {
        Some(a) => a,
        None => return error_response(StatusCode::BAD_REQUEST, "CONNECT target is missing a host".to_string()),
    };
    let host = authority.host().to_string();
    let target = authority.as_str().to_string();
    let watched = pipeline.is_host_watched(&host);

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(u) => u,
            Err(e) => {
                tracing::warn!(%host, error = %e, "CONNECT upgrade failed");
                return;
            }
        };
        let client = TokioIo::new(upgraded);

        if watched {
            match minter.acceptor_for(&host) {
                Ok(acceptor) => {
                    if let Err(e) = serve_mitm(client, acceptor, host.clone(), pipeline).await {
                        tracing::debug!(%host, error = %e, "MITM connection ended");
                    }
                }
                Err(e) => {
                    tracing::warn!(%host, error = %e, "certificate mint failed; falling back to a raw tunnel");
                    if let Err(e) = splice(client, &target).await {
                        tracing::debug!(%target, error = %e, "tunnel closed");
                    }
                }
            }
        } else if let Err(e) = splice(client, &target).await {
            tracing::debug!(%target, error = %e, "tunnel closed");
        }
    });

    hyper::Response::builder()
        .status(StatusCode::OK)
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| hyper::Response::new(Full::new(Bytes::new())))
}

/// Terminates TLS over the upgraded connection and feeds every request on it
/// into the pipeline, same as a plain HTTP request would be.
async fn serve_mitm(
    client: TokioIo<hyper::upgrade::Upgraded>,
    acceptor: TlsAcceptor,
    host: String,
    pipeline: Arc<Pipeline>,
) -> anyhow::Result<()> {
    let tls_stream = acceptor.accept(client).await.context("TLS handshake with the client")?;
    let io = TokioIo::new(tls_stream);
    let service = service_fn(move |req| {
        let pipeline = pipeline.clone();
        let host = host.clone();
        async move { Ok::<_, Infallible>(handle_intercepted(req, pipeline, host).await) }
    });
    server_http1::Builder::new()
        .serve_connection(io, service)
        .await
        .context("serving MITM connection")
}

async fn handle_intercepted(
    req: hyper::Request<hyper::body::Incoming>,
    pipeline: Arc<Pipeline>,
    host: String,
) -> hyper::Response<Full<Bytes>> {
    match to_core_request(req, Some(&host), "https").await {
        Ok(request) => to_hyper_response(pipeline.process(request).await),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// Copies bytes in both directions until either side closes, with no
/// inspection at all — used for hosts that aren't in the watch set.
async fn splice(mut client: TokioIo<hyper::upgrade::Upgraded>, target: &str) -> anyhow::Result<()> {
    let mut upstream = TcpStream::connect(target)
        .await
        .with_context(|| format!("connecting to {target}"))?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// Builds a `devproxy_core::Request` from a hyper request. `host_override` and
/// `scheme` reconstruct an absolute URL for requests arriving over a
/// terminated TLS tunnel, where the request line only ever carries a path.
async fn to_core_request(
    req: hyper::Request<hyper::body::Incoming>,
    host_override: Option<&str>,
    scheme: &str,
) -> anyhow::Result<Request> {
    let (parts, incoming) = req.into_parts();
    let bytes = incoming.collect().await?.to_bytes();
    let content_type = parts
        .headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let uri = if parts.uri.authority().is_some() {
        parts.uri.clone()
    } else {
        let host = host_override
            .map(str::to_string)
            .or_else(|| parts.headers.get(http::header::HOST).and_then(|v| v.to_str().ok()).map(str::to_string))
            .context("request has neither an absolute URI nor a Host header")?;
        let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!("{scheme}://{host}{path}").parse().context("reconstructing the request URL")?
    };

    let mut request = Request::new(parts.method, uri);
    request.headers = parts.headers;
    if !bytes.is_empty() {
        request.body = Some(Body::bytes(bytes, content_type));
    }
    Ok(request)
}

fn to_hyper_response(response: Response) -> hyper::Response<Full<Bytes>> {
    let bytes = response.body.map(|b| b.bytes).unwrap_or_default();
    let mut builder = hyper::Response::builder().status(response.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = response.headers;
    }
    builder
        .body(Full::new(bytes))
        .unwrap_or_else(|_| hyper::Response::new(Full::new(Bytes::new())))
}

fn error_response(status: StatusCode, message: String) -> hyper::Response<Full<Bytes>> {
    hyper::Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(message)))
        .unwrap_or_else(|_| hyper::Response::new(Full::new(Bytes::new())))
}
