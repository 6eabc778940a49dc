//! Outbound forwarding: dials the real upstream for each request the
//! pipeline decided to forward, and translates between the transport-agnostic
//! `devproxy_core` model and hyper's wire types.
//!
//! One connection per request, no pooling — dev-proxy sits in front of local
//! development traffic, not production load, so the extra round trip a fresh
//! handshake costs is not worth the bookkeeping a connection pool would add.

use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use devproxy_core::{Body, ProxyError, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

const VIA: &str = concat!("dev-proxy/", env!("CARGO_PKG_VERSION"));

pub struct Forwarder {
    tls_config: Arc<rustls::ClientConfig>,
}

impl Forwarder {
    pub fn new() -> anyhow::Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        let loaded = rustls_native_certs::load_native_certs();
        for err in &loaded.errors {
            tracing::warn!(error = %err, "skipped an unreadable native certificate");
        }
        for cert in loaded.certs {
            let _ = roots.add(cert);
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self { tls_config: Arc::new(config) })
    }

    /// Sends `request` to its own `uri`'s host, over TLS if the scheme calls
    /// for it, and returns the upstream's answer translated back into the
    /// pipeline's model.
    pub async fn send(&self, request: &Request) -> Result<Response, ProxyError> {
        self.send_inner(request)
            .await
            .map_err(ProxyError::UpstreamUnreachable)
    }

    async fn send_inner(&self, request: &Request) -> anyhow::Result<Response> {
        let host = request.host().context("request has no host")?;
        let scheme = request.uri.scheme_str().unwrap_or("https").to_string();
        let port = request
            .uri
            .port_u16()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });

        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .with_context(|| format!("connecting to {host}:{port}"))?;

        let mut sender = if scheme == "https" {
            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| anyhow::anyhow!("{host} is not a valid TLS server name"))?;
            let tls = TlsConnector::from(self.tls_config.clone())
                .connect(server_name, tcp)
                .await
                .with_context(|| format!("tls handshake with {host}"))?;
            self.handshake(tls).await?
        } else {
            self.handshake(tcp).await?
        };

        let hyper_request = self.build_request(request, &host)?;
        let hyper_response = sender
            .send_request(hyper_request)
            .await
            .with_context(|| format!("sending request to {host}"))?;

        translate_response(hyper_response).await
    }

    async fn handshake<T>(&self, io: T) -> anyhow::Result<http1::SendRequest<Full<Bytes>>>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, conn) = http1::handshake(TokioIo::new(io)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "upstream connection closed");
            }
        });
        Ok(sender)
    }

    fn build_request(&self, request: &Request, host: &str) -> anyhow::Result<hyper::Request<Full<Bytes>>> {
        let path_and_query = request
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut builder = hyper::Request::builder()
            .method(request.method.clone())
            .uri(path_and_query);

        let headers = builder.headers_mut().expect("builder has no error yet");
        for (name, value) in request.headers.iter() {
            headers.append(name, value.clone());
        }
        headers.insert(http::header::HOST, http::HeaderValue::from_str(host)?);
        headers.insert("via", http::HeaderValue::from_static(VIA));

        let body = request.body.as_ref().map(|b| b.bytes.clone()).unwrap_or_default();
        Ok(builder.body(Full::new(body))?)
    }
}

async fn translate_response(response: hyper::Response<hyper::body::Incoming>) -> anyhow::Result<Response> {
    let (parts, incoming) = response.into_parts();
    let collected = incoming.collect().await?.to_bytes();
    let content_type = parts
        .headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut out = Response::new(parts.status);
    out.headers = parts.headers;
    if !collected.is_empty() {
        out.body = Some(Body::bytes(collected, content_type));
    }
    Ok(out)
}
