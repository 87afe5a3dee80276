//! Minimal HTTP server used as a sniffing target.
//!
//! Every request gets `200 OK` with a `text/plain` body of `"Serving...\n"`
//! followed by the request body.

use std::io;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info};

const BANNER: &[u8] = b"Serving...\n";

/// Accept connections forever, serving each on its own task.
pub async fn serve(listener: TcpListener) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "test server listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(echo))
                .await
            {
                debug!(%peer, error = %err, "test server connection error");
            }
        });
    }
}

async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let body = req.into_body().collect().await?.to_bytes();

    let mut out = Vec::with_capacity(BANNER.len() + body.len());
    out.extend_from_slice(BANNER);
    out.extend_from_slice(&body);

    let mut response = Response::new(Full::new(Bytes::from(out)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    Ok(response)
}
