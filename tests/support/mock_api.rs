use std::{
    collections::{HashMap, VecDeque},
    convert::Infallible,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::helpers::TOKEN;

/// One scripted answer for an entity.
#[derive(Clone, Debug)]
pub enum Reply {
    Document(Value),
    Status(u16),
    Body(String),
    /// Answers after the delay, so responses can complete out of order.
    Delayed(Duration, Box<Reply>),
}

/// Per-entity answers served in order; the last one repeats once the
/// queue runs dry.
#[derive(Clone, Default)]
pub struct MockCensus {
    inner: Arc<Mutex<MockCensusInner>>,
}

#[derive(Default)]
struct MockCensusInner {
    scripts: HashMap<String, VecDeque<Reply>>,
    requests: HashMap<String, usize>,
}

impl MockCensus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, entity: &str, document: Value) -> &Self {
        self.script(entity, vec![Reply::Document(document)])
    }

    /// Answers 429 `times` times before serving `document`.
    pub fn rate_limit_then_serve(&self, entity: &str, times: usize, document: Value) -> &Self {
        let mut replies = vec![Reply::Status(429); times];
        replies.push(Reply::Document(document));
        self.script(entity, replies)
    }

    pub fn script(&self, entity: &str, replies: Vec<Reply>) -> &Self {
        let mut inner = self.inner.lock().expect("mock census poisoned");
        inner.scripts.insert(entity.to_owned(), replies.into());
        self
    }

    pub fn requests_for(&self, entity: &str) -> usize {
        let inner = self.inner.lock().expect("mock census poisoned");
        inner.requests.get(entity).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        let inner = self.inner.lock().expect("mock census poisoned");
        inner.requests.values().sum()
    }

    fn next_reply(&self, entity: &str) -> Option<Reply> {
        let mut inner = self.inner.lock().expect("mock census poisoned");
        *inner.requests.entry(entity.to_owned()).or_insert(0) += 1;
        let queue = inner.scripts.get_mut(entity)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

pub struct MockCensusServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockCensusServer {
    pub async fn start(census: MockCensus) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock census listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock listener address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock listener non-blocking")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let make_service = make_service_fn(move |_| {
            let census = census.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| serve_request(census.clone(), req)))
            }
        });

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock HTTP server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock census server stopped: {err}");
            }
        });

        Ok(Self {
            url: format!("http://{}", addr),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn serve_request(census: MockCensus, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::GET {
        return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED));
    }

    let authorized = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == format!("Bearer {TOKEN}"))
        .unwrap_or(false);
    if !authorized {
        return Ok(status_response(StatusCode::UNAUTHORIZED));
    }

    let Some(entity) = entity_from_path(req.uri().path()) else {
        return Ok(status_response(StatusCode::NOT_FOUND));
    };

    let mut reply = census.next_reply(&entity);
    loop {
        match reply {
            Some(Reply::Delayed(delay, inner)) => {
                tokio::time::sleep(delay).await;
                reply = Some(*inner);
            }
            Some(Reply::Document(document)) => return Ok(json_response(document.to_string())),
            Some(Reply::Body(body)) => return Ok(json_response(body)),
            Some(Reply::Status(code)) => {
                let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                return Ok(status_response(status));
            }
            None => return Ok(status_response(StatusCode::NOT_FOUND)),
        }
    }
}

fn entity_from_path(path: &str) -> Option<String> {
    path.strip_prefix("/COM-")
        .and_then(|rest| rest.strip_suffix(".all.all"))
        .filter(|entity| !entity.is_empty())
        .map(str::to_owned)
}

fn json_response(body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::from(status.to_string()));
    *response.status_mut() = status;
    response
}
