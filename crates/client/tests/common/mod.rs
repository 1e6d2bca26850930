//! Servers shared by the client integration tests

#![allow(dead_code)]

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tether_server::{Context, Server, ServerConfig, ServiceBuilder, ServiceError};
use tokio::net::TcpListener;
use tokio::time::sleep;

#[derive(Debug, Serialize, Deserialize)]
pub struct Args {
    pub a: i64,
    pub b: i64,
}

pub struct TestServer {
    pub server: Server,
    pub addr: String,
    pub hits: Arc<AtomicUsize>,
}

impl TestServer {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Start an `Arith` server named `name` whose `Whoami` answers after `delay`.
pub async fn spawn_server(name: &str, delay: Duration) -> TestServer {
    let hits = Arc::new(AtomicUsize::new(0));
    let server = Server::new(ServerConfig::default());

    let whoami = name.to_string();
    let counter = Arc::clone(&hits);
    server
        .register(
            ServiceBuilder::new("Arith")
                .method("Mul", |ctx: Context, args: Args| async move {
                    ctx.set_response_metadata("handled-by", "arith");
                    Ok::<_, ServiceError>(args.a * args.b)
                })
                .method("Whoami", move |_ctx: Context, (): ()| {
                    let whoami = whoami.clone();
                    async move {
                        sleep(delay).await;
                        Ok::<_, ServiceError>(whoami)
                    }
                })
                .method("Count", move |_ctx: Context, (): ()| {
                    let counter = Arc::clone(&counter);
                    async move {
                        Ok::<_, ServiceError>(counter.fetch_add(1, Ordering::SeqCst) + 1)
                    }
                })
                .method("Slow", |_ctx: Context, millis: u64| async move {
                    sleep(Duration::from_millis(millis)).await;
                    Ok::<_, ServiceError>(millis)
                })
                .method("Who", |ctx: Context, (): ()| async move {
                    sleep(Duration::from_millis(50)).await;
                    Ok::<_, ServiceError>(ctx.get("who").unwrap_or_default().to_string())
                })
                .method("Fail", |_ctx: Context, (): ()| async move {
                    Err::<(), _>(ServiceError::new("always fails"))
                })
                .raw_method("Echo", |_ctx: Context, payload: Bytes| async move {
                    Ok(payload)
                }),
        )
        .expect("Failed to register service");

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("No local address").to_string();
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });

    TestServer { server, addr, hits }
}

/// An address nothing listens on.
pub fn dead_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
    let addr = listener.local_addr().expect("No local address").to_string();
    drop(listener);
    addr
}
