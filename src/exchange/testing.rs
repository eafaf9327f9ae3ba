//! Local websocket servers standing in for the exchange in tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Hex seed accepted by the signer.
pub(crate) const TEST_SIGNING_KEY: &str =
    "0707070707070707070707070707070707070707070707070707070707070707";

#[derive(Clone)]
pub(crate) struct MockServer {
    pub url: String,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Value>>>,
    paths: Arc<Mutex<Vec<String>>>,
}

impl MockServer {
    async fn bind() -> (TcpListener, Self) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Self {
            url: format!("ws://{}", addr),
            connections: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
            paths: Arc::new(Mutex::new(Vec::new())),
        };
        (listener, server)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Params of every request received for `method`.
    pub fn requests_for(&self, method: &str) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r["method"] == method)
            .map(|r| r["params"].clone())
            .collect()
    }

    /// Request URIs (path and query) of every accepted connection.
    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }

    async fn accept(&self, stream: TcpStream) -> Option<WebSocketStream<TcpStream>> {
        let paths = self.paths.clone();
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            paths.lock().unwrap().push(req.uri().to_string());
            Ok(resp)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.ok()?;
        self.connections.fetch_add(1, Ordering::SeqCst);
        Some(ws)
    }
}

fn ok(id: &Value, result: Value) -> Message {
    Message::Text(json!({"id": id, "status": 200, "result": result}).to_string())
}

fn err(id: &Value, status: u16, code: i64, msg: &str) -> Message {
    Message::Text(
        json!({"id": id, "status": status, "error": {"code": code, "msg": msg}}).to_string(),
    )
}

/// WS API server: logs on anything, echoes, fails, stays silent or drops
/// the connection depending on the method.
pub(crate) async fn spawn_api_server() -> MockServer {
    spawn_api_server_with(&[]).await
}

/// Same as [`spawn_api_server`], but never answers the `silent` methods.
pub(crate) async fn spawn_api_server_with(silent: &'static [&'static str]) -> MockServer {
    let (listener, server) = MockServer::bind().await;
    let handle = server.clone();

    tokio::spawn(async move {
        let mut next_order_id = 1000u64;
        while let Ok((stream, _)) = listener.accept().await {
            let Some(mut ws) = handle.accept(stream).await else {
                continue;
            };
            let requests = handle.requests.clone();

            while let Some(Ok(msg)) = ws.next().await {
                let Message::Text(text) = msg else { continue };
                let Ok(req) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                requests.lock().unwrap().push(req.clone());
                let id = &req["id"];
                let params = &req["params"];

                let method = req["method"].as_str().unwrap_or_default();
                if silent.contains(&method) {
                    continue;
                }
                let reply = match method {
                    "session.logon" => ok(id, json!({"apiKey": params["apiKey"]})),
                    "test.echo" => ok(id, params.clone()),
                    "test.fail" => err(id, 400, -1102, "Mandatory parameter missing"),
                    "test.silent" => continue,
                    "test.drop" => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    "test.ping" => {
                        let _ = ws.send(Message::Ping(b"heartbeat".to_vec())).await;
                        let mut pong = String::new();
                        while let Some(Ok(m)) = ws.next().await {
                            if let Message::Pong(p) = m {
                                pong = String::from_utf8_lossy(&p).to_string();
                                break;
                            }
                        }
                        ok(id, json!({"pong": pong}))
                    }
                    "userDataStream.start" | "userDataStream.ping" => {
                        ok(id, json!({"listenKey": "lk-test"}))
                    }
                    "order.place" => {
                        next_order_id += 1;
                        ok(
                            id,
                            json!({
                                "orderId": next_order_id,
                                "symbol": params["symbol"],
                                "status": "NEW",
                                "clientOrderId": params["newClientOrderId"],
                                "price": params.get("price").cloned().unwrap_or(json!("0")),
                                "avgPrice": "0",
                                "origQty": params.get("quantity").cloned().unwrap_or(json!("0")),
                                "executedQty": "0",
                                "type": params["type"],
                                "reduceOnly": params.get("reduceOnly").is_some(),
                                "closePosition": params.get("closePosition").is_some(),
                                "side": params["side"],
                                "stopPrice": params.get("stopPrice").cloned().unwrap_or(json!("0")),
                                "updateTime": 1700000000000i64
                            }),
                        )
                    }
                    "order.cancel" if params["orderId"] == "404" => {
                        err(id, 400, -2011, "Unknown order sent.")
                    }
                    "order.cancel" => ok(
                        id,
                        json!({
                            "orderId": params["orderId"],
                            "symbol": params["symbol"],
                            "status": "CANCELED",
                            "side": "SELL",
                            "type": "STOP_MARKET"
                        }),
                    ),
                    _ => err(id, 400, -1, "unknown method"),
                };

                if ws.send(reply).await.is_err() {
                    break;
                }
            }
        }
    });

    server
}

/// Stream server: on every connection sends `frames`, then either keeps the
/// connection open or closes it.
pub(crate) async fn spawn_stream_server(frames: Vec<String>, close_after: bool) -> MockServer {
    let (listener, server) = MockServer::bind().await;
    let handle = server.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let Some(mut ws) = handle.accept(stream).await else {
                continue;
            };
            let frames = frames.clone();
            tokio::spawn(async move {
                for frame in frames {
                    if ws.send(Message::Text(frame)).await.is_err() {
                        return;
                    }
                }
                if close_after {
                    let _ = ws.close(None).await;
                    return;
                }
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });

    server
}

/// TCP server that accepts but never completes a websocket handshake.
pub(crate) async fn spawn_silent_tcp_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    url
}

/// Minimal REST endpoint for `/fapi/v1/order`: POST accepts the order, GET
/// finds it by client id only when `order_known`.
#[derive(Clone)]
pub(crate) struct HttpMock {
    pub url: String,
    request_lines: Arc<Mutex<Vec<String>>>,
}

impl HttpMock {
    /// Requests received for `method` on `path`, query ignored.
    pub fn count(&self, method: &str, path: &str) -> usize {
        let prefix = format!("{} {}?", method, path);
        self.request_lines
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.starts_with(&prefix))
            .count()
    }
}

fn query_param(request_line: &str, key: &str) -> String {
    let query = request_line
        .split_whitespace()
        .nth(1)
        .and_then(|target| target.split_once('?'))
        .map(|(_, q)| q)
        .unwrap_or_default();
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
        .unwrap_or_default()
}

fn rest_order(client_order_id: &str, status: &str) -> Value {
    json!({
        "orderId": 4242,
        "symbol": "BTCUSDT",
        "status": status,
        "clientOrderId": client_order_id,
        "price": "0",
        "avgPrice": "100",
        "origQty": "0.01",
        "executedQty": "0.01",
        "type": "MARKET",
        "side": "BUY",
        "updateTime": 1700000000000i64
    })
}

pub(crate) async fn spawn_http_server(order_known: bool) -> HttpMock {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mock = HttpMock {
        url: format!("http://{}", listener.local_addr().unwrap()),
        request_lines: Arc::new(Mutex::new(Vec::new())),
    };
    let lines = mock.request_lines.clone();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let lines = lines.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut chunk = [0u8; 4096];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&chunk[..n]),
                    }
                }
                let text = String::from_utf8_lossy(&head);
                let line = text.lines().next().unwrap_or_default().to_string();
                lines.lock().unwrap().push(line.clone());

                let (status, body) = if line.starts_with("POST /fapi/v1/order?") {
                    (200, rest_order(&query_param(&line, "newClientOrderId"), "NEW"))
                } else if line.starts_with("GET /fapi/v1/order?") && order_known {
                    (200, rest_order(&query_param(&line, "origClientOrderId"), "FILLED"))
                } else if line.starts_with("GET /fapi/v1/order?") {
                    (400, json!({"code": -2013, "msg": "Order does not exist."}))
                } else {
                    (404, json!({"code": -1, "msg": "not found"}))
                };

                let body = body.to_string();
                let response = format!(
                    "HTTP/1.1 {} MOCK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    mock
}
