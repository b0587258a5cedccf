//! Plain HTTP through the proxy.

use hyper::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use intercept_proxy::config::{AuthConfig, ProxyConfig};
use intercept_proxy::http::HeaderList;
use intercept_proxy::ConnectionContext;

mod common;

fn client(proxy: reqwest::Proxy) -> reqwest::Client {
    reqwest::Client::builder().proxy(proxy).build().unwrap()
}

#[tokio::test]
async fn forwards_through_proxy() {
    let (backend, mut heads) = common::start_mock_backend("hello from backend").await;
    let proxy = common::start_proxy(ProxyConfig::default(), |s| s).await;

    let client = client(reqwest::Proxy::http(format!("http://{}", proxy.addr)).unwrap());
    let response = client
        .get(format!("http://{backend}/greeting?lang=en"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-backend"], "mock");
    assert_eq!(response.text().await.unwrap(), "hello from backend");

    let head = heads.recv().await.unwrap();
    assert!(head.starts_with("GET /greeting?lang=en HTTP/1.1\r\n"), "{head}");
}

#[tokio::test]
async fn hop_by_hop_headers_are_stripped() {
    let (backend, mut heads) = common::start_mock_backend("ok").await;
    let proxy = common::start_proxy(ProxyConfig::default(), |s| s).await;

    let mut socket = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!(
        "GET http://{backend}/ HTTP/1.1\r\n\
         Host: {backend}\r\n\
         Proxy-Authorization: Basic eDp5\r\n\
         Proxy-Connection: keep-alive\r\n\
         Keep-Alive: timeout=5\r\n\
         TE: trailers\r\n\
         X-Custom: kept\r\n\
         Connection: close\r\n\r\n"
    );
    socket.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    socket.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("ok"));

    let head = heads.recv().await.unwrap().to_ascii_lowercase();
    assert!(head.contains("x-custom: kept"));
    for name in ["proxy-authorization", "proxy-connection", "keep-alive", "te:"] {
        assert!(!head.contains(name), "{name} leaked: {head}");
    }
}

#[tokio::test]
async fn proxy_credentials_are_enforced() {
    let (backend, _heads) = common::start_mock_backend("secret").await;
    let mut config = ProxyConfig::default();
    config.auth = Some(AuthConfig {
        username: "alice".into(),
        password: "wonderland".into(),
    });
    let proxy = common::start_proxy(config, |s| s).await;
    let url = format!("http://{backend}/");

    let anonymous = client(reqwest::Proxy::http(format!("http://{}", proxy.addr)).unwrap());
    let response = anonymous.get(&url).send().await.unwrap();
    assert_eq!(response.status(), 407);
    assert_eq!(response.headers()["proxy-authenticate"], "Basic realm=\"proxy\"");

    let authorized = client(
        reqwest::Proxy::http(format!("http://{}", proxy.addr))
            .unwrap()
            .basic_auth("alice", "wonderland"),
    );
    let response = authorized.get(&url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "secret");
}

#[tokio::test]
async fn handler_can_answer_locally() {
    let (backend, mut heads) = common::start_mock_backend("never").await;
    let proxy = common::start_proxy(ProxyConfig::default(), |s| {
        s.with_handler(|context: ConnectionContext| async move {
            match context {
                ConnectionContext::Http(mut ctx) => {
                    let mut headers = HeaderList::new();
                    headers.append("X-Short-Circuit", "1");
                    ctx.fake_response(StatusCode::IM_A_TEAPOT, headers, "local answer");
                    ctx.connect().await
                }
                mut other => other.connect().await,
            }
        })
    })
    .await;

    let client = client(reqwest::Proxy::http(format!("http://{}", proxy.addr)).unwrap());
    let response = client.get(format!("http://{backend}/")).send().await.unwrap();
    assert_eq!(response.status(), 418);
    assert_eq!(response.headers()["x-short-circuit"], "1");
    assert_eq!(response.text().await.unwrap(), "local answer");
    assert!(heads.try_recv().is_err(), "origin must not be contacted");
}

#[tokio::test]
async fn unreachable_origin_is_502() {
    let closed = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let proxy = common::start_proxy(ProxyConfig::default(), |s| s).await;
    let client = client(reqwest::Proxy::http(format!("http://{}", proxy.addr)).unwrap());
    let response = client.get(format!("http://{closed}/")).send().await.unwrap();
    assert_eq!(response.status(), 502);
}

#[tokio::test]
async fn plain_request_goes_to_upstream_proxy_in_absolute_form() {
    let (upstream, mut heads) = common::start_upstream_proxy(200).await;
    let proxy = common::start_proxy(common::through_upstream(upstream), |s| s).await;

    let mut socket = TcpStream::connect(proxy.addr).await.unwrap();
    socket
        .write_all(b"GET http://origin.test:8080/p?q=1 HTTP/1.1\r\nHost: origin.test:8080\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    socket.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("via upstream"), "{response}");

    let head = heads.recv().await.unwrap();
    assert!(head.starts_with("GET http://origin.test:8080/p?q=1 HTTP/1.1\r\n"), "{head}");
    assert!(head.to_ascii_lowercase().contains("host: origin.test:8080"), "{head}");
}
