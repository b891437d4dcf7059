//! End-to-end proxy routing against a local forwarding proxy

use httpaccess::{
    HttpAccess, HttpAccessError, HttpAccessService, HttpClientConfiguration, RequestOptions,
};
use httpmock::prelude::*;
use secrecy::SecretString;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Request heads received by [`spawn_proxy`], one entry per connection
type Heads = Arc<Mutex<Vec<Vec<String>>>>;

/// Minimal forwarding proxy.
///
/// Absolute-form requests are rewritten to origin form and piped to their
/// target. `CONNECT` is refused with 403.
async fn spawn_proxy() -> (u16, Heads) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let heads = Heads::default();

    let recorded = heads.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let recorded = recorded.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stream);
                let mut head = Vec::new();
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).await.unwrap() == 0 {
                        return;
                    }
                    let line = line.trim_end().to_owned();
                    if line.is_empty() {
                        break;
                    }
                    head.push(line);
                }
                recorded.lock().unwrap().push(head.clone());

                let mut parts = head[0].split_whitespace();
                let method = parts.next().unwrap().to_owned();
                let target = parts.next().unwrap().to_owned();
                let version = parts.next().unwrap().to_owned();

                if method == "CONNECT" {
                    let mut client = reader.into_inner();
                    _ = client.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await;
                    return;
                }

                let uri: http::Uri = target.parse().unwrap();
                let authority = uri.authority().unwrap().to_string();
                let path = uri.path_and_query().map_or("/", |p| p.as_str()).to_owned();
                head[0] = format!("{method} {path} {version}");

                let mut upstream = TcpStream::connect(authority).await.unwrap();
                let mut forwarded = head.join("\r\n").into_bytes();
                forwarded.extend_from_slice(b"\r\n\r\n");
                forwarded.extend_from_slice(reader.buffer());
                upstream.write_all(&forwarded).await.unwrap();

                let mut client = reader.into_inner();
                _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            });
        }
    });

    (port, heads)
}

fn proxied(port: u16) -> HttpClientConfiguration {
    HttpClientConfiguration {
        proxy_host: Some("127.0.0.1".to_owned()),
        proxy_port: Some(port.to_string()),
        ..Default::default()
    }
}

fn has_proxy_authorization(head: &[String]) -> bool {
    head.iter().any(|line| {
        line.to_ascii_lowercase()
            .starts_with("proxy-authorization: basic ym9iom")
    })
}

#[tokio::test]
async fn test_http_request_is_forwarded_in_absolute_form() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/via-proxy");
        then.status(200).body("forwarded");
    });
    let (proxy_port, heads) = spawn_proxy().await;

    let access = HttpAccess::new(Arc::new(HttpAccessService::new(proxied(proxy_port)).unwrap()));
    let text = access
        .do_get(&server.url("/via-proxy"), RequestOptions::new())
        .await
        .unwrap();

    mock.assert();
    assert_eq!(text, "forwarded");

    let heads = heads.lock().unwrap();
    assert_eq!(heads.len(), 1);
    let expected = format!("GET http://127.0.0.1:{}/via-proxy HTTP/1.1", server.port());
    assert_eq!(heads[0][0], expected);
    assert!(
        !heads[0]
            .iter()
            .any(|line| line.to_ascii_lowercase().starts_with("proxy-authorization"))
    );
}

#[tokio::test]
async fn test_proxy_credentials_are_sent_with_forwarded_request() {
    let server = MockServer::start();
    let _m = server.mock(|when, then| {
        when.method(GET).path("/private");
        then.status(200);
    });
    let (proxy_port, heads) = spawn_proxy().await;

    let config = HttpClientConfiguration {
        proxy_user_name: Some("bob".to_owned()),
        proxy_password: Some(SecretString::new("s3cret".into())),
        ..proxied(proxy_port)
    };
    let access = HttpAccess::new(Arc::new(HttpAccessService::new(config).unwrap()));
    access
        .do_get(&server.url("/private"), RequestOptions::new())
        .await
        .unwrap();

    let heads = heads.lock().unwrap();
    assert_eq!(heads.len(), 1);
    assert!(heads[0][0].starts_with("GET http://"));
    assert!(has_proxy_authorization(&heads[0]));
}

#[tokio::test]
async fn test_https_request_opens_connect_tunnel() {
    let (proxy_port, heads) = spawn_proxy().await;

    let config = HttpClientConfiguration {
        proxy_user_name: Some("bob".to_owned()),
        proxy_password: Some(SecretString::new("s3cret".into())),
        ..proxied(proxy_port)
    };
    let access = HttpAccess::new(Arc::new(HttpAccessService::new(config).unwrap()));
    let result = access
        .do_get("https://secure.example:8443/x", RequestOptions::new())
        .await;

    // the proxy refuses tunnels
    assert!(matches!(result, Err(HttpAccessError::AccessFailed { .. })));

    let heads = heads.lock().unwrap();
    assert_eq!(heads.len(), 1);
    assert_eq!(heads[0][0], "CONNECT secure.example:8443 HTTP/1.1");
    assert!(has_proxy_authorization(&heads[0]));
}

#[tokio::test]
async fn test_bypassed_host_goes_direct() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/direct");
        then.status(200).body("direct");
    });
    let (proxy_port, heads) = spawn_proxy().await;

    let config = HttpClientConfiguration {
        no_proxy_for: vec!["127.0.0.*".to_owned()],
        ..proxied(proxy_port)
    };
    let access = HttpAccess::new(Arc::new(HttpAccessService::new(config).unwrap()));
    let text = access
        .do_get(&server.url("/direct"), RequestOptions::new())
        .await
        .unwrap();

    mock.assert();
    assert_eq!(text, "direct");
    assert!(heads.lock().unwrap().is_empty());
}
