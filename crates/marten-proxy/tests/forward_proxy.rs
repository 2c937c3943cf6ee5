mod common;

use std::future::Future;
use std::sync::Arc;

use marten_proxy::{ProxyBuilder, ProxyRequest, ProxyResponse, Recorder, Rule};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use common::{connect_client, read_head, read_to_end_lossy, test_config, VecRecorder};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn plain_forward_preserves_status_headers_and_body() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let upstream_addr = upstream_listener.local_addr().expect("upstream addr");
    let upstream_task = tokio::spawn(async move {
        let (mut tcp, _) = upstream_listener.accept().await.expect("accept upstream");
        let head = read_head(&mut tcp).await;
        let head_text = String::from_utf8_lossy(&head);
        assert!(head_text.starts_with("GET / HTTP/1.1"), "{head_text}");

        // No Content-Length: the body is delimited by connection close.
        tcp.write_all(b"HTTP/1.1 200 OK\r\nX-Seen: 1\r\n\r\nhi")
            .await
            .expect("write response");
        tcp.shutdown().await.expect("shutdown upstream");
    });

    let config = test_config().await;
    let proxy_port = config.port;
    let handle = ProxyBuilder::new(config)
        .without_recorder()
        .build()
        .start()
        .await
        .expect("start proxy");

    let mut client = connect_client(proxy_port).await;
    let request = format!(
        "GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = upstream_addr.port()
    );
    client
        .write_all(request.as_bytes())
        .await
        .expect("write request");

    let response = read_to_end_lossy(&mut client).await;
    let response_text = String::from_utf8_lossy(&response);
    assert!(response_text.starts_with("HTTP/1.1 200 OK"), "{response_text}");
    assert!(response_text.contains("X-Seen: 1"), "{response_text}");
    assert!(response_text.ends_with("hi"), "{response_text}");

    upstream_task.await.expect("upstream task");
    handle.close().await.expect("close proxy");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn origin_form_without_host_header_gets_400() {
    let config = test_config().await;
    let proxy_port = config.port;
    let handle = ProxyBuilder::new(config)
        .without_recorder()
        .build()
        .start()
        .await
        .expect("start proxy");

    let mut client = connect_client(proxy_port).await;
    client
        .write_all(b"GET / HTTP/1.1\r\n\r\n")
        .await
        .expect("write request");

    let response = read_to_end_lossy(&mut client).await;
    let response_text = String::from_utf8_lossy(&response);
    assert!(
        response_text.starts_with("HTTP/1.1 400 Bad Request"),
        "{response_text}"
    );

    handle.close().await.expect("close proxy");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn requests_for_the_proxy_itself_are_answered_locally() {
    let config = test_config().await;
    let proxy_port = config.port;
    let handle = ProxyBuilder::new(config)
        .without_recorder()
        .build()
        .start()
        .await
        .expect("start proxy");

    let mut client = connect_client(proxy_port).await;
    let request = format!(
        "GET http://127.0.0.1:{proxy_port}/ HTTP/1.1\r\nHost: 127.0.0.1:{proxy_port}\r\nConnection: close\r\n\r\n"
    );
    client
        .write_all(request.as_bytes())
        .await
        .expect("write request");

    let response = read_to_end_lossy(&mut client).await;
    let response_text = String::from_utf8_lossy(&response);
    assert!(response_text.starts_with("HTTP/1.1 200 OK"), "{response_text}");
    assert!(
        response_text.contains("marten proxy is running"),
        "{response_text}"
    );

    handle.close().await.expect("close proxy");
}

struct RewritingRule;

impl Rule for RewritingRule {
    fn summary(&self) -> String {
        "adds a request header, replaces the response body".to_string()
    }

    fn before_send_request(
        &self,
        request: &mut ProxyRequest,
    ) -> impl Future<Output = ()> + Send {
        request.set_header("X-Injected", "yes");
        async {}
    }

    fn before_send_response(
        &self,
        _request: &ProxyRequest,
        response: &mut ProxyResponse,
    ) -> impl Future<Output = ()> + Send {
        response.set_header("X-Rewritten", "1");
        response.body = Some(bytes::Bytes::from_static(b"rewritten"));
        async {}
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rule_hooks_rewrite_request_headers_and_response_bodies() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let upstream_addr = upstream_listener.local_addr().expect("upstream addr");
    let upstream_task = tokio::spawn(async move {
        let (mut tcp, _) = upstream_listener.accept().await.expect("accept upstream");
        let head = read_head(&mut tcp).await;
        let head_text = String::from_utf8_lossy(&head);
        assert!(head_text.contains("X-Injected: yes"), "{head_text}");

        tcp.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\nConnection: close\r\n\r\noriginal")
            .await
            .expect("write response");
        tcp.shutdown().await.expect("shutdown upstream");
    });

    let config = test_config().await;
    let proxy_port = config.port;
    let handle = ProxyBuilder::new(config)
        .with_rule(RewritingRule)
        .without_recorder()
        .build()
        .start()
        .await
        .expect("start proxy");

    let mut client = connect_client(proxy_port).await;
    let request = format!(
        "GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n",
        port = upstream_addr.port()
    );
    client
        .write_all(request.as_bytes())
        .await
        .expect("write request");

    let response = read_to_end_lossy(&mut client).await;
    let response_text = String::from_utf8_lossy(&response);
    assert!(response_text.contains("X-Rewritten: 1"), "{response_text}");
    assert!(response_text.contains("Content-Length: 9"), "{response_text}");
    assert!(response_text.ends_with("rewritten"), "{response_text}");

    upstream_task.await.expect("upstream task");
    handle.close().await.expect("close proxy");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recorder_sees_the_request_and_the_response_status() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let upstream_addr = upstream_listener.local_addr().expect("upstream addr");
    let upstream_task = tokio::spawn(async move {
        let (mut tcp, _) = upstream_listener.accept().await.expect("accept upstream");
        let _head = read_head(&mut tcp).await;
        tcp.write_all(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n")
            .await
            .expect("write response");
        tcp.shutdown().await.expect("shutdown upstream");
    });

    let recorder = Arc::new(VecRecorder::default());
    let config = test_config().await;
    let proxy_port = config.port;
    let handle = ProxyBuilder::new(config)
        .with_recorder(Arc::clone(&recorder) as Arc<dyn Recorder>)
        .build()
        .start()
        .await
        .expect("start proxy");

    let mut client = connect_client(proxy_port).await;
    let request = format!(
        "GET http://127.0.0.1:{port}/status HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n",
        port = upstream_addr.port()
    );
    client
        .write_all(request.as_bytes())
        .await
        .expect("write request");
    let _ = read_to_end_lossy(&mut client).await;

    upstream_task.await.expect("upstream task");
    handle.close().await.expect("close proxy");

    let records = recorder.records.lock().clone();
    assert_eq!(records.len(), 2, "{records:?}");
    assert_eq!(records[0].method, "GET");
    assert_eq!(records[0].path, "/status");
    assert_eq!(records[0].status, None);
    assert_eq!(records[1].status, Some(204));
    assert_eq!(records[0].id, records[1].id);
}
