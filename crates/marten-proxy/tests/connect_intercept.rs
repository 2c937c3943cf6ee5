mod common;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use marten_proxy::{ProxyBuilder, ProxyRequest, Rule};
use marten_tls::{CaStore, CertCache};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use x509_parser::parse_x509_certificate;

use common::{connect_client, read_head, read_to_end_lossy, test_config};

/// Intercept every CONNECT and redirect the decrypted requests to the
/// mock origin.
struct InterceptRule {
    redirect_to: SocketAddr,
}

impl Rule for InterceptRule {
    fn summary(&self) -> String {
        "intercept everything, redirect to the fixture origin".to_string()
    }

    fn before_deal_https_request(
        &self,
        _host: &str,
        _port: u16,
    ) -> impl Future<Output = bool> + Send {
        async { true }
    }

    fn before_send_request(
        &self,
        request: &mut ProxyRequest,
    ) -> impl Future<Output = ()> + Send {
        request.host = self.redirect_to.ip().to_string();
        request.port = self.redirect_to.port();
        async {}
    }
}

fn proxy_ca(dir: &std::path::Path) -> CaStore {
    let store = CaStore::new(dir);
    store.generate(false).expect("generate root");
    store
}

fn client_config_trusting(store: &CaStore) -> Arc<ClientConfig> {
    let root = store.load().expect("load root");
    let mut roots = RootCertStore::empty();
    roots.add(root.cert_der.clone()).expect("add root");
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// TLS origin presenting a leaf for 127.0.0.1 from its own, unrelated CA.
async fn spawn_tls_origin() -> (SocketAddr, tokio::task::JoinHandle<()>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("origin ca dir");
    let store = proxy_ca(dir.path());
    let cache = CertCache::new(Some(Arc::new(store.load().expect("load origin root"))));
    let leaf = cache.get("127.0.0.1").await.expect("origin leaf");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let addr = listener.local_addr().expect("origin addr");
    let acceptor = TlsAcceptor::from(Arc::clone(&leaf.server_config));
    let task = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.expect("accept origin");
        let mut tls = acceptor.accept(tcp).await.expect("origin TLS accept");

        let head = read_head(&mut tls).await;
        let head_text = String::from_utf8_lossy(&head);
        assert!(head_text.starts_with("GET /x HTTP/1.1"), "{head_text}");

        tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
            .await
            .expect("write origin response");
        tls.shutdown().await.expect("shutdown origin");
    });
    (addr, task, dir)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn intercepted_connect_decrypts_and_presents_a_minted_leaf() {
    let (origin_addr, origin_task, _origin_dir) = spawn_tls_origin().await;

    let ca_dir = tempfile::tempdir().expect("ca dir");
    let store = proxy_ca(ca_dir.path());

    let mut config = test_config().await;
    config.cert_dir = Some(ca_dir.path().to_path_buf());
    config.verify_upstream_tls = false;
    let proxy_port = config.port;

    let handle = ProxyBuilder::new(config)
        .with_rule(InterceptRule {
            redirect_to: origin_addr,
        })
        .without_recorder()
        .build()
        .start()
        .await
        .expect("start proxy");

    let mut client = connect_client(proxy_port).await;
    client
        .write_all(b"CONNECT upstream.invalid:443 HTTP/1.1\r\nHost: upstream.invalid:443\r\n\r\n")
        .await
        .expect("write CONNECT");
    let established = read_head(&mut client).await;
    assert!(
        String::from_utf8_lossy(&established).starts_with("HTTP/1.1 200 Connection Established"),
        "{}",
        String::from_utf8_lossy(&established)
    );

    // The client trusts only the test root; the handshake succeeding
    // means the minted chain verifies.
    let connector = TlsConnector::from(client_config_trusting(&store));
    let server_name = ServerName::try_from("upstream.invalid").expect("server name");
    let mut tls = connector
        .connect(server_name, client)
        .await
        .expect("TLS handshake with the MITM listener");

    let peer_certs = tls
        .get_ref()
        .1
        .peer_certificates()
        .expect("peer certificates")
        .to_vec();
    let (_, leaf) = parse_x509_certificate(peer_certs[0].as_ref()).expect("parse leaf");
    let subject_cn = leaf
        .subject()
        .iter_common_name()
        .next()
        .expect("subject CN")
        .as_str()
        .expect("CN utf8");
    assert_eq!(subject_cn, "upstream.invalid");
    let issuer_cn = leaf
        .issuer()
        .iter_common_name()
        .next()
        .expect("issuer CN")
        .as_str()
        .expect("issuer CN utf8");
    assert_eq!(issuer_cn, "Marten");

    tls.write_all(b"GET /x HTTP/1.1\r\nHost: upstream.invalid\r\nConnection: close\r\n\r\n")
        .await
        .expect("write decrypted request");
    let response = read_to_end_lossy(&mut tls).await;
    let response_text = String::from_utf8_lossy(&response);
    assert!(response_text.starts_with("HTTP/1.1 200 OK"), "{response_text}");
    assert!(response_text.ends_with("ok"), "{response_text}");

    origin_task.await.expect("origin task");
    handle.close().await.expect("close proxy");
}

/// Flags when the decision hook runs; under force_proxy_https it must
/// not.
struct FlaggingRule {
    hook_called: Arc<AtomicBool>,
}

impl Rule for FlaggingRule {
    fn before_deal_https_request(
        &self,
        _host: &str,
        _port: u16,
    ) -> impl Future<Output = bool> + Send {
        self.hook_called.store(true, Ordering::SeqCst);
        async { false }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn force_proxy_https_bypasses_the_decision_hook() {
    let ca_dir = tempfile::tempdir().expect("ca dir");
    let store = proxy_ca(ca_dir.path());

    let mut config = test_config().await;
    config.cert_dir = Some(ca_dir.path().to_path_buf());
    config.force_proxy_https = true;
    let proxy_port = config.port;

    let hook_called = Arc::new(AtomicBool::new(false));
    let handle = ProxyBuilder::new(config)
        .with_rule(FlaggingRule {
            hook_called: Arc::clone(&hook_called),
        })
        .without_recorder()
        .build()
        .start()
        .await
        .expect("startup succeeds despite the configuration conflict");

    let mut client = connect_client(proxy_port).await;
    client
        .write_all(b"CONNECT upstream.invalid:443 HTTP/1.1\r\n\r\n")
        .await
        .expect("write CONNECT");
    let established = read_head(&mut client).await;
    assert!(
        String::from_utf8_lossy(&established).starts_with("HTTP/1.1 200 Connection Established"),
        "{}",
        String::from_utf8_lossy(&established)
    );

    // A successful handshake against the minted leaf proves the CONNECT
    // was intercepted rather than tunneled, even though the hook said
    // not to.
    let connector = TlsConnector::from(client_config_trusting(&store));
    let server_name = ServerName::try_from("upstream.invalid").expect("server name");
    let tls = connector
        .connect(server_name, client)
        .await
        .expect("handshake with the MITM listener");
    drop(tls);

    assert!(
        !hook_called.load(Ordering::SeqCst),
        "before_deal_https_request must not run under force_proxy_https"
    );
    handle.close().await.expect("close proxy");
}
