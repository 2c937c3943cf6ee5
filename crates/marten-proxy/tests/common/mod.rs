#![allow(dead_code)]

use marten_proxy::ProxyConfig;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};

/// Reserve an ephemeral port by binding and immediately releasing it.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

pub async fn test_config() -> ProxyConfig {
    ProxyConfig {
        port: free_port().await,
        ..ProxyConfig::default()
    }
}

pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buffer = [0_u8; 1024];
    while !data.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut buffer).await.expect("read head");
        if read == 0 {
            break;
        }
        data.extend_from_slice(&buffer[..read]);
    }
    data
}

pub async fn read_to_end_lossy<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buffer = [0_u8; 1024];
    loop {
        match stream.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => out.extend_from_slice(&buffer[..read]),
            Err(error)
                if matches!(
                    error.kind(),
                    std::io::ErrorKind::UnexpectedEof
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::BrokenPipe
                ) =>
            {
                break
            }
            Err(error) => panic!("read failed: {error}"),
        }
    }
    out
}

pub async fn connect_client(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect to proxy")
}

/// Recorder that remembers every update it saw.
#[derive(Default)]
pub struct VecRecorder {
    pub records: Mutex<Vec<marten_proxy::RequestRecord>>,
    pub body_bytes: Mutex<Vec<(u64, Vec<u8>)>>,
}

impl marten_proxy::Recorder for VecRecorder {
    fn emit_update(&self, record: &marten_proxy::RequestRecord) {
        self.records.lock().push(record.clone());
    }

    fn emit_update_body(&self, id: u64, chunk: &[u8]) {
        self.body_bytes.lock().push((id, chunk.to_vec()));
    }
}
