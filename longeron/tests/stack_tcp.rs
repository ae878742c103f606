//! End-to-end: a group server backed by the TCP listener node.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use compio::buf::BufResult;
use compio::io::{AsyncReadExt, AsyncWriteExt};
use compio::net::TcpStream;
use futures::FutureExt;
use longeron::hosting::{GroupServer, ServiceEndpoint, ServiceGroup, ServiceHost, ServiceStackBuilder};
use longeron::{CancelToken, TcpConfig, TcpServer};

struct SilentHost(SocketAddr);

impl ServiceHost for SilentHost {
    fn name(&self) -> &str {
        "silent"
    }
    fn transport(&self) -> SocketAddr {
        self.0
    }
    fn on_service_attach(&self, _endpoints: &[ServiceEndpoint]) {}
    fn on_service_detach(&self, _endpoints: &[ServiceEndpoint]) {}
}

/// Echoes one connection's bytes back, then drains until cancelled.
struct EchoGroupServer {
    group: Arc<ServiceGroup>,
    addr_tx: flume::Sender<SocketAddr>,
}

#[async_trait(?Send)]
impl GroupServer for EchoGroupServer {
    fn group(&self) -> Arc<ServiceGroup> {
        self.group.clone()
    }

    async fn run(self: Box<Self>, cancel: CancelToken) {
        let mut node = TcpServer::new(TcpConfig::new("127.0.0.1:0".parse().unwrap()));
        let addr = node.listen().await.unwrap();
        let _ = self.addr_tx.send(addr);

        loop {
            let accepted = {
                let mut accept = std::pin::pin!(node.accept().fuse());
                let mut stopping = std::pin::pin!(cancel.cancelled().fuse());
                futures::select! {
                    res = accept => res,
                    () = stopping => break,
                }
            };
            let Ok(desc) = accepted else { break };

            let stream = desc.stream();
            let mut buf = [0u8; 64];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            node.close_connection(desc, false).await.ok();
        }

        node.close();
        node.wait_for_exit().await;
    }
}

#[compio::test]
async fn echo_flows_through_the_stack() {
    let (addr_tx, addr_rx) = flume::unbounded();
    let host: Arc<dyn ServiceHost> = Arc::new(SilentHost("127.0.0.1:8080".parse().unwrap()));
    let stack = ServiceStackBuilder::new()
        .with_host(host)
        .build(move |group| {
            Box::new(EchoGroupServer {
                group,
                addr_tx: addr_tx.clone(),
            })
        })
        .unwrap();

    stack.start_servers(None).unwrap();
    let addr = addr_rx.recv_async().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let BufResult(res, _) = client.write_all(b"Hello".to_vec()).await;
    res.unwrap();
    let BufResult(res, echoed) = client.read_exact(vec![0u8; 5]).await;
    res.unwrap();
    assert_eq!(echoed, b"Hello");
    drop(client);

    stack.stop_and_wait().await.unwrap();
}
