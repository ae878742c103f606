//! Pipeline behavior over real TCP connections.

use std::time::Duration;

use compio::buf::BufResult;
use compio::io::{AsyncReadExt, AsyncWriteExt};
use compio::net::TcpStream;
use longeron_core::config::TcpConfig;
use longeron_core::error::CoreError;
use longeron_core::listener::TcpServer;

fn local_config() -> TcpConfig {
    TcpConfig::new("127.0.0.1:0".parse().unwrap())
}

async fn read_exactly(stream: &longeron_core::pipeline::PipeStream<'_>, n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    let mut got = 0;
    while got < n {
        let read = stream.read(&mut out[got..]).await.unwrap();
        assert_ne!(read, 0, "unexpected EOF after {got} bytes");
        got += read;
    }
    out
}

#[compio::test]
async fn echo_server_smoke() {
    let mut node = TcpServer::new(local_config());
    let addr = node.listen().await.unwrap();

    let payload = hex::decode("48656c6c6f").unwrap(); // "Hello"
    let expected = payload.clone();
    let client = compio::runtime::spawn(async move {
        let mut sock = TcpStream::connect(addr).await.unwrap();
        let BufResult(res, _) = sock.write_all(payload).await;
        res.unwrap();
        let BufResult(res, buf) = sock.read_exact(vec![0u8; 5]).await;
        res.unwrap();
        buf
    });

    let desc = node.accept().await.unwrap();
    let stream = desc.stream();
    let echoed = read_exactly(&stream, 5).await;
    stream.write_all(&echoed).await.unwrap();

    assert_eq!(client.await, expected);
    node.close_connection(desc, false).await.unwrap();
    node.close();
    node.wait_for_exit().await;
}

#[compio::test]
async fn roundtrip_preserves_large_payload() {
    // Payload is 4x the recv pipe's pause threshold, so the transfer
    // exercises the backpressure path end to end.
    let mut node = TcpServer::new(local_config().with_max_recv_buffer_data(4096));
    let addr = node.listen().await.unwrap();

    let payload: Vec<u8> = (0..4 * 4096u32).map(|i| (i % 251) as u8).collect();
    let sent = payload.clone();
    let client = compio::runtime::spawn(async move {
        let mut sock = TcpStream::connect(addr).await.unwrap();
        let BufResult(res, _) = sock.write_all(sent).await;
        res.unwrap();
    });

    let desc = node.accept().await.unwrap();
    let stream = desc.stream();
    let received = read_exactly(&stream, payload.len()).await;
    assert_eq!(received, payload, "byte stream was not preserved");

    client.await;
    node.close_connection(desc, false).await.unwrap();
    node.close();
    node.wait_for_exit().await;
}

#[compio::test]
async fn send_chunks_through_small_socket_buffer() {
    // A single 32-byte send with an 8-byte socket send size must arrive
    // complete and in order on the peer.
    let mut node = TcpServer::new(local_config().with_buffer_sizes(8192, 8));
    let addr = node.listen().await.unwrap();

    let client = compio::runtime::spawn(async move {
        let mut sock = TcpStream::connect(addr).await.unwrap();
        let BufResult(res, buf) = sock.read_exact(vec![0u8; 32]).await;
        res.unwrap();
        buf
    });

    let desc = node.accept().await.unwrap();
    let payload: Vec<u8> = (0x00..=0x1f).collect();
    desc.stream().write_all(&payload).await.unwrap();

    assert_eq!(client.await, payload);
    node.close_connection(desc, false).await.unwrap();
    node.close();
    node.wait_for_exit().await;
}

#[compio::test]
async fn recv_timeout_preserves_buffered_bytes() {
    let mut node = TcpServer::new(local_config());
    let addr = node.listen().await.unwrap();

    let client = compio::runtime::spawn(async move {
        let mut sock = TcpStream::connect(addr).await.unwrap();
        let BufResult(res, _) = sock.write_all(b"abcd".to_vec()).await;
        res.unwrap();
        compio::time::sleep(Duration::from_millis(150)).await;
        let BufResult(res, _) = sock.write_all(b"ef".to_vec()).await;
        res.unwrap();
        // Keep the connection open until the server is done reading.
        compio::time::sleep(Duration::from_millis(200)).await;
    });

    let desc = node.accept().await.unwrap();
    // Let the first write land in the recv pipe before arming the timer.
    compio::time::sleep(Duration::from_millis(20)).await;
    let stream = desc.stream();
    stream.set_read_timeout(Some(Duration::from_millis(50)));

    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"abcd");

    // Peer is idle: the timer fires and the direction stays usable.
    let err = stream.read(&mut buf).await.unwrap_err();
    assert!(err.is_timeout());

    // The late bytes arrive intact after the timeout.
    stream.set_read_timeout(Some(Duration::from_secs(2)));
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ef");

    client.await;
    node.close_connection(desc, false).await.unwrap();
    node.close();
    node.wait_for_exit().await;
}

#[compio::test]
async fn directions_are_independent() {
    let mut node = TcpServer::new(local_config());
    let addr = node.listen().await.unwrap();

    let outbound: Vec<u8> = (0..16 * 1024u32).map(|i| (i % 13) as u8).collect();
    let expected = outbound.clone();
    let client = compio::runtime::spawn(async move {
        let mut sock = TcpStream::connect(addr).await.unwrap();
        // Read everything the server sends, then reply.
        let BufResult(res, buf) = sock.read_exact(vec![0u8; expected.len()]).await;
        res.unwrap();
        assert_eq!(buf, expected);
        let BufResult(res, _) = sock.write_all(b"pong".to_vec()).await;
        res.unwrap();
        compio::time::sleep(Duration::from_millis(100)).await;
    });

    let desc = node.accept().await.unwrap();
    let stream = desc.stream();
    stream.set_read_timeout(Some(Duration::from_millis(10)));

    // A timed-out read must not interrupt the in-flight send.
    let send = stream.write_all(&outbound);
    let recv = async {
        let mut buf = [0u8; 4];
        loop {
            match stream.read(&mut buf).await {
                Ok(n) => break buf[..n].to_vec(),
                Err(CoreError::Timeout) => continue,
                Err(e) => panic!("recv failed: {e}"),
            }
        }
    };
    let (send_res, reply) = futures::join!(send, recv);
    send_res.unwrap();
    assert_eq!(reply, b"pong");

    client.await;
    node.close_connection(desc, false).await.unwrap();
    node.close();
    node.wait_for_exit().await;
}

#[compio::test]
async fn shared_buffer_pool_is_recycled() {
    let pool = longeron_core::pool::BufferPool::new(8192, 4);
    let mut node = TcpServer::new(local_config().with_buffer_pool(pool.clone()));
    let addr = node.listen().await.unwrap();

    let client = compio::runtime::spawn(async move {
        let mut sock = TcpStream::connect(addr).await.unwrap();
        let BufResult(res, _) = sock.write_all(b"pooled".to_vec()).await;
        res.unwrap();
        drop(sock);
    });

    let desc = node.accept().await.unwrap();
    let stream = desc.stream();
    let received = read_exactly(&stream, 6).await;
    assert_eq!(received, b"pooled");
    client.await;

    // EOF unwinds the recv worker, which hands its buffer back.
    let mut buf = [0u8; 4];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    assert_eq!(pool.cached(), 1);

    node.close_connection(desc, false).await.unwrap();
    node.close();
    node.wait_for_exit().await;
}

#[compio::test]
async fn peer_eof_propagates_to_stream() {
    let mut node = TcpServer::new(local_config());
    let addr = node.listen().await.unwrap();

    let client = compio::runtime::spawn(async move {
        let mut sock = TcpStream::connect(addr).await.unwrap();
        let BufResult(res, _) = sock.write_all(b"bye".to_vec()).await;
        res.unwrap();
        drop(sock);
    });

    let desc = node.accept().await.unwrap();
    let stream = desc.stream();
    let mut buf = [0u8; 8];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"bye");
    client.await;

    // Connection is gone: the stream reports EOF, not an error.
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);

    node.close_connection(desc, false).await.unwrap();
    node.close();
    node.wait_for_exit().await;
}
