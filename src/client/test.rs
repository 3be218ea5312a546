use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, duplex},
    sync::mpsc::UnboundedReceiver,
};

use super::*;
use crate::notify::Mailbox;

fn ready_connect(io: DuplexStream) -> Connect<DuplexStream> {
    Box::pin(std::future::ready(Ok(io)))
}

/// Buffered exchange over an in-memory transport.
async fn buffered<T: Send + 'static>(
    req: Request,
    expect: Expect<T>,
    io: DuplexStream,
) -> Result<Response<T>, Error> {
    let built = build(&req).unwrap();
    let (events, rx) = Mailbox::channel();
    let handle = spawn_driver(ready_connect(io), built.wire, events);
    accumulate(rx, Arc::clone(&handle.response), expect).await
}

/// Streaming exchange over an in-memory transport.
fn streaming(req: Request, io: DuplexStream) -> (StreamHandle, UnboundedReceiver<StreamEvent>) {
    let built = build(&req).unwrap();
    let (events, rx) = Mailbox::channel();
    (spawn_driver(ready_connect(io), built.wire, events), rx)
}

async fn read_until<R: AsyncRead + Unpin>(io: &mut R, marker: &[u8]) -> Vec<u8> {
    let mut seen = Vec::new();
    let mut byte = [0u8; 1];
    while !seen.ends_with(marker) {
        io.read_exact(&mut byte).await.unwrap();
        seen.push(byte[0]);
    }
    seen
}

async fn read_head<R: AsyncRead + Unpin>(io: &mut R) -> String {
    String::from_utf8(read_until(io, b"\r\n\r\n").await).unwrap()
}

// ===== buffered mode =====

#[tokio::test]
async fn buffered_get_decodes_text() {
    let (client_io, mut server_io) = duplex(4096);
    let server = tokio::spawn(async move {
        let head = read_head(&mut server_io).await;
        assert!(head.starts_with("GET /greet HTTP/1.1\r\n"), "{head}");
        assert!(head.contains("Host: origin.test\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        server_io
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
    });

    let response = buffered(Request::get("http://origin.test/greet"), Expect::text(), client_io)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.reason(), "OK");
    assert_eq!(response.body(), "hello");
    server.await.unwrap();
}

#[tokio::test]
async fn buffered_post_sends_body_and_length() {
    let (client_io, mut server_io) = duplex(4096);
    let server = tokio::spawn(async move {
        let head = read_head(&mut server_io).await;
        assert!(head.starts_with("POST /up HTTP/1.1\r\n"), "{head}");
        assert!(head.contains("Content-Length: 7\r\n"));
        let mut body = [0u8; 7];
        server_io.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"payload");
        server_io
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();
    });

    let response = buffered(
        Request::post("http://origin.test/up").text("payload"),
        Expect::discard(),
        client_io,
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    server.await.unwrap();
}

#[tokio::test]
async fn buffered_chunked_response_reassembles() {
    let (client_io, mut server_io) = duplex(4096);
    let server = tokio::spawn(async move {
        read_head(&mut server_io).await;
        server_io
            .write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                  5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
            )
            .await
            .unwrap();
    });

    let response = buffered(Request::get("http://origin.test/"), Expect::text(), client_io)
        .await
        .unwrap();
    assert_eq!(response.body(), "hello world");
    server.await.unwrap();
}

#[tokio::test]
async fn buffered_eof_delimited_body() {
    let (client_io, mut server_io) = duplex(4096);
    let server = tokio::spawn(async move {
        read_head(&mut server_io).await;
        server_io
            .write_all(b"HTTP/1.1 200 OK\r\n\r\nuntil the connection closes")
            .await
            .unwrap();
    });

    let response = buffered(Request::get("http://origin.test/"), Expect::text(), client_io)
        .await
        .unwrap();
    assert_eq!(response.body(), "until the connection closes");
    server.await.unwrap();
}

#[tokio::test]
async fn bad_status_carries_the_full_response() {
    let (client_io, mut server_io) = duplex(4096);
    let server = tokio::spawn(async move {
        read_head(&mut server_io).await;
        server_io
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\n\r\nnope")
            .await
            .unwrap();
    });

    let result =
        buffered(Request::get("http://origin.test/x"), Expect::text(), client_io).await;
    let Err(Error::BadStatus(response)) = result else {
        panic!("expected bad status")
    };
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(&response.body()[..], b"nope");
    server.await.unwrap();
}

#[tokio::test]
async fn discard_rejects_unexpected_body() {
    let (client_io, mut server_io) = duplex(4096);
    let server = tokio::spawn(async move {
        read_head(&mut server_io).await;
        server_io
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nsurprise")
            .await
            .unwrap();
    });

    let result =
        buffered(Request::get("http://origin.test/"), Expect::discard(), client_io).await;
    assert!(matches!(result, Err(Error::UnexpectedResponseBody(_))));
    server.await.unwrap();
}

#[tokio::test]
async fn opaque_ignores_any_body() {
    let (client_io, mut server_io) = duplex(4096);
    let server = tokio::spawn(async move {
        read_head(&mut server_io).await;
        server_io
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nwhatever")
            .await
            .unwrap();
    });

    buffered(Request::get("http://origin.test/"), Expect::opaque(), client_io)
        .await
        .unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn bytes_passes_the_raw_body_through() {
    let (client_io, mut server_io) = duplex(4096);
    let server = tokio::spawn(async move {
        read_head(&mut server_io).await;
        server_io
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\n\x00\xffhi")
            .await
            .unwrap();
    });

    let response = buffered(Request::get("http://origin.test/raw"), Expect::bytes(), client_io)
        .await
        .unwrap();
    assert_eq!(&response.body()[..], b"\x00\xffhi");
    server.await.unwrap();
}

#[tokio::test]
async fn decoder_failure_is_unexpected_body() {
    let (client_io, mut server_io) = duplex(4096);
    let server = tokio::spawn(async move {
        read_head(&mut server_io).await;
        server_io
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n{}")
            .await
            .unwrap();
    });

    let expect = Expect::decoded(|_body| Err::<(), _>("not the shape I wanted".into()));
    let result = buffered(Request::get("http://origin.test/"), expect, client_io).await;
    let Err(Error::UnexpectedResponseBody(detail)) = result else {
        panic!("expected decode failure")
    };
    assert_eq!(detail, "not the shape I wanted");
    server.await.unwrap();
}

#[tokio::test]
async fn text_rejects_invalid_utf8() {
    let (client_io, mut server_io) = duplex(4096);
    let server = tokio::spawn(async move {
        read_head(&mut server_io).await;
        server_io
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n\xff\xfe")
            .await
            .unwrap();
    });

    let result = buffered(Request::get("http://origin.test/"), Expect::text(), client_io).await;
    assert!(matches!(result, Err(Error::UnexpectedResponseBody(_))));
    server.await.unwrap();
}

#[tokio::test]
async fn head_request_reads_no_body() {
    let (client_io, mut server_io) = duplex(4096);
    let server = tokio::spawn(async move {
        let head = read_head(&mut server_io).await;
        assert!(head.starts_with("HEAD / HTTP/1.1\r\n"), "{head}");
        server_io
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n")
            .await
            .unwrap();
    });

    let response = buffered(
        Request::new(Method::HEAD, "http://origin.test/"),
        Expect::discard(),
        client_io,
    )
    .await
    .unwrap();
    assert_eq!(response.headers()["content-length"], "1234");
    server.await.unwrap();
}

#[tokio::test]
async fn repeated_response_headers_fold_to_last() {
    let (client_io, mut server_io) = duplex(4096);
    let server = tokio::spawn(async move {
        read_head(&mut server_io).await;
        server_io
            .write_all(
                b"HTTP/1.1 200 OK\r\nX-Dup: one\r\nX-DUP: two\r\nContent-Length: 0\r\n\r\n",
            )
            .await
            .unwrap();
    });

    let response = buffered(Request::get("http://origin.test/"), Expect::discard(), client_io)
        .await
        .unwrap();
    assert_eq!(response.headers()["x-dup"], "two");
    assert_eq!(response.headers().get_all("x-dup").iter().count(), 1);
    server.await.unwrap();
}

#[tokio::test]
async fn server_close_before_head_is_unknown() {
    let (client_io, mut server_io) = duplex(4096);
    let server = tokio::spawn(async move {
        read_head(&mut server_io).await;
        // drop without answering
    });

    let result = buffered(Request::get("http://origin.test/"), Expect::text(), client_io).await;
    assert!(matches!(result, Err(Error::Unknown(_))));
    server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn deadline_settles_as_timeout() {
    let (client_io, mut server_io) = duplex(4096);
    tokio::spawn(async move {
        read_head(&mut server_io).await;
        // hold the connection open without responding
        std::future::pending::<()>().await;
    });

    let req = Request::get("http://origin.test/slow").timeout(Duration::from_secs(3));
    let result = buffered(req, Expect::text(), client_io).await;
    assert!(matches!(result, Err(Error::Timeout)));
}

// ===== construction stage =====

#[tokio::test]
async fn construction_failures_settle_without_connecting() {
    let result = request(Request::get("https://secure.test/"), Expect::opaque()).await;
    assert!(matches!(result, Err(Error::BadUrl(_))));

    let result = request(Request::get("not a url"), Expect::opaque()).await;
    assert!(matches!(result, Err(Error::BadUrl(_))));

    let req = Request::get("http://origin.test/").header("bad name", "v");
    let result = request(req, Expect::opaque()).await;
    assert!(matches!(result, Err(Error::BadHeaders(_))));

    let req = Request::post("http://origin.test/").stream();
    let result = request(req, Expect::opaque()).await;
    assert!(matches!(result, Err(Error::Unknown(_))));
}

// ===== streaming mode =====

#[tokio::test]
async fn stream_post_with_declared_length() {
    let (client_io, mut server_io) = duplex(4096);
    let req = Request::post("http://origin.test/up")
        .stream()
        .header("content-length", "30");
    let (handle, mut rx) = streaming(req, client_io);

    let server = tokio::spawn(async move {
        let head = read_head(&mut server_io).await;
        assert!(head.contains("Content-Length: 30\r\n"), "{head}");
        assert_eq!(head.matches("Content-Length").count(), 1);
        let mut body = [0u8; 30];
        server_io.read_exact(&mut body).await.unwrap();
        server_io
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
        body
    });

    for chunk in [&b"aaaaaaaaaa"[..], b"bbbbbbbbbb", b"cccccccccc"] {
        handle.send_chunk(Bytes::copy_from_slice(chunk)).await.unwrap();
        assert!(matches!(rx.recv().await, Some(StreamEvent::SentChunk)));
    }

    // declared count reached, no finish needed
    let mut received = Vec::new();
    loop {
        match rx.recv().await {
            Some(StreamEvent::ReceivedChunk { data, response }) => {
                assert_eq!(response.status, StatusCode::OK);
                received.extend_from_slice(&data);
            }
            Some(StreamEvent::Done) => break,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(received, b"ok");
    assert_eq!(handle.response().unwrap().status, StatusCode::OK);

    let body = server.await.unwrap();
    assert_eq!(&body[..10], b"aaaaaaaaaa");
    assert_eq!(&body[20..], b"cccccccccc");
}

#[tokio::test]
async fn stream_post_chunk_framed_until_finish() {
    let (client_io, mut server_io) = duplex(4096);
    let req = Request::post("http://origin.test/up").stream();
    let (handle, mut rx) = streaming(req, client_io);

    let server = tokio::spawn(async move {
        let head = read_head(&mut server_io).await;
        assert!(head.contains("Transfer-Encoding: chunked\r\n"), "{head}");
        let body = read_until(&mut server_io, b"0\r\n\r\n").await;
        assert_eq!(body, b"3\r\nxyz\r\n4\r\nwxyz\r\n0\r\n\r\n");
        server_io
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();
    });

    handle.send_chunk(Bytes::from_static(b"xyz")).await.unwrap();
    assert!(matches!(rx.recv().await, Some(StreamEvent::SentChunk)));
    handle.send_chunk(Bytes::from_static(b"wxyz")).await.unwrap();
    assert!(matches!(rx.recv().await, Some(StreamEvent::SentChunk)));
    handle.finish().await.unwrap();

    assert!(matches!(rx.recv().await, Some(StreamEvent::Done)));
    server.await.unwrap();
}

#[tokio::test]
async fn chunks_queued_before_connect_are_flushed() {
    let (client_io, mut server_io) = duplex(4096);
    let req = Request::post("http://origin.test/up")
        .stream()
        .header("content-length", "3");
    let (handle, mut rx) = streaming(req, client_io);

    // queue immediately, before the exchange has a transport
    handle.send_chunk(Bytes::from_static(b"abc")).await.unwrap();

    let server = tokio::spawn(async move {
        read_head(&mut server_io).await;
        let mut body = [0u8; 3];
        server_io.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"abc");
        server_io
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();
    });

    assert!(matches!(rx.recv().await, Some(StreamEvent::SentChunk)));
    assert!(matches!(rx.recv().await, Some(StreamEvent::Done)));
    server.await.unwrap();
}

#[tokio::test]
async fn abort_reports_once_and_closes_the_stream() {
    let (client_io, mut server_io) = duplex(4096);
    let req = Request::post("http://origin.test/up").stream();
    let (handle, mut rx) = streaming(req, client_io);
    // let the driver write the head before the abort lands (review F4)
    tokio::task::yield_now().await;

    let server = tokio::spawn(async move {
        read_head(&mut server_io).await;
    });

    handle.abort().await.unwrap();
    handle.abort().await.unwrap();

    assert!(matches!(rx.recv().await, Some(StreamEvent::Aborted)));
    assert_eq!(rx.recv().await.map(|e| format!("{e:?}")), None);

    let result = handle.send_chunk(Bytes::from_static(b"late")).await;
    assert!(matches!(result, Err(Error::Unknown(_))));
    server.await.unwrap();
}

#[tokio::test]
async fn dropped_handle_tears_down_silently() {
    let (client_io, mut server_io) = duplex(4096);
    let req = Request::post("http://origin.test/up").stream();
    let (handle, mut rx) = streaming(req, client_io);

    let server = tokio::spawn(async move {
        read_head(&mut server_io).await;
        let mut rest = Vec::new();
        server_io.read_to_end(&mut rest).await.unwrap();
    });

    drop(handle);
    assert!(rx.recv().await.is_none());
    server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stream_deadline_reports_single_error() {
    let (client_io, mut server_io) = duplex(4096);
    let req = Request::post("http://origin.test/up")
        .stream()
        .timeout(Duration::from_secs(3));
    let (_handle, mut rx) = streaming(req, client_io);

    tokio::spawn(async move {
        read_head(&mut server_io).await;
        std::future::pending::<()>().await;
    });

    assert!(matches!(rx.recv().await, Some(StreamEvent::Error(Error::Timeout))));
    assert!(rx.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn deadline_after_done_fires_nothing() {
    let (client_io, mut server_io) = duplex(4096);
    let req = Request::post("http://origin.test/up")
        .stream()
        .timeout(Duration::from_secs(3));
    let (handle, mut rx) = streaming(req, client_io);

    let server = tokio::spawn(async move {
        read_head(&mut server_io).await;
        read_until(&mut server_io, b"0\r\n\r\n").await;
        server_io
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();
    });

    handle.send_chunk(Bytes::from_static(b"abc")).await.unwrap();
    assert!(matches!(rx.recv().await, Some(StreamEvent::SentChunk)));
    handle.finish().await.unwrap();
    assert!(matches!(rx.recv().await, Some(StreamEvent::Done)));
    server.await.unwrap();

    // the timer lapses long after the exchange ended
    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn open_stream_accepts_buffered_bodies() {
    let (client_io, mut server_io) = duplex(4096);
    let req = Request::post("http://origin.test/up").text("hi");
    let (handle, mut rx) = streaming(req, client_io);

    let server = tokio::spawn(async move {
        let head = read_head(&mut server_io).await;
        let mut body = [0u8; 2];
        server_io.read_exact(&mut body).await.unwrap();
        assert!(head.contains("Content-Length: 2\r\n"));
        server_io
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndata")
            .await
            .unwrap();
    });

    let mut received = Vec::new();
    loop {
        match rx.recv().await {
            Some(StreamEvent::ReceivedChunk { data, .. }) => received.extend_from_slice(&data),
            Some(StreamEvent::Done) => break,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(received, b"data");
    assert_eq!(handle.response().unwrap().status, StatusCode::OK);
    server.await.unwrap();
}

// ===== over tcp =====

#[tokio::test]
async fn request_over_tcp() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_head(&mut socket).await;
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nyay")
            .await
            .unwrap();
    });

    let response = request(Request::get(format!("http://{addr}/ping")), Expect::text())
        .await
        .unwrap();
    assert_eq!(response.body(), "yay");
    server.await.unwrap();
}

#[tokio::test]
async fn canceled_request_surfaces_as_aborted() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_head(&mut socket).await;
        std::future::pending::<()>().await;
    });

    let task = request(Request::get(format!("http://{addr}/stall")), Expect::opaque());
    task.cancel_handle().cancel();
    assert!(matches!(task.await, Err(Error::Aborted)));
}
