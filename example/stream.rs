use tsuna::{
    Mailbox,
    client::{Request, StreamEvent, open_stream},
};

#[tokio::main]
async fn main() {
    env_logger::init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://httpbin.org/post".into());

    let (events, mut rx) = Mailbox::channel();
    let handle = open_stream(Request::post(url).stream(), events)
        .await
        .unwrap();

    for part in ["chunk one\n", "chunk two\n", "chunk three\n"] {
        handle.send_chunk(part.into()).await.unwrap();
    }
    handle.finish().await.unwrap();

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::ReceivedChunk { data, .. } => {
                print!("{}", String::from_utf8_lossy(&data));
            }
            StreamEvent::Done => println!("> done"),
            event => println!("> {event:?}"),
        }
    }
}
