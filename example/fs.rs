use tsuna::fs::FileHandle;

#[tokio::main]
async fn main() {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Cargo.toml".into());

    let file = FileHandle::open(path).await.unwrap();
    let head = file.read_from_offset(0, Some(64)).await.unwrap();
    println!("first {} bytes:", head.len());
    println!("{}", String::from_utf8_lossy(&head));
    file.close().await.unwrap();
}
