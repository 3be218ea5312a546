use std::io;
use tsuna::client::{Expect, Request, request};

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://example.com/".into());

    match request(Request::get(url), Expect::text()).await {
        Ok(response) => {
            println!("> {} {}", response.status(), response.reason());
            for (name, value) in response.headers() {
                println!("> {name}: {value:?}");
            }
            println!("{}", response.body());
        }
        Err(err) => println!("request failed: {err}"),
    }

    Ok(())
}
