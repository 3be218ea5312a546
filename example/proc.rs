use std::time::Duration;
use tsuna::proc::{EnvVars, Run, run};

#[tokio::main]
async fn main() {
    env_logger::init();

    let ls = Run::new("ls")
        .arg("-la")
        .env(EnvVars::Extend(vec![("LC_ALL".into(), "C".into())]))
        .limit(Duration::from_secs(5));

    match run(ls).await {
        Ok(output) => print!("{}", String::from_utf8_lossy(&output.stdout)),
        Err(err) => println!("run failed: {err}"),
    }
}
