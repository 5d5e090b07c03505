//! `xeda`: the command-line front end over `xeda_core`'s flow runner and
//! design-space exploration engine.

mod cli;
mod project;

#[tokio::main]
async fn main() {
    let code = cli::run().await;
    std::process::exit(code);
}
