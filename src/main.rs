//! Terminal front end for the LAN chat node.
//!
//! Reads lines from stdin and says them; `/name <name>` changes the display
//! name, `/quit` (or ctrl-c) leaves. Everything the session produces is
//! printed as `<name> text`.

use anyhow::Result;
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};
use tokio::io::{AsyncBufReadExt, BufReader};

use lanchat::{ChatNode, NetConfig};

fn setup_logger() -> Result<()> {
    let config = ConfigBuilder::new()
        .set_time_offset_to_local()
        .unwrap()
        .build();
    TermLogger::init(
        LevelFilter::Info,
        config,
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logger()?;

    let (node, mut messages) = ChatNode::new(NetConfig::default());
    node.start();

    let printer = tokio::spawn(async move {
        while let Some(msg) = messages.recv().await {
            println!("<{}> {}", msg.name, msg.text);
        }
    });

    println!("lanchat: type to chat, /name <name> to rename, /quit to leave");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        if line.trim().is_empty() {
            continue;
        }
        if let Some(name) = line.strip_prefix("/name ") {
            if let Err(e) = node.set_name(name).await {
                eprintln!("name rejected: {}", e);
            }
        } else if line.trim() == "/quit" {
            break;
        } else if let Err(e) = node.say(&line).await {
            eprintln!("message rejected: {}", e);
        }
    }

    node.shutdown().await;
    printer.abort();
    Ok(())
}
