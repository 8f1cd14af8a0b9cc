use futures::StreamExt;
use std::error::Error;
use std::io::{self, Write};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;

use crate::protocol::{RespCodec, RespValue};

pub async fn run_client(address: &str) -> Result<(), Box<dyn Error>> {
    println!("Connecting to {}...", address);

    let stream = TcpStream::connect(address).await?;
    println!("Connected! Type commands (or 'QUIT' to exit):");

    let (reader, mut writer) = stream.into_split();
    let mut replies = FramedRead::new(reader, RespCodec);
    let mut line = String::new();

    loop {
        print!("repl-cache> ");
        io::stdout().flush()?;

        line.clear();
        if io::stdin().read_line(&mut line)? == 0 {
            break;
        }

        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        if command.eq_ignore_ascii_case("QUIT") {
            break;
        }

        writer.write_all(format!("{}\r\n", command).as_bytes()).await?;
        writer.flush().await?;

        match replies.next().await {
            Some(reply) => display_response(&reply?, 0),
            None => {
                println!("Server closed the connection");
                break;
            }
        }
    }

    println!("Goodbye!");
    Ok(())
}

fn display_response(reply: &RespValue, depth: usize) {
    let indent = "  ".repeat(depth);
    match reply {
        RespValue::SimpleString(s) => println!("{}{}", indent, s),
        RespValue::Error(e) => println!("{}ERROR: {}", indent, e),
        RespValue::Integer(i) => println!("{}(integer) {}", indent, i),
        RespValue::BulkString(Some(s)) => println!("{}\"{}\"", indent, s),
        RespValue::BulkString(None) => println!("{}(nil)", indent),
        RespValue::Array(items) if items.is_empty() => println!("{}(empty)", indent),
        RespValue::Array(items) => {
            for item in items {
                display_response(item, depth + 1);
            }
        }
    }
}
