//! Raw connection check: subscribes to one run and prints every frame as received,
//! including the ones the client would discard.
//!
//! cargo run --example debug_connection -- ws://localhost:8000/ws/workflows run-123

use futures_util::{SinkExt, StreamExt};
use rs_workflow_stream::{
    router::{FrameOutcome, parse_frame},
    transport::with_token,
    types::ClientFrame,
};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let url = args
        .next()
        .unwrap_or_else(|| "ws://localhost:8000/ws/workflows".to_string());
    let run_id = args.next().unwrap_or_else(|| "run-123".to_string());
    let token = std::env::var("WORKFLOW_STREAM_TOKEN").ok();

    let url = with_token(&url::Url::parse(&url)?, "token", token.as_deref());
    println!(" Connecting to {}...", url.host_str().unwrap_or_default());

    let (mut ws, response) = connect_async(url.as_str()).await?;
    println!(" Connected ({})", response.status());

    let subscribe = ClientFrame::subscribe(&run_id).to_json()?;
    println!(" Sending: {}", subscribe);
    ws.send(Message::Text(subscribe.into())).await?;

    let deadline = tokio::time::sleep(Duration::from_secs(30));
    tokio::pin!(deadline);
    let mut count = 0;

    loop {
        tokio::select! {
            _ = &mut deadline => {
                println!(" Timeout reached");
                break;
            }
            message = ws.next() => {
                let Some(message) = message else {
                    println!(" Stream ended");
                    break;
                };
                match message? {
                    Message::Text(text) => {
                        count += 1;
                        let verdict = match parse_frame(text.as_str()) {
                            FrameOutcome::Event { event, timestamp_fallback } => format!(
                                "event {} {} {}{}",
                                event.run_id,
                                event.node_name,
                                event.phase,
                                if timestamp_fallback { " (receive time)" } else { "" }
                            ),
                            FrameOutcome::Control(control) => format!("control {:?}", control),
                            FrameOutcome::Rejected(reason) => format!("rejected: {}", reason),
                        };
                        println!("Frame #{}: {}", count, verdict);
                        println!("   {}", text.as_str());
                    }
                    Message::Close(frame) => {
                        println!(" Connection closed: {:?}", frame);
                        break;
                    }
                    other => println!(" Other frame: {:?}", other),
                }
            }
        }
    }

    let _ = ws.close(None).await;
    println!(" Received {} frames", count);
    Ok(())
}
