//! Bot mode: NDJSON over stdin/stdout.
//!
//! One writer task serializes every outbound frame; the reader parses one
//! line at a time and spawns handlers so a slow one cannot stall the loop.
//! A malformed line is fatal (exit code 1) so the host restarts cleanly.

use std::sync::Arc;

use {
    tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    tracing::{debug, error},
};

use {
    crate::app::App,
    hearth_protocol::{encode_outbound, parse_inbound, Outbound},
};

/// Run the stdio protocol loop until stdin closes (clean shutdown) or a
/// malformed line arrives (fatal, error code).
pub async fn run(
    app: Arc<App>,
    mut outbound_rx: tokio::sync::mpsc::UnboundedReceiver<Outbound>,
) -> Result<(), i32> {
    // Single writer: outbound frames are serialized in channel order.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = outbound_rx.recv().await {
            let mut line = encode_outbound(&frame);
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_inbound(&line) {
                Ok(Some(inbound)) => {
                    let app = Arc::clone(&app);
                    tokio::spawn(async move {
                        app.handle_inbound(inbound).await;
                    });
                },
                Ok(None) => {}, // empty line
                Err(e) => {
                    // Corrupt stream: fail fast so the host restarts us.
                    error!(error = %e, "fatal protocol parse error");
                    return Err(1);
                },
            },
            Ok(None) => {
                debug!("stdin closed, shutting down");
                break;
            },
            Err(e) => {
                error!(error = %e, "stdin read error");
                return Err(1);
            },
        }
    }

    app.scheduler.stop();
    drop(app);
    writer.abort();
    Ok(())
}
