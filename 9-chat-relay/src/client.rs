use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    error::FrameError,
    protocol::{
        ClientFrame, ServerFrame, WireFormat, decode_server, encode_client, read_frame,
        write_frame,
    },
};

/// Longest server line the client buffers. User lists grow with the room.
const SERVER_FRAME_LIMIT: usize = 1 << 20;

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    send_frame(
        &mut writer,
        &ClientFrame::Join {
            name: args.name.clone(),
        },
        args.wire,
    )
    .await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input, args.wire).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn run_client_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    wire: WireFormat,
) -> Result<()> {
    loop {
        select! {
            server_line = read_frame(reader, SERVER_FRAME_LIMIT) => {
                if !handle_server_line(server_line, wire).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                let keep_going = handle_stdin_input(bytes_read, input, writer, wire).await?;
                input.clear();
                if !keep_going {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_line(
    line: Result<Option<String>, FrameError>,
    wire: WireFormat,
) -> Result<bool> {
    let line = match line {
        Ok(Some(line)) => line,
        Ok(None) => {
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        }
        Err(FrameError::Io(error)) => return Err(error).context("failed to read from server"),
        Err(error) => {
            warn!(%error, "ignoring unreadable server frame");
            return Ok(true);
        }
    };
    match decode_server(&line, wire) {
        Ok(frame) => write_stdout(&render_server_frame(&frame)).await?,
        // Unknown text lines are shown verbatim.
        Err(_) if wire == WireFormat::Text => write_stdout(&line).await?,
        Err(error) => warn!(%error, "ignoring malformed server frame"),
    }
    Ok(true)
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
    wire: WireFormat,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let frame = match ClientFrame::parse_command(input) {
        Ok(frame) => frame,
        Err(FrameError::Blank) => return Ok(true),
        Err(error) => {
            write_stderr(&format!("!!! {error}")).await?;
            return Ok(true);
        }
    };

    send_frame(writer, &frame, wire).await?;
    if frame == ClientFrame::Quit {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }
    Ok(true)
}

async fn send_frame(
    writer: &mut OwnedWriteHalf,
    frame: &ClientFrame,
    wire: WireFormat,
) -> Result<()> {
    let line = encode_client(frame, wire).context("failed to encode frame")?;
    write_frame(writer, &line).await?;
    Ok(())
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

pub fn render_server_frame(frame: &ServerFrame) -> String {
    match frame {
        ServerFrame::UserList { names } => format!("*** online: {}", names.join(", ")),
        other => other.to_text(),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
