use clap::{Parser, Subcommand};
use env_logger::Env;
use log::debug;
use ringkv_lib::messages::{validate_key, validate_value, PeerAddr, ProtocolError, Request};
use ringkv_node::{NetworkClient, RpcError, TcpNetworkClient};
use std::error::Error;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

const MENU: &str = "\
************************MENU*************************
PRESS ***********************************************
1. TO ENTER *****************************************
2. TO SHOW ******************************************
3. TO DELETE ****************************************
4. TO EXIT ******************************************
*****************************************************
";

/// Talk to a RingKV node
#[derive(Debug, Parser)]
#[command(name = "ringkv-client", version)]
struct Cli {
    #[arg(long, env = "RINGKV_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port of the node to talk to. Prompted for when omitted.
    port: Option<u16>,

    /// Send a single request instead of opening the menu
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    Insert { key: String, value: String },
    Search { key: String },
    Delete { key: String },
}

impl Command {
    fn into_request(self) -> Result<Request, ProtocolError> {
        Ok(match self {
            Command::Insert { key, value } => Request::Insert {
                key: validate_key(&key)?,
                value: validate_value(&value)?,
            },
            Command::Search { key } => Request::Search {
                key: validate_key(&key)?,
            },
            Command::Delete { key } => Request::Delete {
                key: validate_key(&key)?,
            },
        })
    }
}

struct Session<C> {
    client: C,
    address: String,
}

impl<C: NetworkClient> Session<C> {
    fn new(client: C, node: PeerAddr) -> Self {
        Self {
            client,
            address: node.socket_address(),
        }
    }

    async fn send(&self, request: Request) -> Result<String, RpcError> {
        debug!("Sending `{}` to {}", request, self.address);
        self.client.call_node(&self.address, request).await
    }
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn prompt<R, W>(reader: &mut R, writer: &mut W, label: &str) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(label.as_bytes()).await?;
    writer.flush().await?;
    read_line(reader).await
}

async fn prompt_port<R, W>(reader: &mut R, writer: &mut W) -> Result<u16, Box<dyn Error + Send + Sync>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(answer) = prompt(reader, writer, "Give the port number of a node: ").await? else {
            return Err("no port given".into());
        };
        match answer.trim().parse::<u16>() {
            Ok(port) => return Ok(port),
            Err(_) => {
                writer
                    .write_all(format!("Not a port number: {}\n", answer).as_bytes())
                    .await?
            }
        }
    }
}

// Sends one request and prints the reply after `prefix`.
async fn exchange<C, W>(
    session: &Session<C>,
    request: Result<Request, ProtocolError>,
    writer: &mut W,
    prefix: &str,
) -> io::Result<()>
where
    C: NetworkClient,
    W: AsyncWrite + Unpin,
{
    let line = match request {
        Err(e) => format!("Invalid input: {}\n", e),
        Ok(request) => match session.send(request).await {
            Ok(reply) => format!("{}{}\n", prefix, reply),
            Err(e) => format!("Request failed: {}\n", e),
        },
    };
    writer.write_all(line.as_bytes()).await
}

async fn run_menu<C, R, W>(session: &Session<C>, reader: &mut R, writer: &mut W) -> io::Result<()>
where
    C: NetworkClient,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        writer.write_all(MENU.as_bytes()).await?;
        writer.flush().await?;
        let Some(choice) = read_line(reader).await? else {
            return Ok(());
        };

        match choice.trim() {
            "1" => {
                let Some(key) = prompt(reader, writer, "ENTER THE KEY: ").await? else {
                    return Ok(());
                };
                let Some(value) = prompt(reader, writer, "ENTER THE VALUE: ").await? else {
                    return Ok(());
                };
                let request = Command::Insert { key, value }.into_request();
                exchange(session, request, writer, "").await?;
            }
            "2" => {
                let Some(key) = prompt(reader, writer, "ENTER THE KEY: ").await? else {
                    return Ok(());
                };
                let request = Command::Search { key }.into_request();
                exchange(
                    session,
                    request,
                    writer,
                    "The value corresponding to the key is: ",
                )
                .await?;
            }
            "3" => {
                let Some(key) = prompt(reader, writer, "ENTER THE KEY: ").await? else {
                    return Ok(());
                };
                let request = Command::Delete { key }.into_request();
                exchange(session, request, writer, "").await?;
            }
            "4" => {
                writer.write_all(b"Exiting Client\n").await?;
                writer.flush().await?;
                return Ok(());
            }
            _ => writer.write_all(b"INCORRECT CHOICE\n").await?,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let mut stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();

    let port = match cli.port {
        Some(port) => port,
        None => prompt_port(&mut stdin, &mut stdout).await?,
    };
    let session = Session::new(TcpNetworkClient::default(), PeerAddr::new(cli.host, port));

    match cli.command {
        Some(command) => {
            let reply = session.send(command.into_request()?).await?;
            println!("{}", reply);
        }
        None => run_menu(&session, &mut stdin, &mut stdout).await?,
    }
    Ok(())
}
