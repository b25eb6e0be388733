//! Echo server/client over engine handles

use kcp_bridge::{Engine, EngineConfig, KcpConfig, KcpListener, KcpStream};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <server|client> [address]", args[0]);
        eprintln!("Example: {} server 127.0.0.1:12345", args[0]);
        eprintln!("Example: {} client 127.0.0.1:12345", args[0]);
        return Ok(());
    }

    let mode = &args[1];
    let addr = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| "127.0.0.1:12345".to_string());

    let engine = Engine::start(EngineConfig::default())?;

    let result = match mode.as_str() {
        "server" => run_server(engine.clone(), addr).await,
        "client" => run_client(engine.clone(), addr).await,
        _ => {
            eprintln!("Mode must be 'server' or 'client'");
            Ok(())
        }
    };

    engine.stop();
    result
}

async fn run_server(engine: Engine, addr: String) -> Result<(), Box<dyn std::error::Error>> {
    let mut listener = KcpListener::with_config(engine, addr, KcpConfig::realtime());
    listener.bind().await?;

    info!("Server listening on {}", listener.local_addr().await?);

    loop {
        match listener.accept().await {
            Ok(stream) => {
                info!("New connection from {}", stream.remote_addr());

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream).await {
                        error!("Error handling client: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                if e.is_fatal() {
                    return Err(e.into());
                }
            }
        }
    }
}

async fn handle_client(stream: KcpStream) -> Result<(), Box<dyn std::error::Error>> {
    let peer_addr = stream.remote_addr().to_string();

    loop {
        match stream.read().await? {
            None => {
                info!("Client {} disconnected", peer_addr);
                break;
            }
            Some(data) => {
                info!("Received from {}: {}", peer_addr, String::from_utf8_lossy(&data).trim());
                stream.write_bytes(data).await?;
                stream.flush().await?;
            }
        }
    }

    Ok(())
}

async fn run_client(engine: Engine, addr: String) -> Result<(), Box<dyn std::error::Error>> {
    let mut stream = KcpStream::new(engine, addr);
    stream.set_fastest_config();
    stream.connect().await?;

    info!("Connected to server at {}", stream.remote_addr());

    let messages = [
        "Hello, KCP!",
        "This is a test message",
        "How are you doing?",
        "KCP is working great!",
        "Final test message",
    ];

    for message in messages {
        info!("Sending: {}", message);
        stream.write(message.as_bytes()).await?;

        // The echo is exactly as long as what was sent
        let response = stream.read_exact(message.len()).await?;
        let response = String::from_utf8_lossy(&response);

        if response == message {
            info!("✓ Echo verified: {}", response);
        } else {
            error!("✗ Echo mismatch: expected '{}', got '{}'", message, response);
        }

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }

    stream.close().await?;
    info!("Client finished successfully");
    Ok(())
}
