use chatrelay_client::ChatSender;
use chatrelay_core::{ChatRecord, DEFAULT_SERVER_PORT};
use clap::Parser;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "chatrelay-send")]
struct SendArgs {
    #[arg(long, env = "CHATRELAY_SERVER", default_value_t = format!("127.0.0.1:{DEFAULT_SERVER_PORT}"))]
    server: String,
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "lobby")]
    room: String,
    #[arg(long, allow_hyphen_values = true)]
    latitude: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    longitude: Option<f64>,
    /// Epoch milliseconds; defaults to now.
    #[arg(long)]
    timestamp: Option<i64>,
    #[arg(required = true, num_args = 1..)]
    text: Vec<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = SendArgs::parse();
    let record = ChatRecord {
        sender: args.name,
        chatroom: args.room,
        text: args.text.join(" "),
        timestamp_ms: args
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        latitude: args.latitude,
        longitude: args.longitude,
    };

    let sender = match ChatSender::connect(args.server.as_str()).await {
        Ok(sender) => sender,
        Err(err) => {
            error!("failed to reach {}: {}", args.server, err);
            std::process::exit(1);
        }
    };

    match sender.send(&record).await {
        Ok(bytes) => info!("sent {} bytes to {}", bytes, sender.server()),
        Err(err) => {
            error!("send failed: {}", err);
            std::process::exit(1);
        }
    }
}
