use clap::{Parser, Subcommand};

use tutorcall_lib::JoinOptions;

#[derive(Parser)]
#[command(name = "tutorcall", about = "Live tutoring session call room")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the development signaling relay
    Relay {
        /// Interface to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Relay port
        #[arg(long, default_value = "9850")]
        port: u16,
    },
    /// Join a session as a headless participant (commands on stdin)
    Join {
        /// Signaling base URL
        #[arg(long, default_value = "ws://127.0.0.1:9850")]
        url: String,

        /// Session (room) id
        #[arg(long)]
        session: String,

        #[arg(long)]
        user_id: u64,

        /// Auth token; the dev relay expects `<user_id>:<name>[:tutor]`
        #[arg(long)]
        token: String,

        /// Join without camera or microphone
        #[arg(long)]
        no_media: bool,

        /// STUN server URL (repeatable); replaces the defaults
        #[arg(long)]
        stun: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    tutorcall_lib::init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Relay { host, port } => tutorcall_lib::run_relay(&host, port)
            .await
            .map_err(|e| e.to_string()),
        Command::Join {
            url,
            session,
            user_id,
            token,
            no_media,
            stun,
        } => tutorcall_lib::run_join(JoinOptions {
            url,
            session_id: session,
            user_id,
            token,
            no_media,
            stun,
        })
        .await
        .map_err(|e| e.to_string()),
    };

    if let Err(e) = result {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}
