use clap::Parser;
use rescale_client::{rescale, RescaleOutcome, RESPONSE_TIMEOUT};

/// Signal a running MPI launcher to expand or shrink its process group.
/// Prints `1` if the launcher accepted the rescale and `0` otherwise.
#[derive(clap::Parser, Debug)]
#[command(version, about, long_about = None)]
struct RescaleClient {
    /// Launcher host or pod IP
    host: String,

    /// Launcher control port
    port: u16,

    /// Current process count
    old_procs: i32,

    /// Desired process count
    new_procs: i32,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = RescaleClient::parse();

    let accepted = matches!(
        rescale(
            &args.host,
            args.port,
            args.old_procs,
            args.new_procs,
            RESPONSE_TIMEOUT,
        )
        .await,
        Ok(RescaleOutcome::Applied)
    );
    print!("{}", u8::from(accepted));
}
