//! Multicast bus daemon connecting coordinators, clients and servers that
//! run as separate processes.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use stripekv::bus::BusDaemon;
use stripekv::{StripeKvError, logger_init, pf_error, set_me};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening socket.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Member-facing port.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 52700)]
    port: u16,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(addr)` on success or
    /// `Err(StripeKvError)` on any error.
    fn sanitize(&self) -> Result<SocketAddr, StripeKvError> {
        if self.port <= 1024 {
            Err(StripeKvError::msg(format!("invalid port {}", self.port)))
        } else if self.threads < 2 {
            Err(StripeKvError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            format!("{}:{}", self.bind_ip, self.port)
                .parse()
                .map_err(|e| {
                    StripeKvError::msg(format!(
                        "failed to parse bind_addr: bind_ip {} port {}: {}",
                        self.bind_ip, self.port, e
                    ))
                })
        }
    }
}

/// Actual main function of the bus daemon.
fn bus_main() -> Result<(), StripeKvError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let bind_addr = args.sanitize()?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })
    .map_err(|e| StripeKvError::msg(e.to_string()))?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-bus")
            .build()?;

        // enter tokio runtime, setup the daemon, and serve until terminated
        runtime.block_on(async move {
            let daemon = BusDaemon::new_and_setup(bind_addr).await?;
            daemon.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), StripeKvError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the bus daemon.
fn main() -> ExitCode {
    set_me("bus");
    logger_init();

    if let Err(ref e) = bus_main() {
        pf_error!("bus_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
